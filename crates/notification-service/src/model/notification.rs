//! 通知值对象与状态规则

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{
    Action, Category, DeliveryMethod, DeliveryState, NotificationMetadata, NotificationType,
    Priority, UserRole,
};
use crate::error::{NotificationError, Result};

/// 单渠道投递状态
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryStatus {
    pub status: DeliveryState,
    /// 已发起的投递次数，只增不减
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
}

impl DeliveryStatus {
    /// 记录一次投递尝试
    pub fn record_attempt(&mut self, now: DateTime<Utc>) {
        self.attempts = self.attempts.saturating_add(1);
        self.last_attempt = Some(now);
    }

    pub fn mark_delivered(&mut self, now: DateTime<Utc>) {
        self.status = DeliveryState::Delivered;
        self.delivered_at = Some(now);
        self.error = None;
    }

    /// 标记失败；已送达的状态不会被回退
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        if self.status == DeliveryState::Delivered {
            return;
        }
        self.status = DeliveryState::Failed;
        self.error = Some(error.into());
    }

    /// 重试清扫显式重新入队：Failed -> Pending，尝试次数保持不变
    pub fn requeue(&mut self) {
        if self.status == DeliveryState::Failed {
            self.status = DeliveryState::Pending;
        }
    }

    pub fn is_delivered(&self) -> bool {
        self.status == DeliveryState::Delivered
    }

    /// 并入已持久化的状态：次数与上次尝试时间取较大者，送达不回退
    pub fn absorb(&mut self, stored: &DeliveryStatus) {
        let attempts = self.attempts.max(stored.attempts);
        let last_attempt = self.last_attempt.max(stored.last_attempt);

        if stored.is_delivered() && !self.is_delivered() {
            *self = stored.clone();
        } else if !self.is_delivered() && stored.attempts > self.attempts {
            self.status = stored.status;
            self.error = stored.error.clone();
        }
        self.attempts = attempts;
        self.last_attempt = last_attempt;
    }
}

/// 通知
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    pub category: Category,
    #[serde(rename = "type")]
    pub notification_type: NotificationType,
    #[serde(rename = "userID")]
    pub user_id: String,
    pub user_role: UserRole,
    pub title: String,
    pub content: String,
    /// 有序且唯一
    pub delivery_methods: Vec<DeliveryMethod>,
    pub priority: Priority,
    #[serde(default)]
    pub actions: Vec<Action>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<NotificationMetadata>,
    #[serde(default)]
    pub delivery_status: BTreeMap<DeliveryMethod, DeliveryStatus>,
    pub status: DeliveryState,
    #[serde(default)]
    pub is_read: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Notification {
    /// 创建通知，类别由类型推导，默认仅站内信渠道
    pub fn new(
        notification_type: NotificationType,
        user_id: impl Into<String>,
        user_role: UserRole,
        title: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7().to_string(),
            category: notification_type.category(),
            notification_type,
            user_id: user_id.into(),
            user_role,
            title: title.into(),
            content: content.into(),
            delivery_methods: vec![DeliveryMethod::InApp],
            priority: Priority::default(),
            actions: Vec::new(),
            metadata: None,
            delivery_status: BTreeMap::new(),
            status: DeliveryState::Pending,
            is_read: false,
            read_at: None,
            created_at: now,
            updated_at: now,
            expires_at: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// 设置投递渠道，重复项只保留首次出现
    pub fn with_delivery_methods(mut self, methods: impl IntoIterator<Item = DeliveryMethod>) -> Self {
        self.set_delivery_methods(methods);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    pub fn with_metadata(mut self, metadata: impl Into<NotificationMetadata>) -> Self {
        self.metadata = Some(metadata.into());
        self
    }

    pub fn with_expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn set_delivery_methods(&mut self, methods: impl IntoIterator<Item = DeliveryMethod>) {
        self.delivery_methods.clear();
        for method in methods {
            if !self.delivery_methods.contains(&method) {
                self.delivery_methods.push(method);
            }
        }
    }

    /// 校验必填字段与渠道集合
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(NotificationError::Validation("id 不能为空".to_string()));
        }
        if self.user_id.trim().is_empty() {
            return Err(NotificationError::Validation("userID 不能为空".to_string()));
        }
        if self.title.trim().is_empty() {
            return Err(NotificationError::Validation("title 不能为空".to_string()));
        }
        if self.content.trim().is_empty() {
            return Err(NotificationError::Validation("content 不能为空".to_string()));
        }
        if self.delivery_methods.is_empty() {
            return Err(NotificationError::Validation(
                "至少需要一个投递渠道".to_string(),
            ));
        }
        for (idx, method) in self.delivery_methods.iter().enumerate() {
            if self.delivery_methods[..idx].contains(method) {
                return Err(NotificationError::Validation(format!(
                    "投递渠道重复: {method}"
                )));
            }
        }
        if self.notification_type.category() != self.category {
            return Err(NotificationError::Validation(format!(
                "类型 {} 不属于类别 {}",
                self.notification_type, self.category
            )));
        }
        if let Some(metadata) = &self.metadata
            && metadata.category() != self.category
        {
            return Err(NotificationError::Validation(format!(
                "元数据类别 {} 与通知类别 {} 不一致",
                metadata.category(),
                self.category
            )));
        }
        Ok(())
    }

    /// 消息代理路由键：`{userRole}.{category}.{type}`
    pub fn routing_key(&self) -> String {
        format!(
            "{}.{}.{}",
            self.user_role, self.category, self.notification_type
        )
    }

    pub fn status_for(&self, method: DeliveryMethod) -> Option<&DeliveryStatus> {
        self.delivery_status.get(&method)
    }

    /// 获取渠道状态，不存在时以 Pending 初始化
    pub fn delivery_status_mut(&mut self, method: DeliveryMethod) -> &mut DeliveryStatus {
        self.updated_at = Utc::now();
        self.delivery_status.entry(method).or_default()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    pub fn mark_as_read(&mut self, now: DateTime<Utc>) {
        if !self.is_read {
            self.is_read = true;
            self.read_at = Some(now);
            self.updated_at = now;
        }
    }

    /// 依据面向用户渠道的状态重新推导整体状态
    ///
    /// 任一渠道送达 -> Delivered；否则已过期 -> Expired；
    /// 全部渠道均失败 -> Failed；其余 -> Pending。
    pub fn refresh_status(&mut self, now: DateTime<Utc>) {
        let channels: Vec<DeliveryState> = self
            .delivery_methods
            .iter()
            .filter(|m| m.is_user_facing())
            .map(|m| {
                self.delivery_status
                    .get(m)
                    .map(|s| s.status)
                    .unwrap_or_default()
            })
            .collect();

        self.status = if channels.iter().any(|s| *s == DeliveryState::Delivered) {
            DeliveryState::Delivered
        } else if self.is_expired(now) {
            DeliveryState::Expired
        } else if !channels.is_empty() && channels.iter().all(|s| *s == DeliveryState::Failed) {
            DeliveryState::Failed
        } else {
            DeliveryState::Pending
        };
    }

    /// 编码为消息代理负载
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// 从消息代理负载解码
    pub fn decode(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ActionType, DebateMetadata};
    use chrono::Duration;

    fn sample() -> Notification {
        Notification::new(
            NotificationType::RoundAssignment,
            "42",
            UserRole::Student,
            "第三轮对阵已公布",
            "请于 14:00 前到达 B204 教室",
        )
        .with_delivery_methods([DeliveryMethod::Email, DeliveryMethod::InApp])
    }

    #[test]
    fn test_new_derives_category() {
        let n = sample();
        assert_eq!(n.category, Category::Debate);
        assert_eq!(n.status, DeliveryState::Pending);
        assert!(n.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_fields() {
        let mut n = sample();
        n.title = "  ".to_string();
        assert!(matches!(n.validate(), Err(NotificationError::Validation(_))));

        let mut n = sample();
        n.user_id.clear();
        assert!(n.validate().is_err());

        let mut n = sample();
        n.delivery_methods.clear();
        assert!(n.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_duplicate_methods() {
        let mut n = sample();
        n.delivery_methods.push(DeliveryMethod::Email);
        assert!(n.validate().is_err());
    }

    #[test]
    fn test_set_delivery_methods_dedups() {
        let n = sample().with_delivery_methods([
            DeliveryMethod::Email,
            DeliveryMethod::InApp,
            DeliveryMethod::Email,
        ]);
        assert_eq!(
            n.delivery_methods,
            vec![DeliveryMethod::Email, DeliveryMethod::InApp]
        );
    }

    #[test]
    fn test_validate_rejects_category_mismatch() {
        let mut n = sample();
        n.category = Category::Report;
        assert!(n.validate().is_err());

        let n = sample().with_metadata(crate::model::ReportMetadata::default());
        assert!(n.validate().is_err());
    }

    #[test]
    fn test_routing_key() {
        assert_eq!(sample().routing_key(), "student.debate.round_assignment");
    }

    #[test]
    fn test_mark_failed_never_downgrades_delivered() {
        let mut status = DeliveryStatus::default();
        let now = Utc::now();
        status.record_attempt(now);
        status.mark_delivered(now);
        status.mark_failed("late error");
        assert!(status.is_delivered());
        assert_eq!(status.error, None);
    }

    #[test]
    fn test_absorb_never_loses_progress() {
        let now = Utc::now();
        let mut stored = DeliveryStatus::default();
        stored.record_attempt(now - Duration::minutes(5));
        stored.mark_failed("smtp 421");

        let mut fresh = DeliveryStatus::default();
        fresh.absorb(&stored);
        assert_eq!(fresh, stored);

        let mut delivered = DeliveryStatus::default();
        delivered.record_attempt(now);
        delivered.mark_delivered(now);
        let mut pending = DeliveryStatus::default();
        pending.absorb(&delivered);
        assert!(pending.is_delivered());
        assert_eq!(pending.attempts, 1);

        // 本地已送达时不被旧的失败覆盖
        let mut local = delivered.clone();
        local.absorb(&stored);
        assert!(local.is_delivered());
        assert_eq!(local.attempts, 1);
        assert_eq!(local.last_attempt, Some(now));
    }

    #[test]
    fn test_requeue_keeps_attempts() {
        let mut status = DeliveryStatus::default();
        status.record_attempt(Utc::now());
        status.mark_failed("smtp down");
        status.requeue();
        assert_eq!(status.status, DeliveryState::Pending);
        assert_eq!(status.attempts, 1);
    }

    #[test]
    fn test_refresh_status() {
        let now = Utc::now();
        let mut n = sample();

        n.refresh_status(now);
        assert_eq!(n.status, DeliveryState::Pending);

        n.delivery_status_mut(DeliveryMethod::Email).mark_failed("x");
        n.refresh_status(now);
        assert_eq!(n.status, DeliveryState::Pending);

        n.delivery_status_mut(DeliveryMethod::InApp).mark_failed("y");
        n.refresh_status(now);
        assert_eq!(n.status, DeliveryState::Failed);

        n.delivery_status_mut(DeliveryMethod::InApp).status = DeliveryState::Delivered;
        n.refresh_status(now);
        assert_eq!(n.status, DeliveryState::Delivered);

        // Queue 渠道不参与整体状态
        let mut n = sample();
        n.delivery_status_mut(DeliveryMethod::Queue)
            .mark_delivered(now);
        n.refresh_status(now);
        assert_eq!(n.status, DeliveryState::Pending);
    }

    #[test]
    fn test_refresh_status_expired() {
        let now = Utc::now();
        let mut n = sample().with_expires_at(now - Duration::minutes(1));
        n.refresh_status(now);
        assert_eq!(n.status, DeliveryState::Expired);
    }

    #[test]
    fn test_mark_as_read() {
        let now = Utc::now();
        let mut n = sample();
        n.mark_as_read(now);
        n.mark_as_read(now + Duration::hours(1));
        assert!(n.is_read);
        assert_eq!(n.read_at, Some(now));
    }

    #[test]
    fn test_encode_decode_preserves_every_field() {
        let now = Utc::now();
        let mut n = sample()
            .with_priority(Priority::High)
            .with_expires_at(now + Duration::days(30))
            .with_action(
                Action::new(ActionType::Confirm, "确认")
                    .with_data(serde_json::json!({ "round": 3 })),
            )
            .with_metadata(DebateMetadata {
                tournament_id: "t-1".to_string(),
                round_number: 3,
                room: Some("B204".to_string()),
                ..Default::default()
            });
        let email = n.delivery_status_mut(DeliveryMethod::Email);
        email.record_attempt(now);
        email.mark_failed("smtp timeout");
        n.delivery_status_mut(DeliveryMethod::InApp).mark_delivered(now);
        n.refresh_status(now);
        n.mark_as_read(now);

        let decoded = Notification::decode(&n.encode().unwrap()).unwrap();
        assert_eq!(decoded, n);
    }

    #[test]
    fn test_decode_malformed_payload() {
        let err = Notification::decode(b"{not json").unwrap_err();
        assert!(matches!(err, NotificationError::Serialization(_)));
    }
}
