//! 通知元数据记录与存储 trait
//!
//! 元数据存储是已读状态与各渠道投递状态的权威来源；消息代理中的
//! 通知只是投递时的快照，读取时以元数据覆盖。

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;

use crate::error::Result;
use crate::model::{
    Action, Category, DeliveryMethod, DeliveryState, DeliveryStatus, Notification,
    NotificationMetadata, NotificationType, Priority, UserRole,
};

/// notification_metadata 表的一行
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct MetadataRecord {
    pub id: String,
    pub user_id: String,
    pub user_role: UserRole,
    pub category: Category,
    pub notification_type: NotificationType,
    pub title: String,
    pub content: String,
    pub actions: Json<Vec<Action>>,
    pub status: DeliveryState,
    pub priority: Priority,
    pub delivery_methods: Json<Vec<DeliveryMethod>>,
    pub delivery_status: Json<BTreeMap<DeliveryMethod, DeliveryStatus>>,
    pub metadata: Option<Json<NotificationMetadata>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_read: bool,
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MetadataRecord {
    pub fn from_notification(notification: &Notification) -> Self {
        Self {
            id: notification.id.clone(),
            user_id: notification.user_id.clone(),
            user_role: notification.user_role,
            category: notification.category,
            notification_type: notification.notification_type,
            title: notification.title.clone(),
            content: notification.content.clone(),
            actions: Json(notification.actions.clone()),
            status: notification.status,
            priority: notification.priority,
            delivery_methods: Json(notification.delivery_methods.clone()),
            delivery_status: Json(notification.delivery_status.clone()),
            metadata: notification.metadata.clone().map(Json),
            expires_at: notification.expires_at,
            is_read: notification.is_read,
            read_at: notification.read_at,
            created_at: notification.created_at,
            updated_at: notification.updated_at,
        }
    }

    pub fn into_notification(self) -> Notification {
        Notification {
            id: self.id,
            category: self.category,
            notification_type: self.notification_type,
            user_id: self.user_id,
            user_role: self.user_role,
            title: self.title,
            content: self.content,
            delivery_methods: self.delivery_methods.0,
            priority: self.priority,
            actions: self.actions.0,
            metadata: self.metadata.map(|m| m.0),
            delivery_status: self.delivery_status.0,
            status: self.status,
            is_read: self.is_read,
            read_at: self.read_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
            expires_at: self.expires_at,
        }
    }

    /// 用元数据覆盖从消息代理读到的通知
    ///
    /// 已读状态、整体状态以元数据为准；渠道状态按渠道逐个覆盖，
    /// 元数据中没有的渠道保留代理侧的值。元数据负载为空时不清除代理侧负载。
    pub fn merge_into(&self, notification: &mut Notification) {
        notification.is_read = self.is_read;
        notification.read_at = self.read_at;
        notification.status = self.status;
        for (method, status) in self.delivery_status.iter() {
            notification.delivery_status.insert(*method, status.clone());
        }
        if let Some(metadata) = &self.metadata {
            notification.metadata = Some(metadata.0.clone());
        }
        if self.expires_at.is_some() {
            notification.expires_at = self.expires_at;
        }
        notification.updated_at = notification.updated_at.max(self.updated_at);
    }

    /// 同一 id 重发时把已持久化的进度带回通知
    ///
    /// 渠道状态逐个并入，创建时间与已读状态沿用记录中的值。
    pub fn carry_into(&self, notification: &mut Notification, now: DateTime<Utc>) {
        for (method, stored) in self.delivery_status.iter() {
            notification.delivery_status_mut(*method).absorb(stored);
        }
        notification.created_at = self.created_at;
        if self.is_read {
            notification.is_read = true;
            notification.read_at = self.read_at;
        }
        notification.updated_at = notification.updated_at.max(self.updated_at);
        notification.refresh_status(now);
    }

    pub fn retry_cursor(&self) -> RetryCursor {
        RetryCursor {
            updated_at: self.updated_at,
            id: self.id.clone(),
        }
    }

    pub fn status_for(&self, method: DeliveryMethod) -> Option<&DeliveryStatus> {
        self.delivery_status.get(&method)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// 重试候选的分页位置，按 (updated_at, id) 排序
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryCursor {
    pub updated_at: DateTime<Utc>,
    pub id: String,
}

/// 元数据存储 trait
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// 写入记录；同 id 已存在时只覆盖内容字段，
    /// 已读状态、投递状态与创建时间保持不变
    async fn create(&self, record: &MetadataRecord) -> Result<()>;

    /// 整行更新，记录不存在时返回 NotFound
    async fn update(&self, record: &MetadataRecord) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<MetadataRecord>>;

    async fn get_many(&self, ids: &[String]) -> Result<Vec<MetadataRecord>>;

    /// 用户未读且未过期的通知，按创建时间倒序
    async fn list_unread(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<MetadataRecord>>;

    /// 标记已读，返回实际发生变化的条数
    async fn mark_as_read(&self, ids: &[String], read_at: DateTime<Utc>) -> Result<u64>;

    /// 只更新投递状态相关列，不触碰已读状态
    async fn update_delivery_status(
        &self,
        id: &str,
        delivery_status: &BTreeMap<DeliveryMethod, DeliveryStatus>,
        status: DeliveryState,
        updated_at: DateTime<Utc>,
    ) -> Result<()>;

    /// 已过期记录的 id
    async fn list_expired(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<String>>;

    async fn delete(&self, ids: &[String]) -> Result<u64>;

    /// 邮件渠道处于 Failed、尝试次数低于 `max_attempts` 且未过期的记录
    ///
    /// 按 (updated_at, id) 升序，只返回 `after` 之后的部分。
    async fn list_retry_candidates(
        &self,
        now: DateTime<Utc>,
        max_attempts: u32,
        after: Option<RetryCursor>,
        limit: i64,
    ) -> Result<Vec<MetadataRecord>>;
}
