//! 组合存储
//!
//! 元数据存储与消息代理日志的协调层。写入顺序固定为先元数据后代理：
//! 元数据写入失败时不触碰代理；代理写入失败时元数据保留，并把 Queue
//! 渠道记为 Failed，由调用方决定是否以同一 id 重试。

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tourney_shared::observability::metrics;
use tracing::{debug, error, info, instrument, warn};

use super::metadata::{MetadataRecord, MetadataStore, RetryCursor};
use super::queue_storage::QueueStorage;
use crate::error::{NotificationError, Result};
use crate::model::{DeliveryMethod, Notification, UserRole};
use crate::retry::RetryPolicy;

/// 单次拉取的默认上限
pub const DEFAULT_FETCH_LIMIT: usize = 100;

/// 一轮重试清扫的结果
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RetrySweepReport {
    pub candidates: usize,
    pub republished: u64,
    /// 退避未到或次数已用尽
    pub skipped: usize,
    pub failed: usize,
}

pub struct CombinedStorage {
    metadata: Arc<dyn MetadataStore>,
    queue: QueueStorage,
    policy: RetryPolicy,
    batch_size: i64,
}

impl CombinedStorage {
    pub fn new(metadata: Arc<dyn MetadataStore>, queue: QueueStorage) -> Self {
        Self {
            metadata,
            queue,
            policy: RetryPolicy::default(),
            batch_size: 100,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn metadata(&self) -> &Arc<dyn MetadataStore> {
        &self.metadata
    }

    pub fn queue(&self) -> &QueueStorage {
        &self.queue
    }

    /// 先写元数据，再发布到消息代理
    ///
    /// 同一 id 重复调用不会产生重复的元数据记录；已持久化的投递进度
    /// 先并入通知，后续渠道投递据此判断是否放行。
    #[instrument(skip(self, ctx, notification), fields(notification_id = %notification.id))]
    pub async fn store(&self, ctx: &CancellationToken, notification: &mut Notification) -> Result<()> {
        if let Some(existing) = self.metadata.get(&notification.id).await? {
            existing.carry_into(notification, Utc::now());
            debug!(status = ?notification.status, "同 id 重发，已并入既有投递状态");
        }

        let record = MetadataRecord::from_notification(notification);
        if let Err(e) = self.metadata.create(&record).await {
            metrics::record_store_failure("metadata");
            error!(error = %e, "元数据写入失败，未发布到消息代理");
            return Err(e);
        }

        match self.queue.store(ctx, notification).await {
            Ok(()) => Ok(()),
            Err(e) => {
                metrics::record_store_failure("broker");
                warn!(error = %e, "消息代理写入失败，元数据已保留");
                notification.refresh_status(Utc::now());
                if let Err(update_err) = self
                    .metadata
                    .update_delivery_status(
                        &notification.id,
                        &notification.delivery_status,
                        notification.status,
                        notification.updated_at,
                    )
                    .await
                {
                    warn!(error = %update_err, "记录代理写入失败状态时出错");
                }
                Err(NotificationError::BrokerLegFailed(Box::new(e)))
            }
        }
    }

    /// 从代理拉取用户通知，再以元数据覆盖
    ///
    /// 代理不可用时退化为空列表；已过期的通知不返回。
    pub async fn get(
        &self,
        ctx: &CancellationToken,
        role: UserRole,
        user_id: &str,
    ) -> Result<Vec<Notification>> {
        let fetched = match self
            .queue
            .fetch(ctx, role, user_id, DEFAULT_FETCH_LIMIT)
            .await
        {
            Ok(fetched) => fetched,
            Err(NotificationError::Cancelled) => return Err(NotificationError::Cancelled),
            Err(e) => {
                warn!(user_id, error = %e, "从消息代理拉取通知失败");
                Vec::new()
            }
        };

        // 同一 id 只保留最后一份
        let mut order = Vec::new();
        let mut by_id: HashMap<String, Notification> = HashMap::new();
        for n in fetched {
            if !by_id.contains_key(&n.id) {
                order.push(n.id.clone());
            }
            by_id.insert(n.id.clone(), n);
        }

        let records = self.metadata.get_many(&order).await?;
        for record in &records {
            if let Some(n) = by_id.get_mut(&record.id) {
                record.merge_into(n);
            }
        }

        let now = Utc::now();
        Ok(order
            .into_iter()
            .filter_map(|id| by_id.remove(&id))
            .filter(|n| !n.is_expired(now))
            .collect())
    }

    /// 用户未读且未过期的通知，以元数据为准
    pub async fn get_unread(&self, user_id: &str, limit: i64) -> Result<Vec<Notification>> {
        let records = self
            .metadata
            .list_unread(user_id, Utc::now(), limit)
            .await?;
        Ok(records
            .into_iter()
            .map(MetadataRecord::into_notification)
            .collect())
    }

    /// 标记已读：元数据为准，镜像到代理失败只记录日志
    pub async fn mark_as_read(&self, ctx: &CancellationToken, ids: &[String]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let changed = self.metadata.mark_as_read(ids, Utc::now()).await?;

        if changed > 0 {
            let records = self.metadata.get_many(ids).await?;
            for record in records.into_iter().filter(|r| r.is_read) {
                let n = record.into_notification();
                if let Err(e) = self.queue.update(ctx, &n).await {
                    warn!(notification_id = %n.id, error = %e, "已读状态镜像到消息代理失败");
                }
            }
        }
        Ok(changed)
    }

    /// 持久化投递状态：元数据为准，镜像到代理失败只记录日志
    pub async fn update_delivery_status(
        &self,
        ctx: &CancellationToken,
        notification: &Notification,
    ) -> Result<()> {
        self.metadata
            .update_delivery_status(
                &notification.id,
                &notification.delivery_status,
                notification.status,
                notification.updated_at,
            )
            .await?;

        if let Err(e) = self.queue.update(ctx, notification).await {
            warn!(notification_id = %notification.id, error = %e, "投递状态镜像到消息代理失败");
        }
        Ok(())
    }

    /// 分批删除已过期的元数据；代理侧依赖消息 TTL
    pub async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut deleted = 0;
        loop {
            let ids = self.metadata.list_expired(now, self.batch_size).await?;
            if ids.is_empty() {
                break;
            }
            let removed = self.metadata.delete(&ids).await?;
            deleted += removed;
            if removed == 0 || (ids.len() as i64) < self.batch_size {
                break;
            }
        }

        if deleted > 0 {
            metrics::record_expired_deleted(deleted);
            info!(deleted, "已删除过期通知元数据");
        }
        Ok(deleted)
    }

    /// 重试清扫：邮件渠道失败且退避已到的通知重新发布到消息代理
    ///
    /// 只重新发布，不在本进程内重发邮件；发布成功后邮件渠道回到 Pending。
    /// 次数已用尽的记录不进入候选；退避未到的记录按游标翻页越过，
    /// 每轮最多处理 `batch_size` 条可重试记录。
    #[instrument(skip(self, ctx))]
    pub async fn retry_failed(
        &self,
        ctx: &CancellationToken,
        now: DateTime<Utc>,
    ) -> Result<RetrySweepReport> {
        let max_attempts = self.policy.email_max_attempts();
        let budget = usize::try_from(self.batch_size).unwrap_or(usize::MAX);
        let mut report = RetrySweepReport::default();
        let mut cursor: Option<RetryCursor> = None;

        loop {
            let page = self
                .metadata
                .list_retry_candidates(now, max_attempts, cursor.take(), self.batch_size)
                .await?;
            let page_len = page.len();
            report.candidates += page_len;
            cursor = page.last().map(MetadataRecord::retry_cursor);

            for record in page {
                if ctx.is_cancelled() {
                    return Err(NotificationError::Cancelled);
                }
                if !self.policy.can_retry(
                    DeliveryMethod::Email,
                    record.status_for(DeliveryMethod::Email),
                    now,
                ) {
                    report.skipped += 1;
                    continue;
                }

                let mut n = record.into_notification();
                n.delivery_status_mut(DeliveryMethod::Email).requeue();
                n.refresh_status(now);

                if let Err(e) = self.queue.store(ctx, &mut n).await {
                    report.failed += 1;
                    warn!(notification_id = %n.id, error = %e, "重试重新发布失败");
                    continue;
                }
                if let Err(e) = self
                    .metadata
                    .update_delivery_status(&n.id, &n.delivery_status, n.status, n.updated_at)
                    .await
                {
                    warn!(notification_id = %n.id, error = %e, "重试后状态落库失败");
                }
                report.republished += 1;
                debug!(notification_id = %n.id, "失败通知已重新发布");
            }

            let processed = report.republished as usize + report.failed;
            if page_len < budget || processed >= budget {
                break;
            }
        }

        if report.republished > 0 {
            metrics::record_retry_republished(report.republished);
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DeliveryState, NotificationType};
    use crate::queue::{MemoryBroker, QueueConfig, QueueSender};
    use crate::storage::memory::InMemoryMetadataStore;
    use crate::storage::metadata::MockMetadataStore;
    use chrono::Duration;

    async fn storage_with(
        metadata: Arc<dyn MetadataStore>,
    ) -> (CombinedStorage, MemoryBroker) {
        let broker = MemoryBroker::new();
        let queue = QueueSender::connect(Arc::new(broker.clone()), QueueConfig::default())
            .await
            .unwrap();
        (
            CombinedStorage::new(metadata, QueueStorage::new(queue)),
            broker,
        )
    }

    fn notification() -> Notification {
        Notification::new(
            NotificationType::JudgeAssignment,
            "42",
            UserRole::Volunteer,
            "裁判分配",
            "第二轮 C 教室",
        )
        .with_delivery_methods([DeliveryMethod::Email, DeliveryMethod::InApp])
    }

    #[tokio::test]
    async fn test_metadata_failure_skips_broker() {
        let mut mock = MockMetadataStore::new();
        mock.expect_get().returning(|_| Ok(None));
        mock.expect_create()
            .times(1)
            .returning(|_| Err(NotificationError::Storage("磁盘已满".to_string())));
        let (storage, broker) = storage_with(Arc::new(mock)).await;

        let mut n = notification();
        let err = storage
            .store(&CancellationToken::new(), &mut n)
            .await
            .unwrap_err();
        assert!(matches!(err, NotificationError::Storage(_)));
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn test_broker_failure_keeps_metadata() {
        let metadata = InMemoryMetadataStore::new();
        let (storage, broker) = storage_with(Arc::new(metadata.clone())).await;
        broker.fail_next_publishes(1);

        let mut n = notification();
        let err = storage
            .store(&CancellationToken::new(), &mut n)
            .await
            .unwrap_err();
        assert!(matches!(err, NotificationError::BrokerLegFailed(_)));

        let record = metadata.get(&n.id).await.unwrap().unwrap();
        assert_eq!(
            record.status_for(DeliveryMethod::Queue).unwrap().status,
            DeliveryState::Failed
        );

        // 以同一 id 重试不会产生重复记录
        storage
            .store(&CancellationToken::new(), &mut n)
            .await
            .unwrap();
        assert_eq!(metadata.len(), 1);
        let queue = n.status_for(DeliveryMethod::Queue).unwrap();
        assert!(queue.is_delivered());
        assert_eq!(queue.attempts, 2);
        assert_eq!(broker.published().len(), 1);
    }

    #[tokio::test]
    async fn test_retry_sweep_respects_backoff() {
        let metadata = InMemoryMetadataStore::new();
        let (storage, broker) = storage_with(Arc::new(metadata.clone())).await;
        let now = Utc::now();

        // 45 分钟前第一次失败：退避 30 分钟已到
        let mut due = notification();
        let email = due.delivery_status_mut(DeliveryMethod::Email);
        email.record_attempt(now - Duration::minutes(45));
        email.mark_failed("smtp 421");
        metadata
            .create(&MetadataRecord::from_notification(&due))
            .await
            .unwrap();

        // 10 分钟前第一次失败：尚未到期
        let mut early = notification();
        let email = early.delivery_status_mut(DeliveryMethod::Email);
        email.record_attempt(now - Duration::minutes(10));
        email.mark_failed("smtp 421");
        metadata
            .create(&MetadataRecord::from_notification(&early))
            .await
            .unwrap();

        let report = storage
            .retry_failed(&CancellationToken::new(), now)
            .await
            .unwrap();
        assert_eq!(report.candidates, 2);
        assert_eq!(report.republished, 1);
        assert_eq!(report.skipped, 1);

        let published = broker.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].message_id, due.id);

        let record = metadata.get(&due.id).await.unwrap().unwrap();
        let email = record.status_for(DeliveryMethod::Email).unwrap();
        assert_eq!(email.status, DeliveryState::Pending);
        assert_eq!(email.attempts, 1);

        // 已回到 Pending，下一轮不再重复发布
        let report = storage
            .retry_failed(&CancellationToken::new(), now)
            .await
            .unwrap();
        assert_eq!(report.republished, 0);
    }

    #[tokio::test]
    async fn test_retry_sweep_stops_after_max_attempts() {
        let metadata = InMemoryMetadataStore::new();
        let (storage, broker) = storage_with(Arc::new(metadata.clone())).await;
        let now = Utc::now();

        let mut n = notification();
        let email = n.delivery_status_mut(DeliveryMethod::Email);
        for _ in 0..4 {
            email.record_attempt(now - Duration::days(1));
        }
        email.mark_failed("smtp 550");
        metadata
            .create(&MetadataRecord::from_notification(&n))
            .await
            .unwrap();

        let report = storage
            .retry_failed(&CancellationToken::new(), now)
            .await
            .unwrap();
        assert_eq!(report.candidates, 0);
        assert_eq!(report.skipped, 0);
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn test_retry_sweep_reaches_past_stale_records() {
        let metadata = InMemoryMetadataStore::new();
        let (storage, broker) = storage_with(Arc::new(metadata.clone())).await;
        let storage = storage.with_batch_size(2);
        let now = Utc::now();

        let failed_record = |attempts: u32, last_attempt: DateTime<Utc>, updated_at: DateTime<Utc>| {
            let mut n = notification();
            let email = n.delivery_status_mut(DeliveryMethod::Email);
            for _ in 0..attempts {
                email.record_attempt(last_attempt);
            }
            email.mark_failed("smtp 421");
            let mut record = MetadataRecord::from_notification(&n);
            record.updated_at = updated_at;
            record
        };

        // 次数用尽与退避未到的记录都比可重试的那条更旧
        for _ in 0..3 {
            let record = failed_record(4, now - Duration::days(2), now - Duration::days(2));
            metadata.create(&record).await.unwrap();
        }
        for _ in 0..2 {
            let record = failed_record(3, now - Duration::minutes(10), now - Duration::days(1));
            metadata.create(&record).await.unwrap();
        }
        let eligible = failed_record(1, now - Duration::hours(2), now - Duration::hours(2));
        metadata.create(&eligible).await.unwrap();

        let report = storage
            .retry_failed(&CancellationToken::new(), now)
            .await
            .unwrap();
        assert_eq!(report.candidates, 3);
        assert_eq!(report.skipped, 2);
        assert_eq!(report.republished, 1);

        let published = broker.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].message_id, eligible.id);
        let record = metadata.get(&eligible.id).await.unwrap().unwrap();
        assert_eq!(
            record.status_for(DeliveryMethod::Email).unwrap().status,
            DeliveryState::Pending
        );
    }

    #[tokio::test]
    async fn test_resend_does_not_reset_email_backoff() {
        let metadata = InMemoryMetadataStore::new();
        let (storage, _broker) = storage_with(Arc::new(metadata.clone())).await;
        let now = Utc::now();

        let mut first = notification();
        let email = first.delivery_status_mut(DeliveryMethod::Email);
        email.record_attempt(now - Duration::minutes(5));
        email.mark_failed("smtp 421");
        metadata
            .create(&MetadataRecord::from_notification(&first))
            .await
            .unwrap();

        let mut resend = notification().with_id(first.id.clone());
        storage
            .store(&CancellationToken::new(), &mut resend)
            .await
            .unwrap();

        let email = resend.status_for(DeliveryMethod::Email).unwrap();
        assert_eq!(email.attempts, 1);
        assert!(!RetryPolicy::default().can_retry(DeliveryMethod::Email, Some(email), now));
        assert_eq!(resend.created_at, first.created_at);
    }

    #[tokio::test]
    async fn test_delete_expired_in_batches() {
        let metadata = InMemoryMetadataStore::new();
        let (storage, _broker) = storage_with(Arc::new(metadata.clone())).await;
        let storage = storage.with_batch_size(2);
        let now = Utc::now();

        for _ in 0..5 {
            let n = notification().with_expires_at(now - Duration::minutes(1));
            metadata
                .create(&MetadataRecord::from_notification(&n))
                .await
                .unwrap();
        }
        let live = notification().with_expires_at(now + Duration::days(1));
        metadata
            .create(&MetadataRecord::from_notification(&live))
            .await
            .unwrap();

        assert_eq!(storage.delete_expired(now).await.unwrap(), 5);
        assert_eq!(metadata.len(), 1);
        assert!(metadata.get(&live.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_mark_as_read_survives_broker_outage() {
        let metadata = InMemoryMetadataStore::new();
        let (storage, broker) = storage_with(Arc::new(metadata.clone())).await;

        let mut n = notification();
        storage
            .store(&CancellationToken::new(), &mut n)
            .await
            .unwrap();

        broker.fail_next_publishes(1);
        let changed = storage
            .mark_as_read(&CancellationToken::new(), &[n.id.clone()])
            .await
            .unwrap();
        assert_eq!(changed, 1);
        assert!(storage.get_unread("42", 50).await.unwrap().is_empty());
    }
}
