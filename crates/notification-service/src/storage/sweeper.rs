//! 存储后台清扫 Worker
//!
//! 按固定间隔执行两类清扫：
//! 1. 重试清扫：邮件失败且退避已到的通知重新发布到消息代理
//! 2. 过期清扫：删除已过期的通知元数据
//!
//! 单轮失败只记录日志，下一轮照常进行。

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tourney_shared::config::NotificationConfig;
use tourney_shared::observability::metrics;
use tracing::{debug, error, info};

use super::combined::CombinedStorage;

pub struct StorageSweeper {
    storage: Arc<CombinedStorage>,
    retry_interval: Duration,
    expired_interval: Duration,
}

impl StorageSweeper {
    pub fn new(storage: Arc<CombinedStorage>, retry_interval: Duration, expired_interval: Duration) -> Self {
        Self {
            storage,
            retry_interval,
            expired_interval,
        }
    }

    pub fn from_config(storage: Arc<CombinedStorage>, config: &NotificationConfig) -> Self {
        Self::new(
            storage,
            Duration::from_secs(config.retry_sweep_interval_secs.max(1)),
            Duration::from_secs(config.expired_sweep_interval_secs.max(1)),
        )
    }

    /// 主循环：直到 `shutdown` 被取消
    ///
    /// 首轮清扫在一个完整间隔之后执行。
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            retry_interval = ?self.retry_interval,
            expired_interval = ?self.expired_interval,
            "StorageSweeper 已启动"
        );

        let start = tokio::time::Instant::now();
        let mut retry_tick = tokio::time::interval_at(start + self.retry_interval, self.retry_interval);
        retry_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut expired_tick =
            tokio::time::interval_at(start + self.expired_interval, self.expired_interval);
        expired_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = retry_tick.tick() => self.sweep_retries(&shutdown).await,
                _ = expired_tick.tick() => self.sweep_expired().await,
            }
        }
        info!("StorageSweeper 已停止");
    }

    async fn sweep_retries(&self, shutdown: &CancellationToken) {
        match self.storage.retry_failed(shutdown, Utc::now()).await {
            Ok(report) if report.candidates > 0 => info!(
                candidates = report.candidates,
                republished = report.republished,
                skipped = report.skipped,
                failed = report.failed,
                "重试清扫完成"
            ),
            Ok(_) => debug!("重试清扫：没有待重试的通知"),
            Err(e) => error!(error = %e, "重试清扫出错"),
        }
        metrics::set_worker_last_run("retry_sweeper");
    }

    async fn sweep_expired(&self) {
        if let Err(e) = self.storage.delete_expired(Utc::now()).await {
            error!(error = %e, "过期清扫出错");
        }
        metrics::set_worker_last_run("expired_sweeper");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DeliveryMethod, Notification, NotificationType, UserRole};
    use crate::queue::{MemoryBroker, QueueConfig, QueueSender};
    use crate::storage::memory::InMemoryMetadataStore;
    use crate::storage::metadata::{MetadataRecord, MetadataStore};
    use crate::storage::queue_storage::QueueStorage;

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_runs_on_interval_and_stops() {
        let metadata = InMemoryMetadataStore::new();
        let broker = MemoryBroker::new();
        let queue = QueueSender::connect(Arc::new(broker.clone()), QueueConfig::default())
            .await
            .unwrap();
        let storage = Arc::new(CombinedStorage::new(
            Arc::new(metadata.clone()),
            QueueStorage::new(queue),
        ));

        let now = Utc::now();
        let mut failed = Notification::new(
            NotificationType::TournamentPayment,
            "42",
            UserRole::School,
            "缴费提醒",
            "请于周五前完成缴费",
        )
        .with_delivery_methods([DeliveryMethod::Email]);
        let email = failed.delivery_status_mut(DeliveryMethod::Email);
        email.record_attempt(now - chrono::Duration::hours(1));
        email.mark_failed("smtp 421");
        metadata
            .create(&MetadataRecord::from_notification(&failed))
            .await
            .unwrap();

        let expired = Notification::new(
            NotificationType::TournamentPayment,
            "42",
            UserRole::School,
            "旧提醒",
            "已过期",
        )
        .with_expires_at(now - chrono::Duration::minutes(1));
        metadata
            .create(&MetadataRecord::from_notification(&expired))
            .await
            .unwrap();

        let shutdown = CancellationToken::new();
        let sweeper = StorageSweeper::new(
            storage,
            Duration::from_secs(60),
            Duration::from_secs(120),
        );
        let handle = tokio::spawn(sweeper.run(shutdown.clone()));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(broker.published().is_empty());

        tokio::time::sleep(Duration::from_secs(100)).await;
        assert_eq!(broker.published().len(), 1);
        assert!(metadata.get(&expired.id).await.unwrap().is_none());

        shutdown.cancel();
        handle.await.unwrap();
    }
}
