//! 消息代理侧的通知日志
//!
//! 写入走用户路由键，进入各用户队列；状态更新以 `updates.` 前缀的路由键
//! 镜像到同一交换机，用户队列的绑定不会匹配到这些消息。

use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::model::{Notification, UserRole};
use crate::queue::QueueSender;
use crate::sender::Sender;

/// 状态更新镜像的路由键前缀
pub const UPDATE_ROUTING_PREFIX: &str = "updates";

#[derive(Clone)]
pub struct QueueStorage {
    queue: QueueSender,
}

impl QueueStorage {
    pub fn new(queue: QueueSender) -> Self {
        Self { queue }
    }

    pub fn sender(&self) -> &QueueSender {
        &self.queue
    }

    /// 发布通知，并把结果记入通知上的 Queue 渠道状态
    pub async fn store(&self, ctx: &CancellationToken, notification: &mut Notification) -> Result<()> {
        self.queue.send(ctx, notification).await
    }

    /// 拉取用户队列中积压的通知
    pub async fn fetch(
        &self,
        ctx: &CancellationToken,
        role: UserRole,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<Notification>> {
        self.queue.drain_user_queue(ctx, role, user_id, limit).await
    }

    /// 镜像通知的最新状态
    pub async fn update(&self, ctx: &CancellationToken, notification: &Notification) -> Result<()> {
        let routing_key = format!("{UPDATE_ROUTING_PREFIX}.{}", notification.routing_key());
        self.queue
            .publish_routed(ctx, notification, &routing_key)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DeliveryMethod, NotificationType};
    use crate::queue::{MemoryBroker, QueueConfig, SubscribeOptions};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_update_does_not_reach_user_queue() {
        let broker = MemoryBroker::new();
        let queue = QueueSender::connect(Arc::new(broker.clone()), QueueConfig::default())
            .await
            .unwrap();
        let storage = QueueStorage::new(queue);
        let ctx = CancellationToken::new();
        // 建立用户队列的绑定
        let sub = storage
            .sender()
            .subscribe(&ctx, SubscribeOptions::new("42", UserRole::Student))
            .await
            .unwrap();
        sub.unsubscribe();
        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            while storage.sender().active_subscriptions() > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let mut n = Notification::new(
            NotificationType::RoomChange,
            "42",
            UserRole::Student,
            "换教室",
            "B201",
        );
        storage.store(&ctx, &mut n).await.unwrap();
        assert!(n.status_for(DeliveryMethod::Queue).unwrap().is_delivered());

        n.mark_as_read(chrono::Utc::now());
        storage.update(&ctx, &n).await.unwrap();

        let published = broker.published();
        assert_eq!(published.len(), 2);
        assert_eq!(
            published[1].routing_key,
            "updates.student.debate.room_change"
        );

        let fetched = storage
            .fetch(&ctx, UserRole::Student, "42", 10)
            .await
            .unwrap();
        assert_eq!(fetched.len(), 1);
        assert!(!fetched[0].is_read);
    }
}
