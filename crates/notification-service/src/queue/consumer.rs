//! 订阅消费 worker 池
//!
//! N 个 worker 共享同一条代理投递流，各自独立确认：
//! - 成功交给本地有界队列后 ack
//! - 本地队列已满时 nack 并重新入队，形成代理侧背压
//! - 负载无法解码时 nack 且不重新入队（毒消息丢弃）
//! - 不属于该用户或已过期的消息直接 ack 跳过
//!
//! worker 在取消信号触发或上游投递流关闭时退出。

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::broker::Delivery;
use crate::model::Notification;

/// 本地队列满时重新入队前的退避
const REQUEUE_BACKOFF: Duration = Duration::from_millis(50);

/// 单条投递的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOutcome {
    Forwarded,
    Requeued,
    Poisoned,
    Skipped,
    /// 本地接收端已关闭，worker 应退出
    ReceiverGone,
}

/// 启动消费 worker 池
pub fn spawn_workers(
    feed: mpsc::Receiver<Delivery>,
    output: mpsc::Sender<Notification>,
    user_id: String,
    workers: usize,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    let feed = Arc::new(Mutex::new(feed));
    (0..workers.max(1))
        .map(|worker_id| {
            let feed = feed.clone();
            let output = output.clone();
            let user_id = user_id.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                worker_loop(worker_id, feed, output, user_id, cancel).await;
            })
        })
        .collect()
}

async fn worker_loop(
    worker_id: usize,
    feed: Arc<Mutex<mpsc::Receiver<Delivery>>>,
    output: mpsc::Sender<Notification>,
    user_id: String,
    cancel: CancellationToken,
) {
    loop {
        let delivery = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            delivery = async { feed.lock().await.recv().await } => match delivery {
                Some(delivery) => delivery,
                None => break,
            },
        };

        match handle_delivery(delivery, &output, &user_id).await {
            HandleOutcome::ReceiverGone => {
                cancel.cancel();
                break;
            }
            HandleOutcome::Requeued => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(REQUEUE_BACKOFF) => {}
                }
            }
            _ => {}
        }
    }
    debug!(worker_id, user_id = %user_id, "消费 worker 已退出");
}

/// 处理一条投递并完成确认
pub async fn handle_delivery(
    delivery: Delivery,
    output: &mpsc::Sender<Notification>,
    user_id: &str,
) -> HandleOutcome {
    let notification = match Notification::decode(&delivery.payload) {
        Ok(n) => n,
        Err(e) => {
            warn!(
                routing_key = %delivery.routing_key,
                error = %e,
                "消息负载无法解码，作为毒消息丢弃"
            );
            if let Err(e) = delivery.nack(false).await {
                warn!(error = %e, "毒消息 nack 失败");
            }
            return HandleOutcome::Poisoned;
        }
    };

    if notification.user_id != user_id || notification.is_expired(Utc::now()) {
        debug!(
            notification_id = %notification.id,
            routing_key = %delivery.routing_key,
            "消息不属于当前订阅或已过期，跳过"
        );
        if let Err(e) = delivery.ack().await {
            warn!(error = %e, "跳过消息时 ack 失败");
        }
        return HandleOutcome::Skipped;
    }

    let notification_id = notification.id.clone();
    match output.try_send(notification) {
        Ok(()) => {
            if let Err(e) = delivery.ack().await {
                warn!(notification_id = %notification_id, error = %e, "ack 失败，消息可能被重复投递");
            }
            HandleOutcome::Forwarded
        }
        Err(mpsc::error::TrySendError::Full(_)) => {
            debug!(notification_id = %notification_id, "本地队列已满，消息重新入队");
            if let Err(e) = delivery.nack(true).await {
                warn!(notification_id = %notification_id, error = %e, "重新入队失败");
            }
            HandleOutcome::Requeued
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            if let Err(e) = delivery.nack(true).await {
                warn!(notification_id = %notification_id, error = %e, "重新入队失败");
            }
            HandleOutcome::ReceiverGone
        }
    }
}
