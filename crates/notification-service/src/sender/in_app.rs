//! 站内信发送器
//!
//! 进程内发布/订阅：每个用户可注册多个有界队列。发送为非阻塞扇出，
//! 队列已满时丢弃该订阅者的副本并记录日志，从不阻塞或失败调用方。
//! 扇出遍历与取消订阅、关闭共用同一把锁，保证不会向已关闭的队列写入。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tourney_shared::observability::metrics;
use tracing::{debug, info, warn};

use super::Sender;
use crate::error::{NotificationError, Result};
use crate::model::{DeliveryMethod, Notification};

/// 默认订阅队列容量
pub const DEFAULT_IN_APP_BUFFER: usize = 100;

struct LocalSubscriber {
    id: u64,
    tx: mpsc::Sender<Notification>,
    cancel: CancellationToken,
}

struct InAppInner {
    subscribers: Mutex<HashMap<String, Vec<LocalSubscriber>>>,
    buffer: usize,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl InAppInner {
    fn unsubscribe(&self, user_id: &str, id: u64) {
        let mut subscribers = self.subscribers.lock();
        if let Some(list) = subscribers.get_mut(user_id) {
            if let Some(pos) = list.iter().position(|s| s.id == id) {
                let removed = list.remove(pos);
                removed.cancel.cancel();
                debug!(user_id, subscription_id = id, "站内信订阅已取消");
            }
            if list.is_empty() {
                subscribers.remove(user_id);
            }
        }
    }
}

/// 站内信发送器
#[derive(Clone)]
pub struct InAppSender {
    inner: Arc<InAppInner>,
}

impl Default for InAppSender {
    fn default() -> Self {
        Self::new(DEFAULT_IN_APP_BUFFER)
    }
}

impl InAppSender {
    pub fn new(buffer: usize) -> Self {
        Self {
            inner: Arc::new(InAppInner {
                subscribers: Mutex::new(HashMap::new()),
                buffer: buffer.max(1),
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// 为用户注册一个新的有界队列
    ///
    /// `ctx` 被取消时自动取消订阅。需在 tokio 运行时内调用。
    pub fn subscribe(&self, ctx: &CancellationToken, user_id: &str) -> Result<InAppSubscription> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(NotificationError::Closed("站内信发送器"));
        }
        if user_id.trim().is_empty() {
            return Err(NotificationError::Validation("userID 不能为空".to_string()));
        }

        let (tx, rx) = mpsc::channel(self.inner.buffer);
        let closed = tx.clone();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = ctx.child_token();

        {
            let mut subscribers = self.inner.subscribers.lock();
            // 加锁后再检查一次，避免与 close 交错
            if self.inner.closed.load(Ordering::Acquire) {
                return Err(NotificationError::Closed("站内信发送器"));
            }
            subscribers
                .entry(user_id.to_string())
                .or_default()
                .push(LocalSubscriber {
                    id,
                    tx,
                    cancel: cancel.clone(),
                });
        }

        let handle = UnsubscribeHandle {
            inner: Arc::downgrade(&self.inner),
            user_id: user_id.to_string(),
            id,
        };

        // ctx 取消或接收端被丢弃，任一发生即注销
        let watcher = handle.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = closed.closed() => {}
            }
            drop(closed);
            watcher.unsubscribe();
        });

        debug!(user_id, subscription_id = id, "站内信订阅已注册");

        Ok(InAppSubscription {
            receiver: rx,
            handle,
        })
    }

    /// 当前用户仍在接收的订阅数量
    pub fn subscriber_count(&self, user_id: &str) -> usize {
        self.inner
            .subscribers
            .lock()
            .get(user_id)
            .map_or(0, |list| list.iter().filter(|s| !s.tx.is_closed()).count())
    }
}

#[async_trait]
impl Sender for InAppSender {
    fn method(&self) -> DeliveryMethod {
        DeliveryMethod::InApp
    }

    async fn send(&self, _ctx: &CancellationToken, notification: &mut Notification) -> Result<()> {
        let now = Utc::now();

        let outcome = {
            let mut subscribers = self.inner.subscribers.lock();
            match subscribers.get_mut(&notification.user_id) {
                None => None,
                Some(list) => {
                    let copy = notification.clone();
                    let mut delivered = 0usize;
                    let mut dropped = 0usize;
                    list.retain(|subscriber| match subscriber.tx.try_send(copy.clone()) {
                        Ok(()) => {
                            delivered += 1;
                            true
                        }
                        Err(TrySendError::Full(_)) => {
                            dropped += 1;
                            true
                        }
                        // 接收端已被丢弃，顺带清理
                        Err(TrySendError::Closed(_)) => {
                            subscriber.cancel.cancel();
                            false
                        }
                    });
                    if list.is_empty() {
                        subscribers.remove(&notification.user_id);
                    }
                    Some((delivered, dropped))
                }
            }
        };

        let Some((delivered, dropped)) = outcome else {
            // 无订阅者保持 Pending，由未读列表轮询补偿
            notification.delivery_status_mut(DeliveryMethod::InApp);
            debug!(
                notification_id = %notification.id,
                user_id = %notification.user_id,
                "无站内信订阅者，状态保持 Pending"
            );
            return Ok(());
        };

        for _ in 0..dropped {
            metrics::record_in_app_dropped();
        }
        if dropped > 0 {
            warn!(
                notification_id = %notification.id,
                user_id = %notification.user_id,
                dropped,
                "站内信订阅队列已满，已丢弃对应副本"
            );
        }

        let status = notification.delivery_status_mut(DeliveryMethod::InApp);
        if delivered > 0 {
            status.record_attempt(now);
            status.mark_delivered(now);
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.inner.closed.store(true, Ordering::Release);
        let mut subscribers = self.inner.subscribers.lock();
        let count: usize = subscribers.values().map(Vec::len).sum();
        for subscriber in subscribers.values().flatten() {
            subscriber.cancel.cancel();
        }
        subscribers.clear();
        info!(count, "站内信发送器已关闭，全部订阅已清理");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// 订阅句柄
// ---------------------------------------------------------------------------

/// 取消订阅的句柄，可克隆、可重复调用
#[derive(Clone)]
pub struct UnsubscribeHandle {
    inner: Weak<InAppInner>,
    user_id: String,
    id: u64,
}

impl UnsubscribeHandle {
    pub fn unsubscribe(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.unsubscribe(&self.user_id, self.id);
        }
    }
}

/// 站内信订阅
pub struct InAppSubscription {
    receiver: mpsc::Receiver<Notification>,
    handle: UnsubscribeHandle,
}

impl InAppSubscription {
    pub async fn recv(&mut self) -> Option<Notification> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Notification> {
        self.receiver.try_recv().ok()
    }

    pub fn unsubscribe(&self) {
        self.handle.unsubscribe();
    }

    pub fn unsubscribe_handle(&self) -> UnsubscribeHandle {
        self.handle.clone()
    }

    /// 拆分为通知流与取消订阅句柄
    pub fn into_parts(self) -> (ReceiverStream<Notification>, UnsubscribeHandle) {
        (ReceiverStream::new(self.receiver), self.handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DeliveryState, NotificationType, UserRole};
    use std::time::Duration;

    fn notification(user_id: &str) -> Notification {
        Notification::new(
            NotificationType::RoomChange,
            user_id,
            UserRole::Student,
            "教室变更",
            "第二轮改至 C101",
        )
    }

    #[tokio::test]
    async fn test_no_subscribers_keeps_pending() {
        let sender = InAppSender::default();
        let mut n = notification("42");
        sender.send(&CancellationToken::new(), &mut n).await.unwrap();

        let status = n.status_for(DeliveryMethod::InApp).unwrap();
        assert_eq!(status.status, DeliveryState::Pending);
        assert_eq!(status.attempts, 0);
    }

    #[tokio::test]
    async fn test_fan_out_to_all_subscribers() {
        let sender = InAppSender::default();
        let ctx = CancellationToken::new();
        let mut a = sender.subscribe(&ctx, "42").unwrap();
        let mut b = sender.subscribe(&ctx, "42").unwrap();
        let mut other = sender.subscribe(&ctx, "7").unwrap();

        let mut n = notification("42");
        sender.send(&ctx, &mut n).await.unwrap();

        assert_eq!(a.recv().await.unwrap().id, n.id);
        assert_eq!(b.recv().await.unwrap().id, n.id);
        assert!(other.try_recv().is_none());
        assert!(n.status_for(DeliveryMethod::InApp).unwrap().is_delivered());
    }

    #[tokio::test]
    async fn test_full_queue_does_not_block_others() {
        let sender = InAppSender::new(1);
        let ctx = CancellationToken::new();
        let mut full = sender.subscribe(&ctx, "42").unwrap();
        let mut first = sender.subscribe(&ctx, "42").unwrap();
        let mut second = sender.subscribe(&ctx, "42").unwrap();

        // 先填满 full 的队列，其余两个随即被消费清空
        let mut warmup = notification("42");
        sender.send(&ctx, &mut warmup).await.unwrap();
        first.recv().await.unwrap();
        second.recv().await.unwrap();

        let mut n = notification("42");
        sender.send(&ctx, &mut n).await.unwrap();

        assert_eq!(first.recv().await.unwrap().id, n.id);
        assert_eq!(second.recv().await.unwrap().id, n.id);
        assert_eq!(full.recv().await.unwrap().id, warmup.id);
        assert!(full.try_recv().is_none());
        assert!(n.status_for(DeliveryMethod::InApp).unwrap().is_delivered());
    }

    #[tokio::test]
    async fn test_unsubscribe_then_send() {
        let sender = InAppSender::default();
        let ctx = CancellationToken::new();
        let mut sub = sender.subscribe(&ctx, "42").unwrap();
        sub.unsubscribe();
        sub.unsubscribe();

        let mut n = notification("42");
        sender.send(&ctx, &mut n).await.unwrap();

        assert!(sub.recv().await.is_none());
        assert_eq!(sender.subscriber_count("42"), 0);
    }

    #[tokio::test]
    async fn test_cancellation_unsubscribes() {
        let sender = InAppSender::default();
        let ctx = CancellationToken::new();
        let mut sub = sender.subscribe(&ctx, "42").unwrap();
        assert_eq!(sender.subscriber_count("42"), 1);

        ctx.cancel();
        tokio::time::timeout(Duration::from_secs(1), async {
            while sender.subscriber_count("42") > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_dropped_subscription_is_released() {
        let sender = InAppSender::default();
        let ctx = CancellationToken::new();
        let kept = sender.subscribe(&ctx, "42").unwrap();
        let dropped = sender.subscribe(&ctx, "42").unwrap();
        assert_eq!(sender.subscriber_count("42"), 2);

        drop(dropped);
        assert_eq!(sender.subscriber_count("42"), 1);

        // 无需再次发送，注册表中的条目也会被移除
        tokio::time::timeout(Duration::from_secs(1), async {
            while sender.inner.subscribers.lock().get("42").map_or(0, Vec::len) > 1 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert!(!ctx.is_cancelled());
        assert_eq!(sender.subscriber_count("42"), 1);
        kept.unsubscribe();
    }

    #[tokio::test]
    async fn test_close_clears_all_queues() {
        let sender = InAppSender::default();
        let ctx = CancellationToken::new();
        let mut a = sender.subscribe(&ctx, "1").unwrap();
        let mut b = sender.subscribe(&ctx, "2").unwrap();

        sender.close().await.unwrap();

        assert!(a.recv().await.is_none());
        assert!(b.recv().await.is_none());
        assert!(matches!(
            sender.subscribe(&ctx, "3"),
            Err(NotificationError::Closed(_))
        ));
    }
}
