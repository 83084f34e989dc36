//! 按类别分发通知
//!
//! 每个类别对应一个分发器：先套用策略表（渠道、优先级、过期时间），
//! 再依次调用各渠道发送器。单个渠道失败只记入该渠道的投递状态，
//! 不影响其余渠道，分发过程从不内联重试。

pub mod categories;
pub mod factory;
pub mod policy;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio_util::sync::CancellationToken;
use tourney_shared::observability::metrics;
use tracing::{debug, warn};

use crate::error::{NotificationError, Result};
use crate::model::{Category, DeliveryMethod, Notification};
use crate::sender::Sender;

pub use categories::{
    AuthDispatcher, DebateDispatcher, ReportDispatcher, TournamentDispatcher, UserDispatcher,
};
pub use factory::DispatcherFactory;
pub use policy::{ChannelPolicy, policy_for};

/// 默认过期时间
pub const DEFAULT_EXPIRY_DAYS: i64 = 30;

/// 分发器共享选项
#[derive(Clone)]
pub struct DispatcherOptions {
    /// 面向用户的渠道发送器
    pub senders: HashMap<DeliveryMethod, Arc<dyn Sender>>,
    /// 消息代理发送器
    pub queue: Option<Arc<dyn Sender>>,
    /// 通知未设置过期时间时使用
    pub default_expiry: Duration,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self {
            senders: HashMap::new(),
            queue: None,
            default_expiry: Duration::days(DEFAULT_EXPIRY_DAYS),
        }
    }
}

impl DispatcherOptions {
    /// 按发送器声明的渠道注册
    pub fn with_sender(mut self, sender: Arc<dyn Sender>) -> Self {
        self.senders.insert(sender.method(), sender);
        self
    }

    pub fn with_queue(mut self, queue: Arc<dyn Sender>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_default_expiry(mut self, expiry: Duration) -> Self {
        self.default_expiry = expiry;
        self
    }
}

/// 类别分发器
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// 负责的类别
    fn category(&self) -> Category;

    fn options(&self) -> &DispatcherOptions;

    /// 类别特有的补充处理，在策略套用之后执行
    fn adjust(&self, _notification: &mut Notification, _now: DateTime<Utc>) {}

    /// 套用策略表
    ///
    /// 渠道与优先级无条件覆盖；过期时间仅在未设置时填充。
    fn apply_policy(&self, notification: &mut Notification, now: DateTime<Utc>) -> Result<()> {
        if notification.category != self.category() {
            return Err(NotificationError::Validation(format!(
                "{} 分发器无法处理 {} 类别的通知",
                self.category(),
                notification.category
            )));
        }

        let policy = policy_for(notification.notification_type);
        notification.set_delivery_methods(policy.methods.iter().copied());
        if let Some(priority) = policy.priority {
            notification.priority = priority;
        }
        if notification.expires_at.is_none() {
            let expiry = policy.expiry.unwrap_or(self.options().default_expiry);
            notification.expires_at = Some(now + expiry);
        }

        self.adjust(notification, now);
        notification.updated_at = now;
        Ok(())
    }

    /// 完整分发：套用策略，发布到消息代理，再投递各渠道
    ///
    /// 消息代理发布失败时不尝试任何渠道。
    async fn dispatch(&self, ctx: &CancellationToken, notification: &mut Notification) -> Result<()> {
        self.apply_policy(notification, Utc::now())?;

        let queue = self.options().queue.clone().ok_or_else(|| {
            NotificationError::Configuration("未配置消息代理发送器".to_string())
        })?;
        queue.send(ctx, notification).await?;

        self.deliver(ctx, notification).await
    }

    /// 依次调用各渠道发送器，失败记入对应渠道状态
    async fn deliver(&self, ctx: &CancellationToken, notification: &mut Notification) -> Result<()> {
        let started = Instant::now();
        let methods = notification.delivery_methods.clone();

        for method in methods {
            if ctx.is_cancelled() {
                return Err(NotificationError::Cancelled);
            }
            // 消息代理由存储层或 dispatch 负责
            if method == DeliveryMethod::Queue {
                continue;
            }

            let Some(sender) = self.options().senders.get(&method).cloned() else {
                notification.delivery_status_mut(method);
                debug!(
                    notification_id = %notification.id,
                    method = %method,
                    "渠道未配置发送器，状态保持 Pending"
                );
                metrics::record_channel_delivery(method.as_str(), "skipped");
                continue;
            };

            let outcome = match sender.send(ctx, notification).await {
                Ok(()) => notification
                    .status_for(method)
                    .map_or("pending", |s| s.status.as_str()),
                Err(NotificationError::RetryNotAllowed { attempts, .. }) => {
                    debug!(
                        notification_id = %notification.id,
                        method = %method,
                        attempts,
                        "重试策略未放行，跳过该渠道"
                    );
                    "deferred"
                }
                Err(e) => {
                    let status = notification.delivery_status_mut(method);
                    if !status.is_delivered() {
                        status.mark_failed(e.to_string());
                    }
                    warn!(
                        notification_id = %notification.id,
                        method = %method,
                        error = %e,
                        "渠道投递失败"
                    );
                    "failed"
                }
            };
            metrics::record_channel_delivery(method.as_str(), outcome);
        }

        notification.refresh_status(Utc::now());
        metrics::record_dispatch_duration(
            self.category().as_str(),
            started.elapsed().as_secs_f64(),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DeliveryState, NotificationType, Priority, UserRole};
    use crate::sender::MockSender;

    fn sender_ok(method: DeliveryMethod) -> Arc<dyn Sender> {
        let mut mock = MockSender::new();
        mock.expect_method().return_const(method);
        mock.expect_send().returning(move |_, n| {
            let now = Utc::now();
            let status = n.delivery_status_mut(method);
            status.record_attempt(now);
            status.mark_delivered(now);
            Ok(())
        });
        Arc::new(mock)
    }

    fn sender_err(method: DeliveryMethod) -> Arc<dyn Sender> {
        let mut mock = MockSender::new();
        mock.expect_method().return_const(method);
        mock.expect_send()
            .returning(move |_, _| Err(NotificationError::delivery(method, "smtp 550")));
        Arc::new(mock)
    }

    fn notification() -> Notification {
        Notification::new(
            NotificationType::RoundAssignment,
            "42",
            UserRole::Student,
            "第一轮",
            "A101",
        )
    }

    #[tokio::test]
    async fn test_channel_failure_does_not_abort_others() {
        let options = DispatcherOptions::default()
            .with_sender(sender_err(DeliveryMethod::Email))
            .with_sender(sender_ok(DeliveryMethod::InApp));
        let dispatcher = DebateDispatcher::new(Arc::new(options));

        let mut n = notification();
        dispatcher.apply_policy(&mut n, Utc::now()).unwrap();
        dispatcher
            .deliver(&CancellationToken::new(), &mut n)
            .await
            .unwrap();

        let email = n.status_for(DeliveryMethod::Email).unwrap();
        assert_eq!(email.status, DeliveryState::Failed);
        assert!(email.error.as_deref().unwrap().contains("smtp 550"));
        assert!(n.status_for(DeliveryMethod::InApp).unwrap().is_delivered());
        assert_eq!(
            n.status_for(DeliveryMethod::Push).unwrap().status,
            DeliveryState::Pending
        );
        assert_eq!(n.status, DeliveryState::Delivered);
    }

    #[tokio::test]
    async fn test_dispatch_requires_queue() {
        let dispatcher = DebateDispatcher::new(Arc::new(DispatcherOptions::default()));
        let mut n = notification();
        let err = dispatcher
            .dispatch(&CancellationToken::new(), &mut n)
            .await
            .unwrap_err();
        assert!(matches!(err, NotificationError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_dispatch_publishes_before_channels() {
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let mut queue = MockSender::new();
        queue.expect_method().return_const(DeliveryMethod::Queue);
        let seen = order.clone();
        queue.expect_send().times(1).returning(move |_, _| {
            seen.lock().push(DeliveryMethod::Queue);
            Ok(())
        });

        let mut email = MockSender::new();
        email.expect_method().return_const(DeliveryMethod::Email);
        let seen = order.clone();
        email.expect_send().times(1).returning(move |_, _| {
            seen.lock().push(DeliveryMethod::Email);
            Ok(())
        });

        let options = DispatcherOptions::default()
            .with_queue(Arc::new(queue))
            .with_sender(Arc::new(email));
        let dispatcher = DebateDispatcher::new(Arc::new(options));

        let mut n = notification().with_priority(Priority::Low);
        dispatcher
            .dispatch(&CancellationToken::new(), &mut n)
            .await
            .unwrap();

        assert_eq!(*order.lock(), vec![DeliveryMethod::Queue, DeliveryMethod::Email]);
        assert_eq!(n.priority, Priority::High);
    }

    #[test]
    fn test_wrong_category_rejected() {
        let dispatcher = ReportDispatcher::new(Arc::new(DispatcherOptions::default()));
        let mut n = notification();
        assert!(matches!(
            dispatcher.apply_policy(&mut n, Utc::now()),
            Err(NotificationError::Validation(_))
        ));
    }
}
