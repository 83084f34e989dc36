//! 通知服务门面
//!
//! 面向传输层适配器暴露发送、未读列表、标记已读与订阅四类操作。
//! 调用方传入的身份（userID、角色）视为已由外部鉴权组件校验。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tourney_shared::observability::metrics;
use tracing::{debug, info, instrument, warn};

use crate::dispatcher::DispatcherFactory;
use crate::error::{NotificationError, Result};
use crate::model::{Notification, UserRole};
use crate::queue::{QueueSubscription, SubscribeOptions};
use crate::sender::{InAppSender, InAppSubscription, Sender};
use crate::storage::CombinedStorage;

/// 未读列表的默认条数上限
pub const DEFAULT_UNREAD_LIMIT: i64 = 100;

pub struct NotificationService {
    factory: Arc<DispatcherFactory>,
    storage: Arc<CombinedStorage>,
    in_app: InAppSender,
    unread_limit: i64,
    closed: AtomicBool,
}

impl NotificationService {
    pub fn new(
        factory: Arc<DispatcherFactory>,
        storage: Arc<CombinedStorage>,
        in_app: InAppSender,
    ) -> Self {
        Self {
            factory,
            storage,
            in_app,
            unread_limit: DEFAULT_UNREAD_LIMIT,
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_unread_limit(mut self, limit: i64) -> Self {
        self.unread_limit = limit.max(1);
        self
    }

    pub fn factory(&self) -> &Arc<DispatcherFactory> {
        &self.factory
    }

    pub fn storage(&self) -> &Arc<CombinedStorage> {
        &self.storage
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NotificationError::Closed("通知服务"));
        }
        Ok(())
    }

    /// 发送通知
    ///
    /// 套用类别策略后先持久化（元数据 + 消息代理），再投递各渠道。
    /// 持久化成功即视为发送成功，各渠道结果记录在返回通知的投递状态中。
    #[instrument(
        skip(self, ctx, notification),
        fields(notification_id = %notification.id, category = %notification.category)
    )]
    pub async fn send_notification(
        &self,
        ctx: &CancellationToken,
        mut notification: Notification,
    ) -> Result<Notification> {
        self.ensure_open()?;

        let dispatcher = self.factory.get_dispatcher(notification.category);
        dispatcher.apply_policy(&mut notification, Utc::now())?;
        notification.validate()?;

        self.storage.store(ctx, &mut notification).await?;
        metrics::record_notification_sent(
            notification.category.as_str(),
            notification.notification_type.as_str(),
        );

        dispatcher.deliver(ctx, &mut notification).await?;

        if let Err(e) = self
            .storage
            .update_delivery_status(ctx, &notification)
            .await
        {
            warn!(error = %e, "投递状态落库失败，通知已持久化");
        }

        debug!(status = ?notification.status, "通知发送完成");
        Ok(notification)
    }

    /// 用户未读通知（元数据为准）
    pub async fn get_unread_notifications(&self, user_id: &str) -> Result<Vec<Notification>> {
        self.ensure_open()?;
        if user_id.trim().is_empty() {
            return Err(NotificationError::Validation("userID 不能为空".to_string()));
        }
        self.storage.get_unread(user_id, self.unread_limit).await
    }

    /// 批量标记已读，返回实际变化的条数
    pub async fn mark_notifications_as_read(
        &self,
        ctx: &CancellationToken,
        ids: &[String],
    ) -> Result<u64> {
        self.ensure_open()?;
        self.storage.mark_as_read(ctx, ids).await
    }

    /// 订阅本进程内的站内信推送
    ///
    /// `ctx` 取消或调用返回句柄的 `unsubscribe` 均会结束订阅。
    pub fn subscribe(&self, ctx: &CancellationToken, user_id: &str) -> Result<InAppSubscription> {
        self.ensure_open()?;
        self.in_app.subscribe(ctx, user_id)
    }

    /// 订阅消息代理上的用户队列，可跨实例接收
    pub async fn subscribe_broker(
        &self,
        ctx: &CancellationToken,
        options: SubscribeOptions,
    ) -> Result<QueueSubscription> {
        self.ensure_open()?;
        self.storage.queue().sender().subscribe(ctx, options).await
    }

    /// 消息代理与元数据合并后的通知视图（尽力而为）
    pub async fn get_notifications(
        &self,
        ctx: &CancellationToken,
        user_id: &str,
        role: UserRole,
    ) -> Result<Vec<Notification>> {
        self.ensure_open()?;
        self.storage.get(ctx, role, user_id).await
    }

    /// 关闭全部发送器与消息代理连接，可重复调用
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let options = self.factory.options();
        let mut first_err = None;
        for sender in options.senders.values() {
            if let Err(e) = sender.close().await {
                warn!(method = %sender.method(), error = %e, "关闭发送器失败");
                first_err.get_or_insert(e);
            }
        }
        if let Err(e) = self.in_app.close().await {
            first_err.get_or_insert(e);
        }
        if let Err(e) = self.storage.queue().sender().close().await {
            warn!(error = %e, "关闭消息代理发送器失败");
            first_err.get_or_insert(e);
        }

        info!("通知服务已关闭");
        first_err.map_or(Ok(()), Err)
    }
}
