//! 消息代理发送器
//!
//! 持有一条到 topic 交换机的存活连接，连接状态由一把读写锁保护：
//! 发布与订阅至少持有读锁校验连接，重连持有写锁替换连接。
//!
//! 连接状态机为 Disconnected -> Connecting -> Connected。监督任务阻塞在
//! 连接断开信号上，断开后按固定间隔重连；进入 Connected 时重建全部已注册订阅。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{RwLock, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tourney_shared::config::BrokerConfig;
use tourney_shared::observability::metrics;
use tracing::{debug, error, info, instrument, warn};

use super::broker::{BrokerConnection, BrokerConnector, PublishProperties};
use super::consumer::spawn_workers;
use super::routing::{binding_keys, user_queue_name};
use crate::error::{NotificationError, Result};
use crate::model::{Category, DeliveryMethod, Notification, NotificationType, UserRole};
use crate::sender::Sender;

const SERVICE: &str = "broker";

// ---------------------------------------------------------------------------
// 配置
// ---------------------------------------------------------------------------

/// 代理发送器配置
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub exchange: String,
    pub message_ttl: Duration,
    pub publish_timeout: Duration,
    pub reconnect_interval: Duration,
    pub consumer_workers: usize,
    pub subscriber_buffer: usize,
    /// 拉取用户队列时的空闲等待窗口
    pub fetch_idle: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::from(&BrokerConfig::default())
    }
}

impl From<&BrokerConfig> for QueueConfig {
    fn from(config: &BrokerConfig) -> Self {
        let ttl_days = u64::try_from(config.message_ttl_days.max(1)).unwrap_or(30);
        Self {
            exchange: config.exchange.clone(),
            message_ttl: Duration::from_secs(ttl_days * 24 * 3600),
            publish_timeout: Duration::from_secs(config.publish_timeout_secs),
            reconnect_interval: Duration::from_secs(config.reconnect_interval_secs),
            consumer_workers: config.consumer_workers.max(1),
            subscriber_buffer: config.subscriber_buffer.max(1),
            fetch_idle: Duration::from_millis(config.fetch_idle_millis),
        }
    }
}

// ---------------------------------------------------------------------------
// 连接状态
// ---------------------------------------------------------------------------

/// 代理连接阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Disconnected,
    Connecting,
    Connected,
}

struct ConnectionState {
    phase: ConnectionPhase,
    connection: Option<Arc<dyn BrokerConnection>>,
}

impl ConnectionState {
    /// 返回可用连接，否则报连接错误
    fn live(&self) -> Result<&Arc<dyn BrokerConnection>> {
        match (&self.phase, &self.connection) {
            (ConnectionPhase::Connected, Some(conn)) if conn.is_open() => Ok(conn),
            _ => Err(NotificationError::connectivity(SERVICE, "代理未连接")),
        }
    }
}

// ---------------------------------------------------------------------------
// 订阅
// ---------------------------------------------------------------------------

/// 代理订阅选项
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    pub user_id: String,
    pub role: UserRole,
    pub categories: Vec<Category>,
    pub types: Vec<NotificationType>,
    /// 本地队列容量，缺省取配置值
    pub buffer: Option<usize>,
}

impl SubscribeOptions {
    pub fn new(user_id: impl Into<String>, role: UserRole) -> Self {
        Self {
            user_id: user_id.into(),
            role,
            categories: Vec::new(),
            types: Vec::new(),
            buffer: None,
        }
    }

    pub fn with_categories(mut self, categories: impl IntoIterator<Item = Category>) -> Self {
        self.categories = categories.into_iter().collect();
        self
    }

    pub fn with_types(mut self, types: impl IntoIterator<Item = NotificationType>) -> Self {
        self.types = types.into_iter().collect();
        self
    }

    pub fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = Some(buffer);
        self
    }

    pub fn queue_name(&self) -> String {
        user_queue_name(self.role, &self.user_id)
    }
}

struct ActiveSubscription {
    id: u64,
    options: SubscribeOptions,
    output: mpsc::Sender<Notification>,
    cancel: CancellationToken,
    /// 当前连接上的消费 worker 池
    workers: Mutex<Option<CancellationToken>>,
}

/// 代理订阅句柄
pub struct QueueSubscription {
    id: u64,
    receiver: mpsc::Receiver<Notification>,
    cancel: CancellationToken,
}

impl QueueSubscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn recv(&mut self) -> Option<Notification> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Notification> {
        self.receiver.try_recv().ok()
    }

    /// 取消订阅，可重复调用
    pub fn unsubscribe(&self) {
        self.cancel.cancel();
    }

    /// 拆分为通知流与取消令牌
    pub fn into_parts(self) -> (ReceiverStream<Notification>, CancellationToken) {
        (ReceiverStream::new(self.receiver), self.cancel)
    }
}

// ---------------------------------------------------------------------------
// QueueSender
// ---------------------------------------------------------------------------

struct QueueInner {
    connector: Arc<dyn BrokerConnector>,
    config: QueueConfig,
    state: RwLock<ConnectionState>,
    phase_tx: watch::Sender<ConnectionPhase>,
    subscriptions: Mutex<HashMap<u64, Arc<ActiveSubscription>>>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for QueueInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// 消息代理发送器
#[derive(Clone)]
pub struct QueueSender {
    inner: Arc<QueueInner>,
}

impl QueueSender {
    /// 建立初始连接、声明交换机并启动重连监督任务
    ///
    /// 初始连接失败视为启动错误。
    pub async fn connect(connector: Arc<dyn BrokerConnector>, config: QueueConfig) -> Result<Self> {
        if config.exchange.trim().is_empty() {
            return Err(NotificationError::Configuration(
                "broker.exchange 不能为空".to_string(),
            ));
        }

        let connection =
            open_connection(connector.as_ref(), &config.exchange, config.reconnect_interval).await?;

        let (phase_tx, _) = watch::channel(ConnectionPhase::Connected);
        let inner = Arc::new(QueueInner {
            connector,
            config,
            state: RwLock::new(ConnectionState {
                phase: ConnectionPhase::Connected,
                connection: Some(connection),
            }),
            phase_tx,
            subscriptions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
            supervisor: Mutex::new(None),
        });

        let handle = tokio::spawn(supervise(
            Arc::downgrade(&inner),
            inner.shutdown.clone(),
        ));
        *inner.supervisor.lock() = Some(handle);

        info!(exchange = %inner.config.exchange, "消息代理发送器已连接");
        Ok(Self { inner })
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// 当前连接阶段
    pub fn phase(&self) -> ConnectionPhase {
        *self.inner.phase_tx.borrow()
    }

    /// 订阅连接阶段变化
    pub fn watch_phase(&self) -> watch::Receiver<ConnectionPhase> {
        self.inner.phase_tx.subscribe()
    }

    /// 已注册的订阅数
    pub fn active_subscriptions(&self) -> usize {
        self.inner.subscriptions.lock().len()
    }

    /// 发布通知，等待代理确认
    ///
    /// 确认超时计为一次失败。
    pub async fn publish(&self, ctx: &CancellationToken, notification: &Notification) -> Result<()> {
        self.publish_routed(ctx, notification, &notification.routing_key())
            .await
    }

    /// 以指定路由键发布通知
    #[instrument(skip(self, ctx, notification), fields(notification_id = %notification.id))]
    pub async fn publish_routed(
        &self,
        ctx: &CancellationToken,
        notification: &Notification,
        routing_key: &str,
    ) -> Result<()> {
        let payload = notification.encode()?;
        let properties =
            PublishProperties::persistent_json(&notification.id, self.expiration_for(notification));
        let timeout = self.inner.config.publish_timeout;

        let state = self.inner.state.read().await;
        let connection = state.live()?;

        let publish = connection.publish(
            &self.inner.config.exchange,
            routing_key,
            &payload,
            &properties,
        );
        let result = tokio::select! {
            _ = ctx.cancelled() => Err(NotificationError::Cancelled),
            res = tokio::time::timeout(timeout, publish) => match res {
                Ok(res) => res,
                Err(_) => Err(NotificationError::Timeout {
                    operation: "broker_publish",
                    duration: timeout,
                }),
            },
        };
        drop(state);

        match &result {
            Ok(()) => debug!(routing_key = %routing_key, "通知已发布到消息代理"),
            Err(e) => warn!(routing_key = %routing_key, error = %e, "发布到消息代理失败"),
        }
        result
    }

    /// 消息 TTL：取配置值与通知剩余有效期中较小者
    fn expiration_for(&self, notification: &Notification) -> Duration {
        let ttl = self.inner.config.message_ttl;
        match notification.expires_at {
            Some(at) => (at - Utc::now())
                .to_std()
                .map(|left| left.min(ttl))
                .unwrap_or(Duration::from_secs(1))
                .max(Duration::from_secs(1)),
            None => ttl,
        }
    }

    /// 订阅用户专属持久队列
    ///
    /// `ctx` 被取消时订阅结束；连接恢复后订阅会自动重建。
    #[instrument(skip(self, ctx, options), fields(user_id = %options.user_id))]
    pub async fn subscribe(
        &self,
        ctx: &CancellationToken,
        options: SubscribeOptions,
    ) -> Result<QueueSubscription> {
        if options.user_id.trim().is_empty() {
            return Err(NotificationError::Validation("userID 不能为空".to_string()));
        }

        let buffer = options
            .buffer
            .unwrap_or(self.inner.config.subscriber_buffer)
            .max(1);
        let (tx, rx) = mpsc::channel(buffer);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = ctx.child_token();

        let subscription = Arc::new(ActiveSubscription {
            id,
            options,
            output: tx,
            cancel: cancel.clone(),
            workers: Mutex::new(None),
        });

        // 先注册再启动，保证期间发生的重连也会重建该订阅
        self.inner
            .subscriptions
            .lock()
            .insert(id, subscription.clone());

        if let Err(e) = self.inner.start_consumer(&subscription).await {
            self.inner.subscriptions.lock().remove(&id);
            return Err(e);
        }

        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            cancel.cancelled().await;
            if let Some(inner) = weak.upgrade() {
                inner.remove_subscription(id);
            }
        });

        Ok(QueueSubscription {
            id,
            receiver: rx,
            cancel: subscription.cancel.clone(),
        })
    }

    /// 拉取用户队列中积压的消息
    ///
    /// 只读取已有绑定的队列；用户从未订阅过时返回空列表。
    /// 在空闲窗口内没有新消息或达到 `limit` 时返回，已拉取的消息被确认移出队列。
    pub async fn drain_user_queue(
        &self,
        ctx: &CancellationToken,
        role: UserRole,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<Notification>> {
        let queue = user_queue_name(role, user_id);
        let idle = self.inner.config.fetch_idle;

        let state = self.inner.state.read().await;
        let connection = state.live()?;
        connection.declare_queue(&queue).await?;
        let mut feed = connection
            .consume(&queue, &format!("fetch-{}", uuid::Uuid::now_v7()))
            .await?;
        drop(state);

        let mut out = Vec::new();
        while out.len() < limit {
            let delivery = tokio::select! {
                _ = ctx.cancelled() => return Err(NotificationError::Cancelled),
                next = tokio::time::timeout(idle, feed.recv()) => match next {
                    Ok(Some(delivery)) => delivery,
                    Ok(None) | Err(_) => break,
                },
            };

            match Notification::decode(&delivery.payload) {
                Ok(n) if n.user_id == user_id => {
                    delivery.ack().await?;
                    out.push(n);
                }
                Ok(_) => delivery.ack().await?,
                Err(e) => {
                    warn!(queue = %queue, error = %e, "拉取到无法解码的消息，丢弃");
                    delivery.nack(false).await?;
                }
            }
        }
        debug!(queue = %queue, count = out.len(), "用户队列拉取完成");
        Ok(out)
    }
}

impl QueueInner {
    async fn current_connection(&self) -> Option<Arc<dyn BrokerConnection>> {
        self.state.read().await.connection.clone()
    }

    fn transition(&self, state: &mut ConnectionState, phase: ConnectionPhase) {
        if state.phase != phase {
            debug!(from = ?state.phase, to = ?phase, "代理连接阶段变化");
        }
        state.phase = phase;
        self.phase_tx.send_replace(phase);
    }

    fn remove_subscription(&self, id: u64) {
        if let Some(sub) = self.subscriptions.lock().remove(&id) {
            if let Some(workers) = sub.workers.lock().take() {
                workers.cancel();
            }
            debug!(subscription_id = id, user_id = %sub.options.user_id, "代理订阅已移除");
        }
    }

    /// 在当前连接上声明、绑定并消费订阅的队列
    async fn start_consumer(&self, sub: &ActiveSubscription) -> Result<()> {
        let queue = sub.options.queue_name();
        let keys = binding_keys(sub.options.role, &sub.options.categories, &sub.options.types);

        let state = self.state.read().await;
        let connection = state.live()?;
        connection.declare_queue(&queue).await?;
        for key in &keys {
            connection
                .bind_queue(&queue, &self.config.exchange, key)
                .await?;
        }
        let feed = connection
            .consume(&queue, &format!("sub-{}", sub.id))
            .await?;
        drop(state);

        let workers = sub.cancel.child_token();
        if let Some(previous) = sub.workers.lock().replace(workers.clone()) {
            previous.cancel();
        }
        spawn_workers(
            feed,
            sub.output.clone(),
            sub.options.user_id.clone(),
            self.config.consumer_workers,
            workers,
        );

        debug!(queue = %queue, bindings = ?keys, "代理订阅消费已启动");
        Ok(())
    }

    /// 重建全部已注册订阅，单个失败只记录日志
    async fn resubscribe_all(&self) -> usize {
        let subscriptions: Vec<Arc<ActiveSubscription>> = {
            let mut registry = self.subscriptions.lock();
            registry.retain(|_, sub| !sub.output.is_closed() && !sub.cancel.is_cancelled());
            registry.values().cloned().collect()
        };

        let mut restored = 0;
        for sub in &subscriptions {
            match self.start_consumer(sub).await {
                Ok(()) => restored += 1,
                Err(e) => error!(
                    subscription_id = sub.id,
                    user_id = %sub.options.user_id,
                    error = %e,
                    "重建代理订阅失败"
                ),
            }
        }
        restored
    }

    /// 按固定间隔重连直至成功；关闭时返回 false
    async fn reconnect(&self) -> bool {
        {
            let mut state = self.state.write().await;
            state.connection = None;
            self.transition(&mut state, ConnectionPhase::Disconnected);
        }
        warn!("消息代理连接已断开，开始重连");

        loop {
            if self.shutdown.is_cancelled() {
                return false;
            }

            {
                let mut state = self.state.write().await;
                self.transition(&mut state, ConnectionPhase::Connecting);
            }

            let attempt = open_connection(
                self.connector.as_ref(),
                &self.config.exchange,
                self.config.reconnect_interval,
            );

            match attempt.await {
                Ok(connection) => {
                    {
                        let mut state = self.state.write().await;
                        state.connection = Some(connection);
                        self.transition(&mut state, ConnectionPhase::Connected);
                    }
                    metrics::record_broker_reconnect();
                    let restored = self.resubscribe_all().await;
                    info!(restored, "消息代理已重连，订阅已重建");
                    return true;
                }
                Err(e) => {
                    {
                        let mut state = self.state.write().await;
                        self.transition(&mut state, ConnectionPhase::Disconnected);
                    }
                    warn!(
                        error = %e,
                        retry_in = ?self.config.reconnect_interval,
                        "重连消息代理失败"
                    );
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return false,
                        _ = tokio::time::sleep(self.config.reconnect_interval) => {}
                    }
                }
            }
        }
    }
}

/// 建立连接并声明交换机，整体不超过 `limit`
async fn open_connection(
    connector: &dyn BrokerConnector,
    exchange: &str,
    limit: Duration,
) -> Result<Arc<dyn BrokerConnection>> {
    let attempt = async {
        let connection = connector.connect().await?;
        connection.declare_exchange(exchange).await?;
        Ok::<_, NotificationError>(connection)
    };
    tokio::time::timeout(limit, attempt)
        .await
        .map_err(|_| NotificationError::Timeout {
            operation: "连接消息代理",
            duration: limit,
        })?
}

/// 重连监督任务：阻塞等待连接断开信号，然后驱动重连
async fn supervise(inner: Weak<QueueInner>, shutdown: CancellationToken) {
    loop {
        let connection = match inner.upgrade() {
            Some(inner) => inner.current_connection().await,
            None => break,
        };

        if let Some(connection) = connection {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = connection.closed() => {}
            }
        }

        let Some(inner) = inner.upgrade() else {
            break;
        };
        if !inner.reconnect().await {
            break;
        }
    }
    debug!("代理重连监督任务已退出");
}

#[async_trait]
impl Sender for QueueSender {
    fn method(&self) -> DeliveryMethod {
        DeliveryMethod::Queue
    }

    async fn send(&self, ctx: &CancellationToken, notification: &mut Notification) -> Result<()> {
        let now = Utc::now();
        notification
            .delivery_status_mut(DeliveryMethod::Queue)
            .record_attempt(now);

        match self.publish(ctx, notification).await {
            Ok(()) => {
                notification
                    .delivery_status_mut(DeliveryMethod::Queue)
                    .mark_delivered(now);
                Ok(())
            }
            Err(e) => {
                notification
                    .delivery_status_mut(DeliveryMethod::Queue)
                    .mark_failed(e.to_string());
                Err(e)
            }
        }
    }

    async fn close(&self) -> Result<()> {
        self.inner.shutdown.cancel();
        if let Some(handle) = self.inner.supervisor.lock().take() {
            handle.abort();
        }

        let subscriptions: Vec<Arc<ActiveSubscription>> =
            self.inner.subscriptions.lock().drain().map(|(_, s)| s).collect();
        for sub in &subscriptions {
            sub.cancel.cancel();
        }

        let connection = {
            let mut state = self.inner.state.write().await;
            let connection = state.connection.take();
            self.inner
                .transition(&mut state, ConnectionPhase::Disconnected);
            connection
        };
        if let Some(connection) = connection {
            connection.close().await?;
        }

        info!(
            subscriptions = subscriptions.len(),
            "消息代理发送器已关闭"
        );
        Ok(())
    }
}
