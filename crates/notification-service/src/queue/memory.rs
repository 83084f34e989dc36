//! 进程内消息代理
//!
//! 独立模式与测试使用。实现 topic 交换机的最小语义：持久队列、按模式绑定、
//! 消息 TTL、未确认消息在回执丢弃时自动重新入队。
//! 支持故障注入：拒绝新连接、令后续 N 次发布失败、断开全部存活连接。

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::broker::{
    Acknowledger, BrokerConnection, BrokerConnector, Delivery, PublishProperties,
};
use super::routing::topic_matches;
use crate::error::{NotificationError, Result};

const SERVICE: &str = "memory-broker";

/// 投递流缓冲，相当于 prefetch
const FEED_PREFETCH: usize = 16;

#[derive(Debug, Clone)]
struct StoredMessage {
    routing_key: String,
    payload: Vec<u8>,
    expires_at: Instant,
}

#[derive(Default)]
struct MemoryQueue {
    messages: VecDeque<StoredMessage>,
    /// (交换机, 绑定模式)
    bindings: HashSet<(String, String)>,
    notify: Arc<Notify>,
}

/// 已发布消息的记录，供断言使用
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub message_id: String,
    pub payload: Vec<u8>,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashSet<String>,
    queues: HashMap<String, MemoryQueue>,
    published: Vec<PublishedMessage>,
    connections: Vec<CancellationToken>,
}

struct Shared {
    state: Mutex<BrokerState>,
    available: AtomicBool,
    fail_publishes: AtomicU32,
    hang_connects: AtomicU32,
}

impl Shared {
    fn requeue(&self, queue: &str, message: StoredMessage) {
        let mut state = self.state.lock();
        if let Some(q) = state.queues.get_mut(queue) {
            q.messages.push_front(message);
            q.notify.notify_one();
        }
    }

    /// 弹出下一条未过期消息
    fn pop(&self, queue: &str) -> Option<StoredMessage> {
        let mut state = self.state.lock();
        let q = state.queues.get_mut(queue)?;
        let now = Instant::now();
        while let Some(message) = q.messages.pop_front() {
            if message.expires_at > now {
                return Some(message);
            }
            debug!(queue, routing_key = %message.routing_key, "消息已超过 TTL，丢弃");
        }
        None
    }
}

/// 进程内消息代理
#[derive(Clone)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BrokerState::default()),
                available: AtomicBool::new(true),
                fail_publishes: AtomicU32::new(0),
                hang_connects: AtomicU32::new(0),
            }),
        }
    }

    /// 设置代理是否接受新连接
    pub fn set_available(&self, available: bool) {
        self.shared.available.store(available, Ordering::Release);
    }

    /// 令接下来的 `count` 次发布失败
    pub fn fail_next_publishes(&self, count: u32) {
        self.shared.fail_publishes.store(count, Ordering::Release);
    }

    /// 令接下来的 `count` 次建连永久挂起
    pub fn hang_next_connects(&self, count: u32) {
        self.shared.hang_connects.store(count, Ordering::Release);
    }

    /// 断开全部存活连接，触发连接断开信号
    pub fn drop_connections(&self) {
        let connections = std::mem::take(&mut self.shared.state.lock().connections);
        info!(count = connections.len(), "断开全部内存代理连接");
        for token in connections {
            token.cancel();
        }
    }

    /// 已发布消息（按发布顺序）
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.shared.state.lock().published.clone()
    }

    /// 队列中待消费的消息数
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.shared
            .state
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.messages.len())
    }

    /// 队列的绑定模式
    pub fn bindings(&self, queue: &str) -> Vec<String> {
        let state = self.shared.state.lock();
        let mut keys: Vec<String> = state
            .queues
            .get(queue)
            .map(|q| q.bindings.iter().map(|(_, key)| key.clone()).collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    /// 存活连接数
    pub fn connection_count(&self) -> usize {
        self.shared.state.lock().connections.len()
    }
}

#[async_trait]
impl BrokerConnector for MemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>> {
        if !self.shared.available.load(Ordering::Acquire) {
            return Err(NotificationError::connectivity(SERVICE, "代理不可用"));
        }
        let hang = self
            .shared
            .hang_connects
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if hang {
            std::future::pending::<()>().await;
        }
        let token = CancellationToken::new();
        self.shared.state.lock().connections.push(token.clone());
        Ok(Arc::new(MemoryConnection {
            shared: self.shared.clone(),
            token,
        }))
    }
}

// ---------------------------------------------------------------------------
// 连接
// ---------------------------------------------------------------------------

struct MemoryConnection {
    shared: Arc<Shared>,
    token: CancellationToken,
}

impl MemoryConnection {
    fn ensure_open(&self) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(NotificationError::connectivity(SERVICE, "连接已断开"));
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn declare_exchange(&self, exchange: &str) -> Result<()> {
        self.ensure_open()?;
        self.shared
            .state
            .lock()
            .exchanges
            .insert(exchange.to_string());
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &PublishProperties,
    ) -> Result<()> {
        self.ensure_open()?;

        let injected = self
            .shared
            .fail_publishes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(NotificationError::connectivity(SERVICE, "发布被拒绝"));
        }

        let mut state = self.shared.state.lock();
        if !state.exchanges.contains(exchange) {
            return Err(NotificationError::connectivity(
                SERVICE,
                format!("交换机不存在: {exchange}"),
            ));
        }

        let expires_at = Instant::now() + properties.expiration;
        for queue in state.queues.values_mut() {
            let bound = queue
                .bindings
                .iter()
                .any(|(ex, pattern)| ex == exchange && topic_matches(pattern, routing_key));
            if bound {
                queue.messages.push_back(StoredMessage {
                    routing_key: routing_key.to_string(),
                    payload: payload.to_vec(),
                    expires_at,
                });
                queue.notify.notify_one();
            }
        }

        state.published.push(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            message_id: properties.message_id.clone(),
            payload: payload.to_vec(),
        });
        Ok(())
    }

    async fn declare_queue(&self, queue: &str) -> Result<()> {
        self.ensure_open()?;
        self.shared
            .state
            .lock()
            .queues
            .entry(queue.to_string())
            .or_default();
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, binding_key: &str) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.shared.state.lock();
        let q = state.queues.get_mut(queue).ok_or_else(|| {
            NotificationError::connectivity(SERVICE, format!("队列不存在: {queue}"))
        })?;
        q.bindings
            .insert((exchange.to_string(), binding_key.to_string()));
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<mpsc::Receiver<Delivery>> {
        self.ensure_open()?;
        let notify = self
            .shared
            .state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.notify.clone())
            .ok_or_else(|| {
                NotificationError::connectivity(SERVICE, format!("队列不存在: {queue}"))
            })?;

        let (tx, rx) = mpsc::channel(FEED_PREFETCH);
        let shared = self.shared.clone();
        let token = self.token.clone();
        let queue = queue.to_string();
        let consumer_tag = consumer_tag.to_string();

        tokio::spawn(async move {
            loop {
                let notified = notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if let Some(message) = shared.pop(&queue) {
                    let delivery = Delivery::new(
                        message.routing_key.clone(),
                        message.payload.clone(),
                        Box::new(MemoryAcker {
                            shared: shared.clone(),
                            queue: queue.clone(),
                            message: Some(message),
                        }),
                    );
                    tokio::select! {
                        _ = token.cancelled() => break,
                        sent = tx.send(delivery) => {
                            // 接收端已丢弃，回执随之析构并把消息放回队列
                            if sent.is_err() {
                                break;
                            }
                        }
                    }
                    continue;
                }

                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tx.closed() => break,
                    _ = &mut notified => {}
                }
            }
            debug!(queue = %queue, consumer_tag = %consumer_tag, "内存代理消费者已停止");
        });

        Ok(rx)
    }

    async fn closed(&self) {
        self.token.cancelled().await;
    }

    fn is_open(&self) -> bool {
        !self.token.is_cancelled()
    }

    async fn close(&self) -> Result<()> {
        self.token.cancel();
        let mut state = self.shared.state.lock();
        state.connections.retain(|t| !t.is_cancelled());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// 回执
// ---------------------------------------------------------------------------

/// 未确认即析构的回执会把消息放回队首，与 AMQP 信道关闭时的行为一致
struct MemoryAcker {
    shared: Arc<Shared>,
    queue: String,
    message: Option<StoredMessage>,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(self: Box<Self>) -> Result<()> {
        let mut this = self;
        this.message = None;
        Ok(())
    }

    async fn nack(self: Box<Self>, requeue: bool) -> Result<()> {
        let mut this = self;
        if let Some(message) = this.message.take()
            && requeue
        {
            this.shared.requeue(&this.queue, message);
        }
        Ok(())
    }
}

impl Drop for MemoryAcker {
    fn drop(&mut self) {
        if let Some(message) = self.message.take() {
            self.shared.requeue(&self.queue, message);
        }
    }
}
