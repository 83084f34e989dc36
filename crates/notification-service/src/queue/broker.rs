//! 消息代理抽象
//!
//! 以 topic 交换机语义描述代理能力：声明交换机、带确认的发布、
//! 声明持久队列、按模式绑定、消费投递流以及连接断开信号。

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

/// 发布属性
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishProperties {
    pub message_id: String,
    /// 持久化投递
    pub persistent: bool,
    /// 消息在代理中的存活时间
    pub expiration: Duration,
    pub content_type: &'static str,
}

impl PublishProperties {
    pub fn persistent_json(message_id: impl Into<String>, expiration: Duration) -> Self {
        Self {
            message_id: message_id.into(),
            persistent: true,
            expiration,
            content_type: "application/json",
        }
    }
}

/// 单条投递的确认回执
#[async_trait]
pub trait Acknowledger: Send {
    async fn ack(self: Box<Self>) -> Result<()>;

    /// requeue 为 true 时消息重新入队，否则丢弃
    async fn nack(self: Box<Self>, requeue: bool) -> Result<()>;
}

/// 从代理消费到的一条消息
pub struct Delivery {
    pub routing_key: String,
    pub payload: Vec<u8>,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        routing_key: impl Into<String>,
        payload: Vec<u8>,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            routing_key: routing_key.into(),
            payload,
            acker,
        }
    }

    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn nack(self, requeue: bool) -> Result<()> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("routing_key", &self.routing_key)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// 建立代理连接
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>>;
}

/// 一条存活的代理连接
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// 声明持久的 topic 交换机（幂等）
    async fn declare_exchange(&self, exchange: &str) -> Result<()>;

    /// 发布消息，收到代理确认后返回
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &PublishProperties,
    ) -> Result<()>;

    /// 声明持久队列（幂等）
    async fn declare_queue(&self, queue: &str) -> Result<()>;

    /// 按 topic 模式绑定队列与交换机（幂等）
    async fn bind_queue(&self, queue: &str, exchange: &str, binding_key: &str) -> Result<()>;

    /// 开始消费队列，返回投递流；连接断开时流结束
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<mpsc::Receiver<Delivery>>;

    /// 连接断开时完成
    async fn closed(&self);

    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<()>;
}
