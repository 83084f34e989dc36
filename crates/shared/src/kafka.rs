//! Kafka 基础设施封装
//!
//! 统一生产者/消费者/管理客户端的 `ClientConfig` 构建，并提供
//! 拥有所有权的消费消息表示，避免各模块重复编写样板代码。

use std::collections::HashMap;

use rdkafka::config::ClientConfig;
use rdkafka::message::{BorrowedMessage, Headers, Message};

use crate::config::KafkaConfig;
use crate::error::InfraError;

// ---------------------------------------------------------------------------
// ClientConfig 构建
// ---------------------------------------------------------------------------

/// 生产者配置
///
/// `message.timeout.ms` 与发布确认超时保持一致，超时由上层计为一次失败。
pub fn producer_config(config: &KafkaConfig, message_timeout_ms: u64) -> ClientConfig {
    let mut client = ClientConfig::new();
    client
        .set("bootstrap.servers", &config.brokers)
        .set("message.timeout.ms", message_timeout_ms.to_string())
        .set("enable.idempotence", "true")
        .set("acks", "all");
    client
}

/// 消费者配置
///
/// 关闭自动提交，由调用方在确认（ack）时显式提交位点。
pub fn consumer_config(config: &KafkaConfig, group_id: &str) -> ClientConfig {
    let mut client = ClientConfig::new();
    client
        .set("bootstrap.servers", &config.brokers)
        .set("group.id", group_id)
        .set("auto.offset.reset", &config.auto_offset_reset)
        .set("enable.auto.commit", "false");
    client
}

/// 管理客户端配置
pub fn admin_config(config: &KafkaConfig) -> ClientConfig {
    let mut client = ClientConfig::new();
    client.set("bootstrap.servers", &config.brokers);
    client
}

// ---------------------------------------------------------------------------
// ConsumerMessage
// ---------------------------------------------------------------------------

/// 消费到的 Kafka 消息的统一表示
///
/// `BorrowedMessage` 绑定在消费者的生命周期上，转成自有数据后才能交给回执
/// 跨任务持有。
#[derive(Debug, Clone)]
pub struct ConsumerMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub timestamp: Option<i64>,
    pub headers: HashMap<String, String>,
}

impl ConsumerMessage {
    /// 复制键、负载与全部 UTF-8 消息头
    pub fn from_borrowed(msg: &BorrowedMessage<'_>) -> Self {
        let key = msg
            .key()
            .and_then(|k| std::str::from_utf8(k).ok())
            .map(String::from);

        let payload = msg.payload().map(|p| p.to_vec()).unwrap_or_default();
        let timestamp = msg.timestamp().to_millis();

        let mut headers = HashMap::new();
        if let Some(h) = msg.headers() {
            for idx in 0..h.count() {
                let header = h.get(idx);
                if let Some(raw) = header.value
                    && let Ok(value) = std::str::from_utf8(raw)
                {
                    headers.insert(header.key.to_string(), value.to_string());
                }
            }
        }

        Self {
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            key,
            payload,
            timestamp,
            headers,
        }
    }

    /// 读取消息头，缺失时返回 None
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// 将负载视为 UTF-8 字符串返回
    pub fn payload_str(&self) -> Result<&str, InfraError> {
        std::str::from_utf8(&self.payload)
            .map_err(|e| InfraError::Payload(format!("非 UTF-8 编码: {e}")))
    }
}
