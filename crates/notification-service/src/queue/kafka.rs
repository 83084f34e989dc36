//! 基于 Kafka 的消息代理实现
//!
//! 把 topic 交换机语义映射到 Kafka：
//! - 交换机对应 topic，经 AdminClient 创建，`retention.ms` 取消息 TTL
//! - 队列对应消费组（group.id = 队列名），绑定模式在客户端按 topic 规则过滤
//! - 路由键同时作为记录 key 与 `routing-key` 消息头
//! - ack 提交位点；nack 重新入队时先把原消息追加回 topic 再提交
//!
//! 多个 worker 乱序确认时位点按最后一次提交推进，崩溃恢复属于至少一次语义。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::{ClientContext, Offset, TopicPartitionList};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tourney_shared::config::{BrokerConfig, KafkaConfig};
use tourney_shared::kafka::{ConsumerMessage, admin_config, consumer_config, producer_config};
use tracing::{debug, error, info, warn};

use super::broker::{
    Acknowledger, BrokerConnection, BrokerConnector, Delivery, PublishProperties,
};
use super::routing::topic_matches;
use crate::error::{NotificationError, Result};

const SERVICE: &str = "kafka";

const HEADER_ROUTING_KEY: &str = "routing-key";
const HEADER_MESSAGE_ID: &str = "message-id";
const HEADER_EXPIRES_AT: &str = "expires-at";

const FEED_PREFETCH: usize = 16;
/// 生产者本地队列满时的最长等待
const ENQUEUE_TIMEOUT: Duration = Duration::from_secs(5);
const METADATA_TIMEOUT: Duration = Duration::from_secs(5);

fn kafka_err(e: impl std::fmt::Display) -> NotificationError {
    NotificationError::connectivity(SERVICE, e.to_string())
}

// ---------------------------------------------------------------------------
// 连接断开信号
// ---------------------------------------------------------------------------

/// 客户端上下文：全部 broker 不可达时触发连接断开信号
#[derive(Clone)]
struct ClosedSignal {
    closed: CancellationToken,
}

impl ClientContext for ClosedSignal {
    fn error(&self, error: KafkaError, reason: &str) {
        if matches!(
            error,
            KafkaError::Global(RDKafkaErrorCode::AllBrokersDown)
        ) {
            if !self.closed.is_cancelled() {
                warn!(reason, "Kafka 全部 broker 不可达，连接标记为断开");
            }
            self.closed.cancel();
        } else {
            error!(error = %error, reason, "Kafka 客户端错误");
        }
    }
}

// ---------------------------------------------------------------------------
// KafkaBroker
// ---------------------------------------------------------------------------

/// Kafka 连接器
#[derive(Clone)]
pub struct KafkaBroker {
    kafka: KafkaConfig,
    message_ttl: Duration,
    publish_timeout: Duration,
}

impl KafkaBroker {
    pub fn new(kafka: KafkaConfig, broker: &BrokerConfig) -> Result<Self> {
        if kafka.brokers.trim().is_empty() {
            return Err(NotificationError::Configuration(
                "kafka.brokers 不能为空".to_string(),
            ));
        }
        let ttl_secs = u64::try_from(broker.message_ttl_days.max(1)).unwrap_or(30) * 24 * 3600;
        Ok(Self {
            kafka,
            message_ttl: Duration::from_secs(ttl_secs),
            publish_timeout: Duration::from_secs(broker.publish_timeout_secs.max(1)),
        })
    }
}

#[async_trait]
impl BrokerConnector for KafkaBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>> {
        let closed = CancellationToken::new();
        let timeout_ms = self.publish_timeout.as_millis() as u64;

        let producer: FutureProducer<ClosedSignal> = producer_config(&self.kafka, timeout_ms)
            .create_with_context(ClosedSignal {
                closed: closed.clone(),
            })
            .map_err(kafka_err)?;

        // 拉取一次元数据，确认 broker 可达
        let probe = producer.clone();
        tokio::task::spawn_blocking(move || {
            probe.client().fetch_metadata(None, METADATA_TIMEOUT).map(|_| ())
        })
        .await
        .map_err(kafka_err)?
        .map_err(kafka_err)?;

        let admin: AdminClient<DefaultClientContext> =
            admin_config(&self.kafka).create().map_err(kafka_err)?;

        info!(brokers = %self.kafka.brokers, "Kafka 代理连接已建立");

        Ok(Arc::new(KafkaConnection {
            kafka: self.kafka.clone(),
            message_ttl: self.message_ttl,
            producer,
            admin,
            closed,
            queues: Mutex::new(HashMap::new()),
        }))
    }
}

// ---------------------------------------------------------------------------
// KafkaConnection
// ---------------------------------------------------------------------------

type Bindings = Arc<Mutex<HashSet<(String, String)>>>;

struct KafkaConnection {
    kafka: KafkaConfig,
    message_ttl: Duration,
    producer: FutureProducer<ClosedSignal>,
    admin: AdminClient<DefaultClientContext>,
    closed: CancellationToken,
    /// 队列名 -> (交换机, 绑定模式)
    queues: Mutex<HashMap<String, Bindings>>,
}

impl KafkaConnection {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(NotificationError::connectivity(SERVICE, "连接已断开"));
        }
        Ok(())
    }

    fn bindings(&self, queue: &str) -> Result<Bindings> {
        self.queues
            .lock()
            .get(queue)
            .cloned()
            .ok_or_else(|| NotificationError::connectivity(SERVICE, format!("队列不存在: {queue}")))
    }
}

#[async_trait]
impl BrokerConnection for KafkaConnection {
    async fn declare_exchange(&self, exchange: &str) -> Result<()> {
        self.ensure_open()?;
        let retention = self.message_ttl.as_millis().to_string();
        let topic = NewTopic::new(
            exchange,
            self.kafka.partitions,
            TopicReplication::Fixed(self.kafka.replication_factor),
        )
        .set("retention.ms", &retention);

        let results = self
            .admin
            .create_topics([&topic], &AdminOptions::new())
            .await
            .map_err(kafka_err)?;

        for result in results {
            match result {
                Ok(name) => info!(topic = %name, "已创建通知 topic"),
                Err((name, RDKafkaErrorCode::TopicAlreadyExists)) => {
                    debug!(topic = %name, "通知 topic 已存在");
                }
                Err((name, code)) => {
                    return Err(kafka_err(format!("创建 topic {name} 失败: {code}")));
                }
            }
        }
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
        let expires_at = Utc::now()
            + chrono::Duration::from_std(properties.expiration)
                .unwrap_or_else(|_| chrono::Duration::days(30));
        let expires_at = expires_at.timestamp_millis().to_string();

        let headers = OwnedHeaders::new()
            .insert(Header {
                key: HEADER_ROUTING_KEY,
                value: Some(routing_key),
            })
            .insert(Header {
                key: HEADER_MESSAGE_ID,
                value: Some(properties.message_id.as_str()),
            })
            .insert(Header {
                key: HEADER_EXPIRES_AT,
                value: Some(expires_at.as_str()),
            });

        let record = FutureRecord::to(exchange)
            .key(routing_key)
            .payload(payload)
            .headers(headers);

        self.producer
            .send(record, ENQUEUE_TIMEOUT)
            .await
            .map_err(|(e, _)| kafka_err(e))?;
        Ok(())
    }

    async fn declare_queue(&self, queue: &str) -> Result<()> {
        self.ensure_open()?;
        self.queues.lock().entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, binding_key: &str) -> Result<()> {
        self.ensure_open()?;
        self.bindings(queue)?
            .lock()
            .insert((exchange.to_string(), binding_key.to_string()));
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<mpsc::Receiver<Delivery>> {
        self.ensure_open()?;
        let bindings = self.bindings(queue)?;
        let topics: Vec<String> = {
            let set = bindings.lock();
            let mut topics: Vec<String> = set.iter().map(|(ex, _)| ex.clone()).collect();
            topics.sort();
            topics.dedup();
            topics
        };
        if topics.is_empty() {
            return Err(NotificationError::connectivity(
                SERVICE,
                format!("队列 {queue} 尚未绑定任何交换机"),
            ));
        }

        let consumer: StreamConsumer = consumer_config(&self.kafka, queue)
            .set("client.id", consumer_tag)
            .create()
            .map_err(kafka_err)?;
        let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        consumer.subscribe(&topic_refs).map_err(kafka_err)?;
        let consumer = Arc::new(consumer);

        let (tx, rx) = mpsc::channel(FEED_PREFETCH);
        let producer = self.producer.clone();
        let closed = self.closed.clone();
        let queue = queue.to_string();

        info!(queue = %queue, ?topics, "Kafka 消费者已启动");

        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    biased;
                    _ = closed.cancelled() => break,
                    _ = tx.closed() => break,
                    received = consumer.recv() => match received {
                        Ok(borrowed) => ConsumerMessage::from_borrowed(&borrowed),
                        Err(e) => {
                            error!(queue = %queue, error = %e, "接收 Kafka 消息出错");
                            continue;
                        }
                    },
                };

                let acker = KafkaAcker {
                    consumer: consumer.clone(),
                    producer: producer.clone(),
                    message,
                };

                let routing_key = acker.routing_key().to_string();
                let matched = bindings
                    .lock()
                    .iter()
                    .any(|(ex, pattern)| *ex == acker.message.topic && topic_matches(pattern, &routing_key));
                if !matched || acker.is_expired() {
                    if let Err(e) = acker.commit() {
                        warn!(queue = %queue, error = %e, "跳过消息时提交位点失败");
                    }
                    continue;
                }

                let payload = acker.message.payload.clone();
                let delivery = Delivery::new(routing_key, payload, Box::new(acker));
                if tx.send(delivery).await.is_err() {
                    break;
                }
            }
            debug!(queue = %queue, "Kafka 消费者已停止");
        });

        Ok(rx)
    }

    async fn closed(&self) {
        self.closed.cancelled().await;
    }

    fn is_open(&self) -> bool {
        !self.closed.is_cancelled()
    }

    async fn close(&self) -> Result<()> {
        self.closed.cancel();
        let producer = self.producer.clone();
        tokio::task::spawn_blocking(move || producer.flush(Duration::from_secs(5)))
            .await
            .map_err(kafka_err)?
            .map_err(kafka_err)?;
        info!("Kafka 代理连接已关闭");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// 回执
// ---------------------------------------------------------------------------

struct KafkaAcker {
    consumer: Arc<StreamConsumer>,
    producer: FutureProducer<ClosedSignal>,
    message: ConsumerMessage,
}

impl KafkaAcker {
    fn routing_key(&self) -> &str {
        self.message
            .header(HEADER_ROUTING_KEY)
            .or(self.message.key.as_deref())
            .unwrap_or_default()
    }

    fn is_expired(&self) -> bool {
        self.message
            .header(HEADER_EXPIRES_AT)
            .and_then(|v| v.parse::<i64>().ok())
            .is_some_and(|at| at <= Utc::now().timestamp_millis())
    }

    fn commit(&self) -> Result<()> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(
            &self.message.topic,
            self.message.partition,
            Offset::Offset(self.message.offset + 1),
        )
        .map_err(kafka_err)?;
        self.consumer
            .commit(&tpl, CommitMode::Async)
            .map_err(kafka_err)
    }

    async fn reappend(&self) -> Result<()> {
        let mut headers = OwnedHeaders::new();
        for (key, value) in &self.message.headers {
            headers = headers.insert(Header {
                key: key.as_str(),
                value: Some(value.as_str()),
            });
        }
        let key = self.routing_key().to_string();
        let record = FutureRecord::to(&self.message.topic)
            .key(key.as_str())
            .payload(self.message.payload.as_slice())
            .headers(headers);
        self.producer
            .send(record, ENQUEUE_TIMEOUT)
            .await
            .map_err(|(e, _)| kafka_err(e))?;
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for KafkaAcker {
    async fn ack(self: Box<Self>) -> Result<()> {
        self.commit()
    }

    async fn nack(self: Box<Self>, requeue: bool) -> Result<()> {
        if requeue {
            self.reappend().await?;
        }
        self.commit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_requires_brokers() {
        let kafka = KafkaConfig {
            brokers: " ".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            KafkaBroker::new(kafka, &BrokerConfig::default()),
            Err(NotificationError::Configuration(_))
        ));
    }

    #[test]
    fn test_ttl_derived_from_config() {
        let broker = KafkaBroker::new(KafkaConfig::default(), &BrokerConfig::default()).unwrap();
        assert_eq!(broker.message_ttl, Duration::from_secs(30 * 24 * 3600));
        assert_eq!(broker.publish_timeout, Duration::from_secs(5));
    }

    #[tokio::test]
    #[ignore = "需要可用的 Kafka"]
    async fn test_connect_and_declare() {
        let broker = KafkaBroker::new(KafkaConfig::default(), &BrokerConfig::default()).unwrap();
        let conn = broker.connect().await.unwrap();
        conn.declare_exchange("notifications-test").await.unwrap();
        conn.close().await.unwrap();
    }
}
