//! 消息代理渠道
//!
//! `broker` 定义 topic 交换机能力，`kafka` 与 `memory` 为两种实现；
//! `QueueSender` 在其上维护连接状态机、发布确认与订阅重建。

pub mod broker;
pub mod consumer;
pub mod kafka;
pub mod memory;
pub mod routing;
pub mod sender;

pub use broker::{Acknowledger, BrokerConnection, BrokerConnector, Delivery, PublishProperties};
pub use kafka::KafkaBroker;
pub use memory::{MemoryBroker, PublishedMessage};
pub use routing::{binding_keys, topic_matches, user_queue_name};
pub use sender::{ConnectionPhase, QueueConfig, QueueSender, QueueSubscription, SubscribeOptions};
