//! 共享库
//!
//! 包含通知服务共用的配置、错误处理、数据库连接、Kafka 客户端配置与可观测性基础设施代码。

pub mod config;
pub mod database;
pub mod error;
pub mod kafka;
pub mod observability;
