//! 基础设施错误
//!
//! 数据库、Kafka 客户端与配置加载的错误统一归入 `InfraError`，
//! 业务层通过 `code()` 与 `is_retryable()` 决定上报方式。

use thiserror::Error;

#[derive(Debug, Error)]
pub enum InfraError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("数据库迁移失败: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Kafka 客户端错误: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("消息负载无效: {0}")]
    Payload(String),

    #[error("配置错误: {0}")]
    Config(#[from] config::ConfigError),

    #[error("连接数据库失败，已尝试 {attempts} 次: {source}")]
    ConnectExhausted {
        attempts: u32,
        #[source]
        source: sqlx::Error,
    },
}

pub type Result<T> = std::result::Result<T, InfraError>;

impl InfraError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Database(_) => "DATABASE_ERROR",
            Self::Migration(_) => "MIGRATION_ERROR",
            Self::Kafka(_) => "KAFKA_ERROR",
            Self::Payload(_) => "PAYLOAD_ERROR",
            Self::Config(_) => "CONFIG_ERROR",
            Self::ConnectExhausted { .. } => "DATABASE_UNAVAILABLE",
        }
    }

    /// 连接类故障可重试；数据约束、迁移、配置与负载错误重试无意义
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Database(e) => is_transient(e),
            Self::Kafka(_) | Self::ConnectExhausted { .. } => true,
            Self::Migration(_) | Self::Payload(_) | Self::Config(_) => false,
        }
    }
}

/// sqlx 错误中属于瞬时故障的部分
pub(crate) fn is_transient(error: &sqlx::Error) -> bool {
    matches!(
        error,
        sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Tls(_)
    )
}
