//! 通知服务错误类型
//!
//! 按处理方式划分错误：配置错误在构造期致命，连接错误可重试，
//! 校验错误直接拒绝，渠道投递错误只记入该渠道的投递状态，
//! 序列化错误视为毒消息丢弃。

use std::time::Duration;

use thiserror::Error;
use tourney_shared::error::InfraError;

use crate::model::DeliveryMethod;

/// 错误大类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Connectivity,
    Validation,
    Delivery,
    Serialization,
    Storage,
    Cancelled,
}

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("连接失败: {service} - {reason}")]
    Connectivity { service: &'static str, reason: String },

    #[error("通知校验失败: {0}")]
    Validation(String),

    #[error("通知投递失败: 渠道={method}, 原因={reason}")]
    Delivery {
        method: DeliveryMethod,
        reason: String,
    },

    #[error("操作超时: {operation} 超过 {duration:?}")]
    Timeout {
        operation: &'static str,
        duration: Duration,
    },

    #[error("重试未放行: 渠道={method}, 已尝试 {attempts} 次")]
    RetryNotAllowed { method: DeliveryMethod, attempts: u32 },

    #[error("序列化失败: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("未知的通知类别: {0}")]
    UnknownCategory(String),

    #[error("通知不存在: {0}")]
    NotFound(String),

    #[error("存储错误: {0}")]
    Storage(String),

    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    /// 元数据已落库，但消息代理写入失败
    #[error("消息代理写入失败（元数据已保存）: {0}")]
    BrokerLegFailed(#[source] Box<NotificationError>),

    #[error("操作已取消")]
    Cancelled,

    #[error("{0} 已关闭")]
    Closed(&'static str),

    #[error(transparent)]
    Infra(#[from] InfraError),
}

pub type Result<T> = std::result::Result<T, NotificationError>;

impl NotificationError {
    pub fn connectivity(service: &'static str, reason: impl Into<String>) -> Self {
        Self::Connectivity {
            service,
            reason: reason.into(),
        }
    }

    pub fn delivery(method: DeliveryMethod, reason: impl Into<String>) -> Self {
        Self::Delivery {
            method,
            reason: reason.into(),
        }
    }

    /// 错误大类
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) | Self::UnknownCategory(_) => ErrorKind::Configuration,
            Self::Connectivity { .. } | Self::Closed(_) | Self::BrokerLegFailed(_) => {
                ErrorKind::Connectivity
            }
            Self::Validation(_) | Self::NotFound(_) => ErrorKind::Validation,
            Self::Delivery { .. } | Self::Timeout { .. } | Self::RetryNotAllowed { .. } => {
                ErrorKind::Delivery
            }
            Self::Serialization(_) => ErrorKind::Serialization,
            Self::Storage(_) | Self::Database(_) => ErrorKind::Storage,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Infra(e) if e.is_retryable() => ErrorKind::Connectivity,
            Self::Infra(_) => ErrorKind::Configuration,
        }
    }

    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::Connectivity { .. } => "CONNECTIVITY_ERROR",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Delivery { .. } => "DELIVERY_ERROR",
            Self::Timeout { .. } => "TIMEOUT",
            Self::RetryNotAllowed { .. } => "RETRY_NOT_ALLOWED",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::UnknownCategory(_) => "UNKNOWN_CATEGORY",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::Database(_) => "DATABASE_ERROR",
            Self::BrokerLegFailed(_) => "BROKER_LEG_FAILED",
            Self::Cancelled => "CANCELLED",
            Self::Closed(_) => "CLOSED",
            Self::Infra(e) => e.code(),
        }
    }

    /// 是否为可重试错误
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connectivity { .. } | Self::Timeout { .. } | Self::Database(_) => true,
            Self::BrokerLegFailed(inner) => inner.is_retryable(),
            Self::Infra(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// 是否属于渠道投递失败（记入投递状态，不中断其他渠道）
    pub fn is_delivery_failure(&self) -> bool {
        self.kind() == ErrorKind::Delivery
    }
}
