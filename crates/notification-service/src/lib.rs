//! 赛事管理后台通知服务
//!
//! 按通知类别决定投递渠道，先持久化元数据再投递，
//! 通过邮件、站内信与消息代理等异构渠道分发通知，并在元数据存储
//! 与消息代理之间做最终一致的状态协调。

pub mod dispatcher;
pub mod error;
pub mod model;
pub mod queue;
pub mod retry;
pub mod sender;
pub mod service;
pub mod storage;

pub use error::{NotificationError, Result};
pub use service::NotificationService;
