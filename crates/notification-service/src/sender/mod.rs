//! 渠道发送器
//!
//! 通过 `Sender` trait 抽象单一渠道的投递行为：邮件、站内信与消息代理
//! 各自实现，发送器负责更新通知上本渠道的投递状态。

pub mod directory;
pub mod email;
pub mod in_app;
pub mod renderer;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::model::{DeliveryMethod, Notification};

pub use directory::{PgRecipientDirectory, RecipientDirectory, StaticRecipientDirectory};
pub use email::{EmailSender, MailTransport, OutgoingEmail, SmtpMailTransport};
pub use in_app::{InAppSender, InAppSubscription, UnsubscribeHandle};
pub use renderer::{BodyRenderer, PlainTextRenderer};

/// 通知发送器 trait，各渠道实现具体的投递逻辑
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Sender: Send + Sync {
    /// 该发送器负责的渠道
    fn method(&self) -> DeliveryMethod;

    /// 投递通知，并把结果写入通知上本渠道的投递状态
    async fn send(&self, ctx: &CancellationToken, notification: &mut Notification) -> Result<()>;

    /// 释放发送器持有的资源
    async fn close(&self) -> Result<()>;
}
