//! 邮件发送器
//!
//! 发送前先经重试策略放行，被拒绝时不发起投递也不累加尝试次数。
//! 每封邮件经历 建连 -> STARTTLS -> 认证 -> 发送 的完整流程，
//! 整体受硬性截止时间约束，超时计为一次投递失败。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tokio_util::sync::CancellationToken;
use tourney_shared::config::SmtpConfig;
use tracing::{debug, info, warn};

use super::{BodyRenderer, RecipientDirectory, Sender};
use crate::error::{NotificationError, Result};
use crate::model::{DeliveryMethod, Notification};
use crate::retry::RetryPolicy;

/// 默认发送截止时间
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// 待发送的邮件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingEmail {
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// 邮件传输层
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn deliver(&self, email: &OutgoingEmail) -> Result<()>;
}

// ---------------------------------------------------------------------------
// SMTP 传输
// ---------------------------------------------------------------------------

/// 基于 lettre 的 SMTP 传输
pub struct SmtpMailTransport {
    host: String,
    port: u16,
    credentials: Option<Credentials>,
    from: Mailbox,
    timeout: Duration,
}

impl SmtpMailTransport {
    /// 缺少 SMTP 主机或发件地址非法时视为配置错误
    pub fn new(config: &SmtpConfig) -> Result<Self> {
        if config.host.trim().is_empty() {
            return Err(NotificationError::Configuration(
                "未配置 SMTP 主机 (smtp.host)".to_string(),
            ));
        }

        let from = format!("{} <{}>", config.from_name, config.from_address)
            .parse::<Mailbox>()
            .map_err(|e| NotificationError::Configuration(format!("发件地址非法: {e}")))?;

        let credentials = (!config.username.is_empty())
            .then(|| Credentials::new(config.username.clone(), config.password.clone()));

        Ok(Self {
            host: config.host.clone(),
            port: config.port,
            credentials,
            from,
            timeout: config.timeout(),
        })
    }
}

#[async_trait]
impl MailTransport for SmtpMailTransport {
    async fn deliver(&self, email: &OutgoingEmail) -> Result<()> {
        let to = email.to.parse::<Mailbox>().map_err(|e| {
            NotificationError::delivery(DeliveryMethod::Email, format!("收件地址非法: {e}"))
        })?;

        let message = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(email.subject.clone())
            .header(ContentType::TEXT_PLAIN)
            .body(email.body.clone())
            .map_err(|e| NotificationError::delivery(DeliveryMethod::Email, e.to_string()))?;

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&self.host)
            .map_err(|e| NotificationError::connectivity("smtp", e.to_string()))?
            .port(self.port)
            .timeout(Some(self.timeout));
        if let Some(credentials) = &self.credentials {
            builder = builder.credentials(credentials.clone());
        }

        builder.build().send(message).await.map_err(|e| {
            if e.is_permanent() {
                NotificationError::delivery(DeliveryMethod::Email, e.to_string())
            } else {
                NotificationError::connectivity("smtp", e.to_string())
            }
        })?;

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// EmailSender
// ---------------------------------------------------------------------------

/// 邮件渠道发送器
pub struct EmailSender {
    transport: Arc<dyn MailTransport>,
    directory: Arc<dyn RecipientDirectory>,
    renderer: Arc<dyn BodyRenderer>,
    policy: RetryPolicy,
    timeout: Duration,
}

impl EmailSender {
    pub fn new(
        transport: Arc<dyn MailTransport>,
        directory: Arc<dyn RecipientDirectory>,
        renderer: Arc<dyn BodyRenderer>,
    ) -> Self {
        Self {
            transport,
            directory,
            renderer,
            policy: RetryPolicy::default(),
            timeout: DEFAULT_SEND_TIMEOUT,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn deliver(&self, ctx: &CancellationToken, notification: &Notification) -> Result<()> {
        let to = self
            .directory
            .email_for(&notification.user_id)
            .await?
            .ok_or_else(|| {
                NotificationError::delivery(
                    DeliveryMethod::Email,
                    format!("用户 {} 未登记邮箱", notification.user_id),
                )
            })?;

        let metadata = notification
            .metadata
            .as_ref()
            .map(|m| m.flatten())
            .unwrap_or_default();
        let body = self.renderer.render(
            &notification.title,
            &notification.content,
            &notification.actions,
            &metadata,
        )?;

        let email = OutgoingEmail {
            to,
            subject: notification.title.clone(),
            body,
        };

        tokio::select! {
            _ = ctx.cancelled() => Err(NotificationError::Cancelled),
            result = tokio::time::timeout(self.timeout, self.transport.deliver(&email)) => {
                result.unwrap_or(Err(NotificationError::Timeout {
                    operation: "smtp_send",
                    duration: self.timeout,
                }))
            }
        }
    }
}

#[async_trait]
impl Sender for EmailSender {
    fn method(&self) -> DeliveryMethod {
        DeliveryMethod::Email
    }

    async fn send(&self, ctx: &CancellationToken, notification: &mut Notification) -> Result<()> {
        let now = Utc::now();
        let current = notification.status_for(DeliveryMethod::Email);
        if !self.policy.can_retry(DeliveryMethod::Email, current, now) {
            let attempts = current.map(|s| s.attempts).unwrap_or(0);
            debug!(
                notification_id = %notification.id,
                attempts,
                "邮件重试未到放行时间或次数已用尽，跳过发送"
            );
            return Err(NotificationError::RetryNotAllowed {
                method: DeliveryMethod::Email,
                attempts,
            });
        }

        notification
            .delivery_status_mut(DeliveryMethod::Email)
            .record_attempt(now);

        match self.deliver(ctx, notification).await {
            Ok(()) => {
                notification
                    .delivery_status_mut(DeliveryMethod::Email)
                    .mark_delivered(Utc::now());
                info!(
                    notification_id = %notification.id,
                    user_id = %notification.user_id,
                    "邮件通知已发送"
                );
                Ok(())
            }
            Err(e) => {
                notification
                    .delivery_status_mut(DeliveryMethod::Email)
                    .mark_failed(e.to_string());
                warn!(
                    notification_id = %notification.id,
                    user_id = %notification.user_id,
                    error = %e,
                    "邮件通知发送失败"
                );
                Err(e)
            }
        }
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DeliveryState, NotificationType, UserRole};
    use crate::sender::directory::MockRecipientDirectory;
    use crate::sender::renderer::MockBodyRenderer;

    fn notification() -> Notification {
        Notification::new(
            NotificationType::PasswordReset,
            "42",
            UserRole::Student,
            "重置密码",
            "请点击链接重置密码",
        )
        .with_delivery_methods([DeliveryMethod::Email])
    }

    fn directory() -> Arc<dyn RecipientDirectory> {
        let mut directory = MockRecipientDirectory::new();
        directory
            .expect_email_for()
            .returning(|_| Ok(Some("debater@school.edu".to_string())));
        Arc::new(directory)
    }

    fn renderer() -> Arc<dyn BodyRenderer> {
        let mut renderer = MockBodyRenderer::new();
        renderer
            .expect_render()
            .returning(|title, content, _, _| Ok(format!("{title}\n{content}")));
        Arc::new(renderer)
    }

    #[tokio::test]
    async fn test_send_success_marks_delivered() {
        let mut transport = MockMailTransport::new();
        transport
            .expect_deliver()
            .withf(|email| email.to == "debater@school.edu" && email.subject == "重置密码")
            .times(1)
            .returning(|_| Ok(()));

        let sender = EmailSender::new(Arc::new(transport), directory(), renderer());
        let mut n = notification();
        sender.send(&CancellationToken::new(), &mut n).await.unwrap();

        let status = n.status_for(DeliveryMethod::Email).unwrap();
        assert_eq!(status.status, DeliveryState::Delivered);
        assert_eq!(status.attempts, 1);
        assert!(status.delivered_at.is_some());
    }

    #[tokio::test]
    async fn test_transport_failure_marks_failed() {
        let mut transport = MockMailTransport::new();
        transport
            .expect_deliver()
            .returning(|_| Err(NotificationError::connectivity("smtp", "connection refused")));

        let sender = EmailSender::new(Arc::new(transport), directory(), renderer());
        let mut n = notification();
        let err = sender.send(&CancellationToken::new(), &mut n).await.unwrap_err();
        assert!(matches!(err, NotificationError::Connectivity { .. }));

        let status = n.status_for(DeliveryMethod::Email).unwrap();
        assert_eq!(status.status, DeliveryState::Failed);
        assert_eq!(status.attempts, 1);
        assert!(status.error.as_deref().unwrap().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_gate_rejects_without_advancing_attempts() {
        let mut transport = MockMailTransport::new();
        transport.expect_deliver().never();

        let sender = EmailSender::new(Arc::new(transport), directory(), renderer());
        let mut n = notification();
        let status = n.delivery_status_mut(DeliveryMethod::Email);
        status.record_attempt(Utc::now());
        status.mark_failed("smtp down");

        let err = sender.send(&CancellationToken::new(), &mut n).await.unwrap_err();
        assert!(matches!(
            err,
            NotificationError::RetryNotAllowed { attempts: 1, .. }
        ));
        assert_eq!(n.status_for(DeliveryMethod::Email).unwrap().attempts, 1);
    }

    struct SlowTransport;

    #[async_trait]
    impl MailTransport for SlowTransport {
        async fn deliver(&self, _email: &OutgoingEmail) -> Result<()> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_deadline_exceeded_is_delivery_failure() {
        let sender = EmailSender::new(Arc::new(SlowTransport), directory(), renderer())
            .with_timeout(Duration::from_millis(20));
        let mut n = notification();

        let err = sender.send(&CancellationToken::new(), &mut n).await.unwrap_err();
        assert!(matches!(err, NotificationError::Timeout { .. }));
        assert!(err.is_delivery_failure());
        assert_eq!(
            n.status_for(DeliveryMethod::Email).unwrap().status,
            DeliveryState::Failed
        );
    }

    #[tokio::test]
    async fn test_missing_address_fails_channel() {
        let mut directory = MockRecipientDirectory::new();
        directory.expect_email_for().returning(|_| Ok(None));
        let mut transport = MockMailTransport::new();
        transport.expect_deliver().never();

        let sender = EmailSender::new(Arc::new(transport), Arc::new(directory), renderer());
        let mut n = notification();
        let err = sender.send(&CancellationToken::new(), &mut n).await.unwrap_err();
        assert!(matches!(err, NotificationError::Delivery { .. }));
    }

    #[test]
    fn test_smtp_transport_requires_host() {
        let err = SmtpMailTransport::new(&SmtpConfig::default()).err().unwrap();
        assert!(matches!(err, NotificationError::Configuration(_)));

        let config = SmtpConfig {
            host: "smtp.tourney.local".to_string(),
            ..Default::default()
        };
        assert!(SmtpMailTransport::new(&config).is_ok());
    }
}
