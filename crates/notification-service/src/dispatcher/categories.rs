//! 五个类别分发器

use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::{Dispatcher, DispatcherOptions};
use crate::model::{Category, Notification, NotificationMetadata};

// ---------------------------------------------------------------------------
// 账号与安全
// ---------------------------------------------------------------------------

/// 账号与安全类通知分发器
///
/// 重置令牌先于通知过期时，以令牌过期时间为准。
pub struct AuthDispatcher {
    options: Arc<DispatcherOptions>,
}

impl AuthDispatcher {
    pub fn new(options: Arc<DispatcherOptions>) -> Self {
        Self { options }
    }
}

impl Dispatcher for AuthDispatcher {
    fn category(&self) -> Category {
        Category::Auth
    }

    fn options(&self) -> &DispatcherOptions {
        &self.options
    }

    fn adjust(&self, notification: &mut Notification, _now: DateTime<Utc>) {
        let token_expiry = match &notification.metadata {
            Some(NotificationMetadata::Auth(meta)) => meta.reset_token_expiry,
            _ => None,
        };
        if let (Some(token_expiry), Some(expires_at)) = (token_expiry, notification.expires_at)
            && token_expiry < expires_at
        {
            notification.expires_at = Some(token_expiry);
        }
    }
}

// ---------------------------------------------------------------------------
// 用户
// ---------------------------------------------------------------------------

pub struct UserDispatcher {
    options: Arc<DispatcherOptions>,
}

impl UserDispatcher {
    pub fn new(options: Arc<DispatcherOptions>) -> Self {
        Self { options }
    }
}

impl Dispatcher for UserDispatcher {
    fn category(&self) -> Category {
        Category::User
    }

    fn options(&self) -> &DispatcherOptions {
        &self.options
    }
}

// ---------------------------------------------------------------------------
// 赛事
// ---------------------------------------------------------------------------

pub struct TournamentDispatcher {
    options: Arc<DispatcherOptions>,
}

impl TournamentDispatcher {
    pub fn new(options: Arc<DispatcherOptions>) -> Self {
        Self { options }
    }
}

impl Dispatcher for TournamentDispatcher {
    fn category(&self) -> Category {
        Category::Tournament
    }

    fn options(&self) -> &DispatcherOptions {
        &self.options
    }
}

// ---------------------------------------------------------------------------
// 对阵
// ---------------------------------------------------------------------------

pub struct DebateDispatcher {
    options: Arc<DispatcherOptions>,
}

impl DebateDispatcher {
    pub fn new(options: Arc<DispatcherOptions>) -> Self {
        Self { options }
    }
}

impl Dispatcher for DebateDispatcher {
    fn category(&self) -> Category {
        Category::Debate
    }

    fn options(&self) -> &DispatcherOptions {
        &self.options
    }
}

// ---------------------------------------------------------------------------
// 报表
// ---------------------------------------------------------------------------

pub struct ReportDispatcher {
    options: Arc<DispatcherOptions>,
}

impl ReportDispatcher {
    pub fn new(options: Arc<DispatcherOptions>) -> Self {
        Self { options }
    }
}

impl Dispatcher for ReportDispatcher {
    fn category(&self) -> Category {
        Category::Report
    }

    fn options(&self) -> &DispatcherOptions {
        &self.options
    }
}
