//! 渠道策略表
//!
//! 按通知类型决定投递渠道、优先级与过期时间覆盖。策略是权威值，
//! 分发时无条件覆盖调用方设置的渠道与优先级。

use chrono::Duration;

use crate::model::{DeliveryMethod, NotificationType, Priority};

use crate::model::DeliveryMethod::{Email, InApp, Push};

/// 单个通知类型的投递策略
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelPolicy {
    pub methods: &'static [DeliveryMethod],
    /// None 表示保留调用方设置的优先级
    pub priority: Option<Priority>,
    /// 过期时间覆盖，仅在通知未设置过期时间时生效
    pub expiry: Option<Duration>,
}

const EMAIL_ONLY: &[DeliveryMethod] = &[Email];
const EMAIL_IN_APP: &[DeliveryMethod] = &[Email, InApp];
const ALL_CHANNELS: &[DeliveryMethod] = &[Email, InApp, Push];

const fn policy(methods: &'static [DeliveryMethod], priority: Priority) -> ChannelPolicy {
    ChannelPolicy {
        methods,
        priority: Some(priority),
        expiry: None,
    }
}

/// 查询通知类型的投递策略
pub fn policy_for(notification_type: NotificationType) -> ChannelPolicy {
    use crate::model::NotificationType::*;

    match notification_type {
        // auth
        PasswordReset | TwoFactorAuth => ChannelPolicy {
            expiry: Some(Duration::minutes(15)),
            ..policy(EMAIL_ONLY, Priority::High)
        },
        SecurityAlert => ChannelPolicy {
            expiry: Some(Duration::days(7)),
            ..policy(ALL_CHANNELS, Priority::Urgent)
        },
        AccountCreation | AccountApproval => ChannelPolicy {
            methods: EMAIL_IN_APP,
            priority: None,
            expiry: None,
        },

        // user
        ProfileUpdate => policy(EMAIL_IN_APP, Priority::Medium),
        RoleAssignment => policy(EMAIL_IN_APP, Priority::High),
        StatusChange => policy(ALL_CHANNELS, Priority::Urgent),

        // tournament
        TournamentInvite => policy(EMAIL_IN_APP, Priority::Medium),
        TournamentRegistration | TournamentPayment | TournamentSchedule => {
            policy(ALL_CHANNELS, Priority::High)
        }
        CoordinatorAssignment => policy(EMAIL_IN_APP, Priority::Medium),

        // debate
        RoundAssignment | JudgeAssignment => policy(ALL_CHANNELS, Priority::High),
        BallotSubmission => policy(ALL_CHANNELS, Priority::Urgent),
        DebateResults => policy(EMAIL_IN_APP, Priority::Medium),
        RoomChange => policy(ALL_CHANNELS, Priority::Urgent),

        // report
        ReportGeneration => policy(EMAIL_IN_APP, Priority::Low),
        PerformanceReport | AnalyticsReport => policy(EMAIL_IN_APP, Priority::Medium),
        AuditReport => policy(EMAIL_IN_APP, Priority::High),
    }
}
