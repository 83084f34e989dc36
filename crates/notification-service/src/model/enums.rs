//! 通知枚举类型定义
//!
//! 所有枚举都支持数据库（sqlx）和 JSON（serde）序列化，
//! 统一使用 snake_case 作为外部表示，与消息代理路由键保持一致。

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::NotificationError;

/// 通知类别
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
pub enum Category {
    Auth,
    User,
    Tournament,
    Debate,
    Report,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Category::Auth,
        Category::User,
        Category::Tournament,
        Category::Debate,
        Category::Report,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::User => "user",
            Self::Tournament => "tournament",
            Self::Debate => "debate",
            Self::Report => "report",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = NotificationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Category::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| NotificationError::UnknownCategory(s.to_string()))
    }
}

/// 通知类型（类别下的具体事件）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
pub enum NotificationType {
    // auth
    PasswordReset,
    TwoFactorAuth,
    SecurityAlert,
    AccountCreation,
    AccountApproval,
    // user
    ProfileUpdate,
    RoleAssignment,
    StatusChange,
    // tournament
    TournamentInvite,
    TournamentRegistration,
    TournamentPayment,
    TournamentSchedule,
    CoordinatorAssignment,
    // debate
    RoundAssignment,
    JudgeAssignment,
    BallotSubmission,
    DebateResults,
    RoomChange,
    // report
    ReportGeneration,
    PerformanceReport,
    AnalyticsReport,
    AuditReport,
}

impl NotificationType {
    pub const ALL: [NotificationType; 22] = [
        Self::PasswordReset,
        Self::TwoFactorAuth,
        Self::SecurityAlert,
        Self::AccountCreation,
        Self::AccountApproval,
        Self::ProfileUpdate,
        Self::RoleAssignment,
        Self::StatusChange,
        Self::TournamentInvite,
        Self::TournamentRegistration,
        Self::TournamentPayment,
        Self::TournamentSchedule,
        Self::CoordinatorAssignment,
        Self::RoundAssignment,
        Self::JudgeAssignment,
        Self::BallotSubmission,
        Self::DebateResults,
        Self::RoomChange,
        Self::ReportGeneration,
        Self::PerformanceReport,
        Self::AnalyticsReport,
        Self::AuditReport,
    ];

    /// 该类型所属的类别
    pub fn category(&self) -> Category {
        match self {
            Self::PasswordReset
            | Self::TwoFactorAuth
            | Self::SecurityAlert
            | Self::AccountCreation
            | Self::AccountApproval => Category::Auth,
            Self::ProfileUpdate | Self::RoleAssignment | Self::StatusChange => Category::User,
            Self::TournamentInvite
            | Self::TournamentRegistration
            | Self::TournamentPayment
            | Self::TournamentSchedule
            | Self::CoordinatorAssignment => Category::Tournament,
            Self::RoundAssignment
            | Self::JudgeAssignment
            | Self::BallotSubmission
            | Self::DebateResults
            | Self::RoomChange => Category::Debate,
            Self::ReportGeneration
            | Self::PerformanceReport
            | Self::AnalyticsReport
            | Self::AuditReport => Category::Report,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PasswordReset => "password_reset",
            Self::TwoFactorAuth => "two_factor_auth",
            Self::SecurityAlert => "security_alert",
            Self::AccountCreation => "account_creation",
            Self::AccountApproval => "account_approval",
            Self::ProfileUpdate => "profile_update",
            Self::RoleAssignment => "role_assignment",
            Self::StatusChange => "status_change",
            Self::TournamentInvite => "tournament_invite",
            Self::TournamentRegistration => "tournament_registration",
            Self::TournamentPayment => "tournament_payment",
            Self::TournamentSchedule => "tournament_schedule",
            Self::CoordinatorAssignment => "coordinator_assignment",
            Self::RoundAssignment => "round_assignment",
            Self::JudgeAssignment => "judge_assignment",
            Self::BallotSubmission => "ballot_submission",
            Self::DebateResults => "debate_results",
            Self::RoomChange => "room_change",
            Self::ReportGeneration => "report_generation",
            Self::PerformanceReport => "performance_report",
            Self::AnalyticsReport => "analytics_report",
            Self::AuditReport => "audit_report",
        }
    }
}

impl fmt::Display for NotificationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 用户角色（由外部鉴权组件校验后传入）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
pub enum UserRole {
    Admin,
    School,
    Volunteer,
    Student,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::School => "school",
            Self::Volunteer => "volunteer",
            Self::Student => "student",
        }
    }
}

impl fmt::Display for UserRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 投递渠道
///
/// `Queue` 为消息代理这一持久化投递链路，不直接面向用户，
/// 其投递状态记录 Store 阶段的代理写入结果。
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
pub enum DeliveryMethod {
    Email,
    InApp,
    Push,
    Queue,
}

impl DeliveryMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::InApp => "in_app",
            Self::Push => "push",
            Self::Queue => "queue",
        }
    }

    /// 是否为面向用户的渠道
    pub fn is_user_facing(&self) -> bool {
        !matches!(self, Self::Queue)
    }
}

impl fmt::Display for DeliveryMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 通知优先级
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    sqlx::Type,
)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

/// 投递状态（单渠道或整体）
///
/// 单渠道内只允许 Pending -> {Delivered | Failed | Expired}，
/// 唯一的回退路径是重试清扫显式的重新入队。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
pub enum DeliveryState {
    #[default]
    Pending,
    Delivered,
    Failed,
    Expired,
}

impl DeliveryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
            Self::Expired => "expired",
        }
    }
}
