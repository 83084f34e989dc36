//! 按类别创建通知的便捷构建器
//!
//! 每个类别的构造方法会套用该类别的默认渠道与优先级，
//! 分发时策略表仍会按具体类型覆盖这些值。

use chrono::{DateTime, Utc};

use super::{
    Action, ActionType, AuthMetadata, Category, DebateMetadata, DeliveryMethod, Notification,
    NotificationType, Priority, ReportMetadata, TournamentMetadata, UserMetadata, UserRole,
};

impl Category {
    /// 类别默认渠道
    pub fn default_methods(&self) -> &'static [DeliveryMethod] {
        match self {
            Self::Auth => &[DeliveryMethod::Email],
            Self::User | Self::Tournament | Self::Debate | Self::Report => {
                &[DeliveryMethod::Email, DeliveryMethod::InApp]
            }
        }
    }

    /// 类别默认优先级
    pub fn default_priority(&self) -> Priority {
        match self {
            Self::Auth | Self::Debate => Priority::High,
            Self::User | Self::Tournament => Priority::Medium,
            Self::Report => Priority::Low,
        }
    }
}

/// 通知构建器
///
/// 提供便捷的通知创建方法
pub struct NotificationBuilder;

impl NotificationBuilder {
    fn with_category_defaults(
        notification_type: NotificationType,
        user_id: impl Into<String>,
        user_role: UserRole,
        title: impl Into<String>,
        content: impl Into<String>,
    ) -> Notification {
        let category = notification_type.category();
        Notification::new(notification_type, user_id, user_role, title, content)
            .with_delivery_methods(category.default_methods().iter().copied())
            .with_priority(category.default_priority())
    }

    pub fn auth(
        notification_type: NotificationType,
        user_id: impl Into<String>,
        user_role: UserRole,
        title: impl Into<String>,
        content: impl Into<String>,
        metadata: Option<AuthMetadata>,
    ) -> Notification {
        let mut n =
            Self::with_category_defaults(notification_type, user_id, user_role, title, content);
        n.metadata = metadata.map(Into::into);
        n
    }

    pub fn user(
        notification_type: NotificationType,
        user_id: impl Into<String>,
        user_role: UserRole,
        title: impl Into<String>,
        content: impl Into<String>,
        metadata: Option<UserMetadata>,
    ) -> Notification {
        let mut n =
            Self::with_category_defaults(notification_type, user_id, user_role, title, content);
        n.metadata = metadata.map(Into::into);
        n
    }

    pub fn tournament(
        notification_type: NotificationType,
        user_id: impl Into<String>,
        user_role: UserRole,
        title: impl Into<String>,
        content: impl Into<String>,
        metadata: Option<TournamentMetadata>,
    ) -> Notification {
        let mut n =
            Self::with_category_defaults(notification_type, user_id, user_role, title, content);
        n.metadata = metadata.map(Into::into);
        n
    }

    pub fn debate(
        notification_type: NotificationType,
        user_id: impl Into<String>,
        user_role: UserRole,
        title: impl Into<String>,
        content: impl Into<String>,
        metadata: Option<DebateMetadata>,
    ) -> Notification {
        let mut n =
            Self::with_category_defaults(notification_type, user_id, user_role, title, content);
        n.metadata = metadata.map(Into::into);
        n
    }

    pub fn report(
        notification_type: NotificationType,
        user_id: impl Into<String>,
        user_role: UserRole,
        title: impl Into<String>,
        content: impl Into<String>,
        metadata: Option<ReportMetadata>,
    ) -> Notification {
        let mut n =
            Self::with_category_defaults(notification_type, user_id, user_role, title, content);
        n.metadata = metadata.map(Into::into);
        n
    }

    // ------------------------------------------------------------------
    // 常用场景
    // ------------------------------------------------------------------

    /// 密码重置
    pub fn password_reset(
        user_id: impl Into<String>,
        user_role: UserRole,
        reset_url: impl Into<String>,
        token_expiry: DateTime<Utc>,
    ) -> Notification {
        Self::auth(
            NotificationType::PasswordReset,
            user_id,
            user_role,
            "重置您的密码",
            "我们收到了您的密码重置请求，请点击下方链接完成重置。如非本人操作请忽略。",
            Some(AuthMetadata {
                reset_token_expiry: Some(token_expiry),
                ..Default::default()
            }),
        )
        .with_action(Action::link("重置密码", reset_url))
    }

    /// 账号创建
    pub fn account_created(user_id: impl Into<String>, user_role: UserRole) -> Notification {
        Self::auth(
            NotificationType::AccountCreation,
            user_id,
            user_role,
            "欢迎加入赛事管理平台",
            "您的账号已创建，审核通过后即可使用全部功能。",
            None,
        )
        .with_delivery_methods([DeliveryMethod::Email, DeliveryMethod::InApp])
        .with_priority(Priority::Medium)
    }

    /// 赛事邀请
    pub fn tournament_invite(
        user_id: impl Into<String>,
        user_role: UserRole,
        metadata: TournamentMetadata,
    ) -> Notification {
        let content = format!("您受邀参加「{}」，请确认是否参赛。", metadata.tournament_name);
        let tournament_id = metadata.tournament_id.clone();
        Self::tournament(
            NotificationType::TournamentInvite,
            user_id,
            user_role,
            "赛事邀请",
            content,
            Some(metadata),
        )
        .with_action(
            Action::new(ActionType::Accept, "接受邀请")
                .with_data(serde_json::json!({ "tournamentId": tournament_id })),
        )
        .with_action(
            Action::new(ActionType::Decline, "婉拒")
                .with_data(serde_json::json!({ "tournamentId": tournament_id })),
        )
    }

    /// 轮次分配
    pub fn round_assignment(
        user_id: impl Into<String>,
        user_role: UserRole,
        metadata: DebateMetadata,
    ) -> Notification {
        let room = metadata.room.as_deref().unwrap_or("待定");
        let content = format!("第 {} 轮对阵已公布，比赛教室：{}。", metadata.round_number, room);
        let title = format!("第 {} 轮分配通知", metadata.round_number);
        Self::debate(
            NotificationType::RoundAssignment,
            user_id,
            user_role,
            title,
            content,
            Some(metadata),
        )
    }

    /// 评分表提交提醒
    pub fn ballot_submission_reminder(
        user_id: impl Into<String>,
        metadata: DebateMetadata,
        ballot_url: impl Into<String>,
    ) -> Notification {
        let content = format!("第 {} 轮评分表尚未提交，请尽快完成。", metadata.round_number);
        Self::debate(
            NotificationType::BallotSubmission,
            user_id,
            UserRole::Volunteer,
            "评分表提交提醒",
            content,
            Some(metadata),
        )
        .with_action(Action::link("提交评分表", ballot_url))
    }

    /// 报表已生成
    pub fn report_ready(
        user_id: impl Into<String>,
        user_role: UserRole,
        metadata: ReportMetadata,
    ) -> Notification {
        let content = format!("您请求的「{}」报表已生成。", metadata.report_type);
        let download = metadata.download_url.clone();
        let mut n = Self::report(
            NotificationType::ReportGeneration,
            user_id,
            user_role,
            "报表已生成",
            content,
            Some(metadata),
        );
        if let Some(url) = download {
            n = n.with_action(Action::new(ActionType::Download, "下载报表").with_url(url));
        }
        n
    }
}
