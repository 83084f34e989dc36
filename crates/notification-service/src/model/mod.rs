//! 通知数据模型

mod action;
mod builder;
mod enums;
mod metadata;
mod notification;

pub use action::{Action, ActionType};
pub use builder::NotificationBuilder;
pub use enums::{Category, DeliveryMethod, DeliveryState, NotificationType, Priority, UserRole};
pub use metadata::{
    AuthMetadata, DebateMetadata, NotificationMetadata, ReportMetadata, TournamentMetadata,
    UserMetadata,
};
pub use notification::{DeliveryStatus, Notification};
