//! 类别化的通知元数据
//!
//! 以类别为判别字段的带标签联合体，每个类别对应唯一的强类型负载，
//! 反序列化时依据判别字段选择变体。

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Category;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "category", content = "data", rename_all = "snake_case")]
pub enum NotificationMetadata {
    Auth(AuthMetadata),
    User(UserMetadata),
    Tournament(TournamentMetadata),
    Debate(DebateMetadata),
    Report(ReportMetadata),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_token_expiry: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changed_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TournamentMetadata {
    pub tournament_id: String,
    pub tournament_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_deadline: Option<DateTime<Utc>>,
    /// 报名费（分）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_amount_cents: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebateMetadata {
    pub tournament_id: String,
    pub round_number: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub motion: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub side: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opponent: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub judge_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportMetadata {
    pub report_id: String,
    pub report_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period_start: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period_end: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

impl NotificationMetadata {
    /// 负载对应的类别
    pub fn category(&self) -> Category {
        match self {
            Self::Auth(_) => Category::Auth,
            Self::User(_) => Category::User,
            Self::Tournament(_) => Category::Tournament,
            Self::Debate(_) => Category::Debate,
            Self::Report(_) => Category::Report,
        }
    }

    /// 展平为字符串映射，供正文渲染使用
    ///
    /// 键为 camelCase 字段名，列表以逗号连接，缺省字段不出现。
    pub fn flatten(&self) -> BTreeMap<String, String> {
        let value = match self {
            Self::Auth(m) => serde_json::to_value(m),
            Self::User(m) => serde_json::to_value(m),
            Self::Tournament(m) => serde_json::to_value(m),
            Self::Debate(m) => serde_json::to_value(m),
            Self::Report(m) => serde_json::to_value(m),
        };

        let mut flat = BTreeMap::new();
        if let Ok(serde_json::Value::Object(fields)) = value {
            for (key, field) in fields {
                let rendered = match field {
                    serde_json::Value::Null => continue,
                    serde_json::Value::String(s) => s,
                    serde_json::Value::Array(items) => items
                        .iter()
                        .map(|item| match item {
                            serde_json::Value::String(s) => s.clone(),
                            other => other.to_string(),
                        })
                        .collect::<Vec<_>>()
                        .join(", "),
                    other => other.to_string(),
                };
                flat.insert(key, rendered);
            }
        }
        flat
    }
}

impl From<AuthMetadata> for NotificationMetadata {
    fn from(m: AuthMetadata) -> Self {
        Self::Auth(m)
    }
}

impl From<UserMetadata> for NotificationMetadata {
    fn from(m: UserMetadata) -> Self {
        Self::User(m)
    }
}

impl From<TournamentMetadata> for NotificationMetadata {
    fn from(m: TournamentMetadata) -> Self {
        Self::Tournament(m)
    }
}

impl From<DebateMetadata> for NotificationMetadata {
    fn from(m: DebateMetadata) -> Self {
        Self::Debate(m)
    }
}

impl From<ReportMetadata> for NotificationMetadata {
    fn from(m: ReportMetadata) -> Self {
        Self::Report(m)
    }
}
