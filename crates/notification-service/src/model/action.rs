use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 通知上可执行的操作类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Link,
    Accept,
    Decline,
    Confirm,
    Download,
    View,
}

/// 通知操作
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    #[serde(rename = "type")]
    pub action_type: ActionType,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// 透传给前端的附加数据
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Action {
    pub fn new(action_type: ActionType, label: impl Into<String>) -> Self {
        Self {
            action_type,
            label: label.into(),
            url: None,
            data: serde_json::Value::Null,
            completed: false,
            completed_at: None,
        }
    }

    pub fn link(label: impl Into<String>, url: impl Into<String>) -> Self {
        Self::new(ActionType::Link, label).with_url(url)
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    /// 标记操作已完成，重复调用保留首次完成时间
    pub fn complete(&mut self, now: DateTime<Utc>) {
        if !self.completed {
            self.completed = true;
            self.completed_at = Some(now);
        }
    }
}
