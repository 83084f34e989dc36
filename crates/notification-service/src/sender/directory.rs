//! 收件人地址查询
//!
//! 通知只携带 userID，邮件渠道通过目录把它解析为邮箱地址。

use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::PgPool;

use crate::error::Result;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RecipientDirectory: Send + Sync {
    /// 查询用户邮箱，用户不存在或未登记邮箱时返回 None
    async fn email_for(&self, user_id: &str) -> Result<Option<String>>;
}

/// 基于 users 表的目录
pub struct PgRecipientDirectory {
    pool: PgPool,
}

impl PgRecipientDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RecipientDirectory for PgRecipientDirectory {
    async fn email_for(&self, user_id: &str) -> Result<Option<String>> {
        let email = sqlx::query_scalar::<_, Option<String>>(
            r#"
            SELECT email FROM users WHERE id::text = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(email.flatten().filter(|e| !e.is_empty()))
    }
}

/// 静态目录（独立模式与测试使用）
#[derive(Debug, Default, Clone)]
pub struct StaticRecipientDirectory {
    entries: HashMap<String, String>,
}

impl StaticRecipientDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entry(mut self, user_id: impl Into<String>, email: impl Into<String>) -> Self {
        self.entries.insert(user_id.into(), email.into());
        self
    }
}

#[async_trait]
impl RecipientDirectory for StaticRecipientDirectory {
    async fn email_for(&self, user_id: &str) -> Result<Option<String>> {
        Ok(self.entries.get(user_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_directory() {
        let directory = StaticRecipientDirectory::new().with_entry("42", "debater@school.edu");
        assert_eq!(
            directory.email_for("42").await.unwrap().as_deref(),
            Some("debater@school.edu")
        );
        assert!(directory.email_for("43").await.unwrap().is_none());
    }
}
