//! 基于 PostgreSQL 的元数据存储

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::types::Json;

use super::metadata::{MetadataRecord, MetadataStore, RetryCursor};
use crate::error::{NotificationError, Result};
use crate::model::{DeliveryMethod, DeliveryState, DeliveryStatus};

const SELECT_COLUMNS: &str = r#"
    SELECT id, user_id, user_role, category, notification_type, title, content,
           actions, status, priority, delivery_methods, delivery_status, metadata,
           expires_at, is_read, read_at, created_at, updated_at
    FROM notification_metadata
"#;

pub struct PgMetadataStore {
    pool: PgPool,
}

impl PgMetadataStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MetadataStore for PgMetadataStore {
    async fn create(&self, record: &MetadataRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO notification_metadata (
                id, user_id, user_role, category, notification_type, title, content,
                actions, status, priority, delivery_methods, delivery_status, metadata,
                expires_at, is_read, read_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            ON CONFLICT (id) DO UPDATE SET
                title = EXCLUDED.title,
                content = EXCLUDED.content,
                actions = EXCLUDED.actions,
                priority = EXCLUDED.priority,
                delivery_methods = EXCLUDED.delivery_methods,
                metadata = EXCLUDED.metadata,
                expires_at = EXCLUDED.expires_at,
                updated_at = GREATEST(notification_metadata.updated_at, EXCLUDED.updated_at)
            "#,
        )
        .bind(&record.id)
        .bind(&record.user_id)
        .bind(record.user_role)
        .bind(record.category)
        .bind(record.notification_type)
        .bind(&record.title)
        .bind(&record.content)
        .bind(&record.actions)
        .bind(record.status)
        .bind(record.priority)
        .bind(&record.delivery_methods)
        .bind(&record.delivery_status)
        .bind(&record.metadata)
        .bind(record.expires_at)
        .bind(record.is_read)
        .bind(record.read_at)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update(&self, record: &MetadataRecord) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE notification_metadata
            SET title = $2, content = $3, actions = $4, status = $5, priority = $6,
                delivery_methods = $7, delivery_status = $8, metadata = $9,
                expires_at = $10, is_read = $11, read_at = $12, updated_at = $13
            WHERE id = $1
            "#,
        )
        .bind(&record.id)
        .bind(&record.title)
        .bind(&record.content)
        .bind(&record.actions)
        .bind(record.status)
        .bind(record.priority)
        .bind(&record.delivery_methods)
        .bind(&record.delivery_status)
        .bind(&record.metadata)
        .bind(record.expires_at)
        .bind(record.is_read)
        .bind(record.read_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(NotificationError::NotFound(record.id.clone()));
        }
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<MetadataRecord>> {
        let record = sqlx::query_as::<_, MetadataRecord>(&format!("{SELECT_COLUMNS} WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    async fn get_many(&self, ids: &[String]) -> Result<Vec<MetadataRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let records =
            sqlx::query_as::<_, MetadataRecord>(&format!("{SELECT_COLUMNS} WHERE id = ANY($1)"))
                .bind(ids)
                .fetch_all(&self.pool)
                .await?;
        Ok(records)
    }

    async fn list_unread(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<MetadataRecord>> {
        let records = sqlx::query_as::<_, MetadataRecord>(&format!(
            r#"{SELECT_COLUMNS}
            WHERE user_id = $1
              AND is_read = FALSE
              AND (expires_at IS NULL OR expires_at > $2)
            ORDER BY created_at DESC
            LIMIT $3"#
        ))
        .bind(user_id)
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn mark_as_read(&self, ids: &[String], read_at: DateTime<Utc>) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(
            r#"
            UPDATE notification_metadata
            SET is_read = TRUE, read_at = $2, updated_at = $2
            WHERE id = ANY($1) AND is_read = FALSE
            "#,
        )
        .bind(ids)
        .bind(read_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn update_delivery_status(
        &self,
        id: &str,
        delivery_status: &BTreeMap<DeliveryMethod, DeliveryStatus>,
        status: DeliveryState,
        updated_at: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE notification_metadata
            SET delivery_status = $2, status = $3, updated_at = GREATEST(updated_at, $4)
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(Json(delivery_status))
        .bind(status)
        .bind(updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(NotificationError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn list_expired(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar::<_, String>(
            r#"
            SELECT id FROM notification_metadata
            WHERE expires_at IS NOT NULL AND expires_at <= $1
            ORDER BY expires_at ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn delete(&self, ids: &[String]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query("DELETE FROM notification_metadata WHERE id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn list_retry_candidates(
        &self,
        now: DateTime<Utc>,
        max_attempts: u32,
        after: Option<RetryCursor>,
        limit: i64,
    ) -> Result<Vec<MetadataRecord>> {
        let records = sqlx::query_as::<_, MetadataRecord>(&format!(
            r#"{SELECT_COLUMNS}
            WHERE delivery_status -> 'email' ->> 'status' = 'failed'
              AND COALESCE((delivery_status -> 'email' ->> 'attempts')::BIGINT, 0) < $2
              AND (expires_at IS NULL OR expires_at > $1)
              AND ($3::TIMESTAMPTZ IS NULL OR (updated_at, id) > ($3, $4::TEXT))
            ORDER BY updated_at ASC, id ASC
            LIMIT $5"#
        ))
        .bind(now)
        .bind(i64::from(max_attempts))
        .bind(after.as_ref().map(|c| c.updated_at))
        .bind(after.as_ref().map(|c| c.id.as_str()))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }
}
