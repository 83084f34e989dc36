//! 内存元数据存储（独立模式与测试使用）

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use sqlx::types::Json;

use super::metadata::{MetadataRecord, MetadataStore, RetryCursor};
use crate::error::{NotificationError, Result};
use crate::model::{DeliveryMethod, DeliveryState, DeliveryStatus};

#[derive(Default)]
struct Shared {
    records: RwLock<HashMap<String, MetadataRecord>>,
    fail_writes: AtomicU32,
}

/// 内存元数据存储，可克隆共享同一份数据
#[derive(Clone, Default)]
pub struct InMemoryMetadataStore {
    shared: Arc<Shared>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 接下来 n 次写操作返回存储错误
    pub fn fail_next_writes(&self, n: u32) {
        self.shared.fail_writes.store(n, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.shared.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_write(&self) -> Result<()> {
        let injected = self
            .shared
            .fail_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(NotificationError::Storage("注入的写入失败".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn create(&self, record: &MetadataRecord) -> Result<()> {
        self.check_write()?;
        let mut records = self.shared.records.write();
        match records.get_mut(&record.id) {
            Some(existing) => {
                let mut merged = record.clone();
                merged.is_read = existing.is_read;
                merged.read_at = existing.read_at;
                merged.created_at = existing.created_at;
                merged.status = existing.status;
                merged.delivery_status = existing.delivery_status.clone();
                merged.updated_at = existing.updated_at.max(record.updated_at);
                *existing = merged;
            }
            None => {
                records.insert(record.id.clone(), record.clone());
            }
        }
        Ok(())
    }

    async fn update(&self, record: &MetadataRecord) -> Result<()> {
        self.check_write()?;
        let mut records = self.shared.records.write();
        let existing = records
            .get_mut(&record.id)
            .ok_or_else(|| NotificationError::NotFound(record.id.clone()))?;
        *existing = record.clone();
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<MetadataRecord>> {
        Ok(self.shared.records.read().get(id).cloned())
    }

    async fn get_many(&self, ids: &[String]) -> Result<Vec<MetadataRecord>> {
        let records = self.shared.records.read();
        Ok(ids.iter().filter_map(|id| records.get(id).cloned()).collect())
    }

    async fn list_unread(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<MetadataRecord>> {
        let mut unread: Vec<MetadataRecord> = self
            .shared
            .records
            .read()
            .values()
            .filter(|r| r.user_id == user_id && !r.is_read && !r.is_expired(now))
            .cloned()
            .collect();
        unread.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        unread.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(unread)
    }

    async fn mark_as_read(&self, ids: &[String], read_at: DateTime<Utc>) -> Result<u64> {
        self.check_write()?;
        let mut records = self.shared.records.write();
        let mut changed = 0;
        for id in ids {
            if let Some(record) = records.get_mut(id)
                && !record.is_read
            {
                record.is_read = true;
                record.read_at = Some(read_at);
                record.updated_at = read_at;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn update_delivery_status(
        &self,
        id: &str,
        delivery_status: &BTreeMap<DeliveryMethod, DeliveryStatus>,
        status: DeliveryState,
        updated_at: DateTime<Utc>,
    ) -> Result<()> {
        self.check_write()?;
        let mut records = self.shared.records.write();
        let record = records
            .get_mut(id)
            .ok_or_else(|| NotificationError::NotFound(id.to_string()))?;
        record.delivery_status = Json(delivery_status.clone());
        record.status = status;
        record.updated_at = record.updated_at.max(updated_at);
        Ok(())
    }

    async fn list_expired(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<String>> {
        let mut expired: Vec<(DateTime<Utc>, String)> = self
            .shared
            .records
            .read()
            .values()
            .filter_map(|r| r.expires_at.filter(|at| *at <= now).map(|at| (at, r.id.clone())))
            .collect();
        expired.sort();
        expired.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(expired.into_iter().map(|(_, id)| id).collect())
    }

    async fn delete(&self, ids: &[String]) -> Result<u64> {
        self.check_write()?;
        let mut records = self.shared.records.write();
        Ok(ids.iter().filter(|id| records.remove(*id).is_some()).count() as u64)
    }

    async fn list_retry_candidates(
        &self,
        now: DateTime<Utc>,
        max_attempts: u32,
        after: Option<RetryCursor>,
        limit: i64,
    ) -> Result<Vec<MetadataRecord>> {
        let mut candidates: Vec<MetadataRecord> = self
            .shared
            .records
            .read()
            .values()
            .filter(|r| {
                !r.is_expired(now)
                    && r.status_for(DeliveryMethod::Email).is_some_and(|s| {
                        s.status == DeliveryState::Failed && s.attempts < max_attempts
                    })
                    && after
                        .as_ref()
                        .is_none_or(|c| (r.updated_at, r.id.as_str()) > (c.updated_at, c.id.as_str()))
            })
            .cloned()
            .collect();
        candidates.sort_by(|a, b| (a.updated_at, &a.id).cmp(&(b.updated_at, &b.id)));
        candidates.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Notification, NotificationType, UserRole};
    use chrono::Duration;

    fn record(user_id: &str) -> MetadataRecord {
        MetadataRecord::from_notification(&Notification::new(
            NotificationType::TournamentSchedule,
            user_id,
            UserRole::School,
            "赛程",
            "已发布",
        ))
    }

    #[tokio::test]
    async fn test_create_keeps_read_state() {
        let store = InMemoryMetadataStore::new();
        let r = record("42");
        store.create(&r).await.unwrap();
        assert_eq!(
            store.mark_as_read(&[r.id.clone()], Utc::now()).await.unwrap(),
            1
        );

        let mut retried = r.clone();
        retried.title = "赛程（更新）".to_string();
        store.create(&retried).await.unwrap();

        let loaded = store.get(&r.id).await.unwrap().unwrap();
        assert!(loaded.is_read);
        assert_eq!(loaded.title, "赛程（更新）");
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_create_keeps_delivery_progress() {
        let store = InMemoryMetadataStore::new();
        let mut n = Notification::new(
            NotificationType::TournamentPayment,
            "42",
            UserRole::School,
            "报名费",
            "待缴",
        );
        let email = n.delivery_status_mut(DeliveryMethod::Email);
        email.record_attempt(Utc::now() - Duration::hours(1));
        email.mark_failed("smtp 421");
        let first = MetadataRecord::from_notification(&n);
        store.create(&first).await.unwrap();

        let mut fresh = first.clone();
        fresh.delivery_status = Json(BTreeMap::new());
        fresh.created_at = Utc::now();
        store.create(&fresh).await.unwrap();

        let loaded = store.get(&first.id).await.unwrap().unwrap();
        assert_eq!(loaded.status_for(DeliveryMethod::Email).unwrap().attempts, 1);
        assert_eq!(loaded.created_at, first.created_at);
    }

    #[tokio::test]
    async fn test_retry_candidates_page_by_cursor() {
        let store = InMemoryMetadataStore::new();
        let base = Utc::now() - Duration::days(1);
        let mut ids = Vec::new();
        for (i, attempts) in [4u32, 1, 2, 1].into_iter().enumerate() {
            let mut r = record("42");
            let mut status = DeliveryStatus::default();
            for _ in 0..attempts {
                status.record_attempt(base);
            }
            status.mark_failed("smtp 421");
            r.delivery_status = Json(BTreeMap::from([(DeliveryMethod::Email, status)]));
            r.updated_at = base + Duration::minutes(i as i64);
            store.create(&r).await.unwrap();
            ids.push(r.id);
        }
        let now = Utc::now();

        let first = store.list_retry_candidates(now, 4, None, 2).await.unwrap();
        assert_eq!(
            first.iter().map(|r| r.id.clone()).collect::<Vec<_>>(),
            vec![ids[1].clone(), ids[2].clone()]
        );

        let cursor = first.last().map(MetadataRecord::retry_cursor);
        let rest = store.list_retry_candidates(now, 4, cursor, 2).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].id, ids[3]);
    }

    #[tokio::test]
    async fn test_mark_as_read_is_idempotent() {
        let store = InMemoryMetadataStore::new();
        let r = record("42");
        store.create(&r).await.unwrap();
        let ids = vec![r.id.clone(), "missing".to_string()];
        assert_eq!(store.mark_as_read(&ids, Utc::now()).await.unwrap(), 1);
        assert_eq!(store.mark_as_read(&ids, Utc::now()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_list_unread_excludes_expired_and_read() {
        let store = InMemoryMetadataStore::new();
        let now = Utc::now();

        let fresh = record("42");
        let mut expired = record("42");
        expired.expires_at = Some(now - Duration::minutes(1));
        let read = record("42");
        let other = record("7");
        for r in [&fresh, &expired, &read, &other] {
            store.create(r).await.unwrap();
        }
        store.mark_as_read(&[read.id.clone()], now).await.unwrap();

        let unread = store.list_unread("42", now, 50).await.unwrap();
        assert_eq!(unread.len(), 1);
        assert_eq!(unread[0].id, fresh.id);

        assert_eq!(store.list_expired(now, 10).await.unwrap(), vec![expired.id]);
    }

    #[tokio::test]
    async fn test_injected_write_failure() {
        let store = InMemoryMetadataStore::new();
        store.fail_next_writes(1);
        assert!(matches!(
            store.create(&record("42")).await,
            Err(NotificationError::Storage(_))
        ));
        store.create(&record("42")).await.unwrap();
        assert_eq!(store.len(), 1);
    }
}
