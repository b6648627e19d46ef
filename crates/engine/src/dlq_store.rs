//! Dead-letter queue store for episodes that exhausted their fast retries.
//!
//! Entries move `pending -> retrying -> pending ...` until they are either
//! `resolved` or `failed`. Terminal entries are frozen: later retry updates
//! leave them untouched, and they are only ever removed by the retention purge.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use tokio::sync::RwLock;
use uuid::Uuid;

use payhook_common::error::AppError;
use payhook_common::types::{
    DlqEntry, DlqFilter, DlqPage, DlqRetryUpdate, DlqStatus, NewDlqEntry, PageRequest,
    Pagination,
};

/// Exponential slow-retry schedule: `2^retry_count` hours.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DlqRetrySchedule {
    base: Duration,
}

impl DlqRetrySchedule {
    /// Exponent ceiling; `2^16` hours is already more than seven years.
    const MAX_EXPONENT: i32 = 16;

    pub fn hourly() -> Self {
        Self {
            base: Duration::hours(1),
        }
    }

    /// Delay before the next attempt once `retry_count` retries have been used.
    pub fn delay(&self, retry_count: i32) -> Duration {
        let exponent = retry_count.clamp(0, Self::MAX_EXPONENT) as u32;
        self.base * 2i32.pow(exponent)
    }

    pub fn next_retry_at(&self, retry_count: i32, now: DateTime<Utc>) -> DateTime<Utc> {
        now + self.delay(retry_count)
    }
}

impl Default for DlqRetrySchedule {
    fn default() -> Self {
        Self::hourly()
    }
}

#[async_trait]
pub trait DlqStore: Send + Sync {
    /// Enqueue a new `pending` entry due one hour from now.
    async fn add(&self, fields: NewDlqEntry) -> Result<DlqEntry, AppError>;

    /// Due `pending`/`retrying` entries with budget left, oldest due first.
    async fn get_pending_retries(&self, limit: i64) -> Result<Vec<DlqEntry>, AppError>;

    /// Record a retry transition and reschedule non-terminal entries.
    async fn update_after_retry(
        &self,
        id: Uuid,
        update: DlqRetryUpdate,
    ) -> Result<DlqEntry, AppError>;

    /// Returns `false` when the entry was already terminal or is missing.
    async fn mark_resolved(&self, id: Uuid) -> Result<bool, AppError>;

    /// Returns `false` when the entry was already terminal or is missing.
    async fn mark_failed(&self, id: Uuid, error: Option<String>) -> Result<bool, AppError>;

    /// Purge terminal entries last touched more than `days` ago.
    async fn delete_old_entries(&self, days: i64) -> Result<u64, AppError>;

    async fn get(&self, id: Uuid) -> Result<Option<DlqEntry>, AppError>;

    async fn list(&self, filter: &DlqFilter, page: PageRequest) -> Result<DlqPage, AppError>;
}

fn not_found(id: Uuid) -> AppError {
    AppError::NotFound(format!("DLQ entry {} not found", id))
}

/// Next due time for a retry update; terminal statuses are never rescheduled.
fn scheduled_after(
    schedule: &DlqRetrySchedule,
    update: &DlqRetryUpdate,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    (!update.status.is_terminal()).then(|| schedule.next_retry_at(update.retry_count, now))
}

// ============================================================
// PostgreSQL
// ============================================================

#[derive(Clone)]
pub struct PgDlqStore {
    pool: PgPool,
    schedule: DlqRetrySchedule,
}

impl PgDlqStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            schedule: DlqRetrySchedule::default(),
        }
    }
}

#[async_trait]
impl DlqStore for PgDlqStore {
    async fn add(&self, fields: NewDlqEntry) -> Result<DlqEntry, AppError> {
        let now = Utc::now();
        let meta = fields.meta;

        let entry = sqlx::query_as::<_, DlqEntry>(
            r#"
            INSERT INTO webhook_dlq (
                id, webhook_log_id, user_id, user_email, webhook_url,
                email_config_id, email_config_email, transaction_doc_id, transaction_id,
                payload, status, retry_count, max_retries, last_error, next_retry_at,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, 0, $12, $13, $14, $15, $15)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(fields.webhook_log_id)
        .bind(meta.user_id)
        .bind(&meta.user_email)
        .bind(&fields.webhook_url)
        .bind(&meta.email_config_id)
        .bind(&meta.email_config_email)
        .bind(&meta.transaction_doc_id)
        .bind(&meta.transaction_id)
        .bind(&fields.payload)
        .bind(DlqStatus::Pending)
        .bind(fields.max_retries.max(0))
        .bind(&fields.last_error)
        .bind(self.schedule.next_retry_at(0, now))
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(
            dlq_id = %entry.id,
            webhook_log_id = ?entry.webhook_log_id,
            user_id = %entry.user_id,
            "Delivery moved to dead-letter queue"
        );

        Ok(entry)
    }

    async fn get_pending_retries(&self, limit: i64) -> Result<Vec<DlqEntry>, AppError> {
        let entries = sqlx::query_as::<_, DlqEntry>(
            r#"
            SELECT * FROM webhook_dlq
            WHERE status IN ('pending', 'retrying')
              AND retry_count < max_retries
              AND next_retry_at <= NOW()
            ORDER BY next_retry_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(entries)
    }

    async fn update_after_retry(
        &self,
        id: Uuid,
        update: DlqRetryUpdate,
    ) -> Result<DlqEntry, AppError> {
        let next_retry_at = scheduled_after(&self.schedule, &update, Utc::now());

        let updated = sqlx::query_as::<_, DlqEntry>(
            r#"
            UPDATE webhook_dlq
            SET status = $2,
                retry_count = LEAST(GREATEST($3, 0), max_retries),
                last_error = COALESCE($4, last_error),
                next_retry_at = $5,
                updated_at = NOW()
            WHERE id = $1 AND status NOT IN ('resolved', 'failed')
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(update.status)
        .bind(update.retry_count)
        .bind(&update.error)
        .bind(next_retry_at)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(entry) => Ok(entry),
            None => self.get(id).await?.ok_or_else(|| not_found(id)),
        }
    }

    async fn mark_resolved(&self, id: Uuid) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_dlq
            SET status = 'resolved', next_retry_at = NULL,
                resolved_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND status NOT IN ('resolved', 'failed')
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_failed(&self, id: Uuid, error: Option<String>) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_dlq
            SET status = 'failed', next_retry_at = NULL,
                last_error = COALESCE($2, last_error), updated_at = NOW()
            WHERE id = $1 AND status NOT IN ('resolved', 'failed')
            "#,
        )
        .bind(id)
        .bind(&error)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_old_entries(&self, days: i64) -> Result<u64, AppError> {
        let cutoff = Utc::now() - Duration::days(days);

        let result = sqlx::query(
            r#"
            DELETE FROM webhook_dlq
            WHERE status IN ('resolved', 'failed') AND updated_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn get(&self, id: Uuid) -> Result<Option<DlqEntry>, AppError> {
        let entry = sqlx::query_as::<_, DlqEntry>("SELECT * FROM webhook_dlq WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(entry)
    }

    async fn list(&self, filter: &DlqFilter, page: PageRequest) -> Result<DlqPage, AppError> {
        let status = filter.status.map(|s| s.to_string());

        let entries = sqlx::query_as::<_, DlqEntry>(
            r#"
            SELECT * FROM webhook_dlq
            WHERE ($1::uuid IS NULL OR user_id = $1)
              AND ($2::text IS NULL OR status = $2)
            ORDER BY created_at DESC, id DESC
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(filter.user_id)
        .bind(&status)
        .bind(page.limit as i64)
        .bind(page.offset())
        .fetch_all(&self.pool)
        .await?;

        let (total,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM webhook_dlq
            WHERE ($1::uuid IS NULL OR user_id = $1)
              AND ($2::text IS NULL OR status = $2)
            "#,
        )
        .bind(filter.user_id)
        .bind(&status)
        .fetch_one(&self.pool)
        .await?;

        Ok(DlqPage {
            entries,
            pagination: Pagination::new(page, total),
        })
    }
}

// ============================================================
// In-memory
// ============================================================

#[derive(Default)]
pub struct InMemoryDlqStore {
    entries: RwLock<Vec<DlqEntry>>,
    schedule: DlqRetrySchedule,
}

impl InMemoryDlqStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override an entry's due time, e.g. to make it due immediately.
    pub async fn reschedule(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), AppError> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| not_found(id))?;
        entry.next_retry_at = Some(at);
        Ok(())
    }

    /// Override an entry's last-touched time so it ages into the purge window.
    pub async fn backdate(&self, id: Uuid, updated_at: DateTime<Utc>) -> Result<(), AppError> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| not_found(id))?;
        entry.updated_at = updated_at;
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    async fn finish(&self, id: Uuid, status: DlqStatus, error: Option<String>) -> bool {
        let mut entries = self.entries.write().await;
        let Some(entry) = entries.iter_mut().find(|e| e.id == id) else {
            return false;
        };
        if entry.status.is_terminal() {
            return false;
        }

        let now = Utc::now();
        entry.status = status;
        entry.next_retry_at = None;
        entry.updated_at = now;
        if status == DlqStatus::Resolved {
            entry.resolved_at = Some(now);
        }
        if error.is_some() {
            entry.last_error = error;
        }
        true
    }
}

#[async_trait]
impl DlqStore for InMemoryDlqStore {
    async fn add(&self, fields: NewDlqEntry) -> Result<DlqEntry, AppError> {
        let now = Utc::now();
        let meta = fields.meta;
        let entry = DlqEntry {
            id: Uuid::new_v4(),
            webhook_log_id: fields.webhook_log_id,
            user_id: meta.user_id,
            user_email: meta.user_email,
            webhook_url: fields.webhook_url,
            email_config_id: meta.email_config_id,
            email_config_email: meta.email_config_email,
            transaction_doc_id: meta.transaction_doc_id,
            transaction_id: meta.transaction_id,
            payload: fields.payload,
            status: DlqStatus::Pending,
            retry_count: 0,
            max_retries: fields.max_retries.max(0),
            last_error: fields.last_error,
            next_retry_at: Some(self.schedule.next_retry_at(0, now)),
            created_at: now,
            updated_at: now,
            resolved_at: None,
        };

        self.entries.write().await.push(entry.clone());
        Ok(entry)
    }

    async fn get_pending_retries(&self, limit: i64) -> Result<Vec<DlqEntry>, AppError> {
        let now = Utc::now();
        let entries = self.entries.read().await;

        let mut due: Vec<DlqEntry> = entries
            .iter()
            .filter(|e| !e.status.is_terminal())
            .filter(|e| e.retry_count < e.max_retries)
            .filter(|e| e.next_retry_at.is_some_and(|at| at <= now))
            .cloned()
            .collect();
        due.sort_by_key(|e| e.next_retry_at);
        due.truncate(limit.max(0) as usize);

        Ok(due)
    }

    async fn update_after_retry(
        &self,
        id: Uuid,
        update: DlqRetryUpdate,
    ) -> Result<DlqEntry, AppError> {
        let now = Utc::now();
        let mut entries = self.entries.write().await;
        let entry = entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| not_found(id))?;

        if entry.status.is_terminal() {
            return Ok(entry.clone());
        }

        entry.status = update.status;
        entry.retry_count = update.retry_count.clamp(0, entry.max_retries);
        if update.error.is_some() {
            entry.last_error = update.error.clone();
        }
        entry.next_retry_at = scheduled_after(&self.schedule, &update, now);
        entry.updated_at = now;

        Ok(entry.clone())
    }

    async fn mark_resolved(&self, id: Uuid) -> Result<bool, AppError> {
        Ok(self.finish(id, DlqStatus::Resolved, None).await)
    }

    async fn mark_failed(&self, id: Uuid, error: Option<String>) -> Result<bool, AppError> {
        Ok(self.finish(id, DlqStatus::Failed, error).await)
    }

    async fn delete_old_entries(&self, days: i64) -> Result<u64, AppError> {
        let cutoff = Utc::now() - Duration::days(days);
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|e| !(e.status.is_terminal() && e.updated_at < cutoff));
        Ok((before - entries.len()) as u64)
    }

    async fn get(&self, id: Uuid) -> Result<Option<DlqEntry>, AppError> {
        Ok(self
            .entries
            .read()
            .await
            .iter()
            .find(|e| e.id == id)
            .cloned())
    }

    async fn list(&self, filter: &DlqFilter, page: PageRequest) -> Result<DlqPage, AppError> {
        let entries = self.entries.read().await;
        let matching: Vec<&DlqEntry> = entries
            .iter()
            .rev()
            .filter(|e| filter.user_id.is_none_or(|u| e.user_id == u))
            .filter(|e| filter.status.is_none_or(|s| e.status == s))
            .collect();

        let total = matching.len() as i64;
        let entries = matching
            .into_iter()
            .skip(page.offset() as usize)
            .take(page.limit as usize)
            .cloned()
            .collect();

        Ok(DlqPage {
            entries,
            pagination: Pagination::new(page, total),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use payhook_common::types::DeliveryMeta;

    fn new_entry(user_id: Uuid) -> NewDlqEntry {
        NewDlqEntry {
            webhook_log_id: Some(Uuid::new_v4()),
            webhook_url: "https://hooks.example.com/tx".to_string(),
            payload: serde_json::json!({ "orderId": "DH001", "amount": 250000 }),
            meta: DeliveryMeta::for_user(user_id),
            last_error: Some("HTTP 503".to_string()),
            max_retries: 3,
        }
    }

    #[test]
    fn test_schedule_doubles_every_retry() {
        let schedule = DlqRetrySchedule::hourly();
        assert_eq!(schedule.delay(0), Duration::hours(1));
        assert_eq!(schedule.delay(1), Duration::hours(2));
        assert_eq!(schedule.delay(2), Duration::hours(4));
        assert_eq!(schedule.delay(3), Duration::hours(8));
        assert_eq!(schedule.delay(-4), Duration::hours(1));
        assert_eq!(schedule.delay(1_000), schedule.delay(DlqRetrySchedule::MAX_EXPONENT));
    }

    #[tokio::test]
    async fn test_add_is_pending_and_due_in_an_hour() {
        let store = InMemoryDlqStore::new();
        let before = Utc::now();
        let entry = store.add(new_entry(Uuid::new_v4())).await.unwrap();
        let after = Utc::now();

        assert_eq!(entry.status, DlqStatus::Pending);
        assert_eq!(entry.retry_count, 0);
        let due = entry.next_retry_at.unwrap();
        assert!(due >= before + Duration::hours(1) && due <= after + Duration::hours(1));

        // Not due yet.
        assert!(store.get_pending_retries(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pending_retries_oldest_due_first() {
        let store = InMemoryDlqStore::new();
        let user = Uuid::new_v4();
        let a = store.add(new_entry(user)).await.unwrap();
        let b = store.add(new_entry(user)).await.unwrap();
        let c = store.add(new_entry(user)).await.unwrap();
        let now = Utc::now();
        store.reschedule(a.id, now - Duration::minutes(1)).await.unwrap();
        store.reschedule(b.id, now - Duration::minutes(5)).await.unwrap();
        store.reschedule(c.id, now + Duration::minutes(5)).await.unwrap();

        let due = store.get_pending_retries(10).await.unwrap();
        let ids: Vec<Uuid> = due.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![b.id, a.id]);

        assert_eq!(store.get_pending_retries(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_after_retry_reschedules_exponentially() {
        let store = InMemoryDlqStore::new();
        let entry = store.add(new_entry(Uuid::new_v4())).await.unwrap();

        for r in 1..=2 {
            let before = Utc::now();
            let updated = store
                .update_after_retry(
                    entry.id,
                    DlqRetryUpdate {
                        status: DlqStatus::Pending,
                        retry_count: r,
                        error: Some(format!("HTTP 502 #{r}")),
                    },
                )
                .await
                .unwrap();
            let after = Utc::now();

            let expected = Duration::hours(1 << r);
            let due = updated.next_retry_at.unwrap();
            assert!(due >= before + expected && due <= after + expected);
            assert_eq!(updated.retry_count, r);
            assert_eq!(updated.last_error, Some(format!("HTTP 502 #{r}")));
        }
    }

    #[tokio::test]
    async fn test_retry_count_never_exceeds_budget() {
        let store = InMemoryDlqStore::new();
        let entry = store.add(new_entry(Uuid::new_v4())).await.unwrap();
        let updated = store
            .update_after_retry(
                entry.id,
                DlqRetryUpdate {
                    status: DlqStatus::Retrying,
                    retry_count: 7,
                    error: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.retry_count, 3);
    }

    #[tokio::test]
    async fn test_terminal_marks_are_idempotent() {
        let store = InMemoryDlqStore::new();
        let entry = store.add(new_entry(Uuid::new_v4())).await.unwrap();

        assert!(store.mark_resolved(entry.id).await.unwrap());
        assert!(!store.mark_resolved(entry.id).await.unwrap());
        assert!(!store.mark_failed(entry.id, Some("late".into())).await.unwrap());

        let stored = store.get(entry.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DlqStatus::Resolved);
        assert!(stored.next_retry_at.is_none());
        assert!(stored.resolved_at.is_some());
        assert_eq!(stored.last_error.as_deref(), Some("HTTP 503"));

        assert!(!store.mark_failed(Uuid::new_v4(), None).await.unwrap());
    }

    #[tokio::test]
    async fn test_frozen_entry_ignores_retry_updates() {
        let store = InMemoryDlqStore::new();
        let entry = store.add(new_entry(Uuid::new_v4())).await.unwrap();
        store.mark_failed(entry.id, Some("HTTP 410".into())).await.unwrap();

        let after = store
            .update_after_retry(
                entry.id,
                DlqRetryUpdate {
                    status: DlqStatus::Pending,
                    retry_count: 1,
                    error: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(after.status, DlqStatus::Failed);
        assert_eq!(after.retry_count, 0);
        assert!(after.next_retry_at.is_none());
    }

    #[tokio::test]
    async fn test_purge_only_removes_old_terminal_entries() {
        let store = InMemoryDlqStore::new();
        let user = Uuid::new_v4();
        let old_resolved = store.add(new_entry(user)).await.unwrap();
        let old_pending = store.add(new_entry(user)).await.unwrap();
        let fresh_failed = store.add(new_entry(user)).await.unwrap();

        store.mark_resolved(old_resolved.id).await.unwrap();
        store.mark_failed(fresh_failed.id, None).await.unwrap();
        let long_ago = Utc::now() - Duration::days(45);
        store.backdate(old_resolved.id, long_ago).await.unwrap();
        store.backdate(old_pending.id, long_ago).await.unwrap();

        assert_eq!(store.delete_old_entries(30).await.unwrap(), 1);
        assert!(store.get(old_resolved.id).await.unwrap().is_none());
        assert!(store.get(old_pending.id).await.unwrap().is_some());
        assert!(store.get(fresh_failed.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_list_filters_by_user_and_status() {
        let store = InMemoryDlqStore::new();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let first = store.add(new_entry(alice)).await.unwrap();
        store.add(new_entry(alice)).await.unwrap();
        store.add(new_entry(bob)).await.unwrap();
        store.mark_resolved(first.id).await.unwrap();

        let alice_all = store
            .list(
                &DlqFilter {
                    user_id: Some(alice),
                    status: None,
                },
                PageRequest::default(),
            )
            .await
            .unwrap();
        assert_eq!(alice_all.pagination.total, 2);

        let resolved = store
            .list(
                &DlqFilter {
                    user_id: None,
                    status: Some(DlqStatus::Resolved),
                },
                PageRequest::default(),
            )
            .await
            .unwrap();
        assert_eq!(resolved.entries.len(), 1);
        assert_eq!(resolved.entries[0].id, first.id);
    }
}
