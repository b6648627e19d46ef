//! Delivery log store: one episode per outbound event, attempts appended in place.
//!
//! The Postgres implementation keeps the attempt history as a JSONB array and
//! refreshes the cached summary columns (`total_attempts`, `last_error`,
//! `final_status_code`, `last_attempt_at`) in the same `UPDATE` so list views
//! never scan attempts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::types::Json;
use tokio::sync::RwLock;
use uuid::Uuid;

use payhook_common::error::AppError;
use payhook_common::types::{
    AttemptRecord, DeliveryEpisode, EpisodeCompletion, EpisodeFilter, EpisodePage,
    EpisodeStatus, NewEpisode, PageRequest, Pagination, SortOrder,
};

/// Persistence for delivery episodes. Every write is an id-keyed point write.
#[async_trait]
pub trait DeliveryLogStore: Send + Sync {
    /// Open a `pending` episode with an empty attempt history.
    async fn create(&self, fields: NewEpisode) -> Result<DeliveryEpisode, AppError>;

    /// Append `attempt` and refresh the cached summary fields.
    async fn append_attempt(
        &self,
        id: Uuid,
        attempt: AttemptRecord,
    ) -> Result<DeliveryEpisode, AppError>;

    /// Move a non-terminal episode to `status` (used for `retrying`).
    async fn set_status(&self, id: Uuid, status: EpisodeStatus)
    -> Result<DeliveryEpisode, AppError>;

    /// Terminal write: `success` or `failed`.
    async fn mark_completed(
        &self,
        id: Uuid,
        completion: EpisodeCompletion,
    ) -> Result<DeliveryEpisode, AppError>;

    async fn get(&self, id: Uuid) -> Result<Option<DeliveryEpisode>, AppError>;

    /// Paginated listing for dashboards.
    async fn list(
        &self,
        filter: &EpisodeFilter,
        page: PageRequest,
        sort: SortOrder,
    ) -> Result<EpisodePage, AppError>;
}

fn not_found(id: Uuid) -> AppError {
    AppError::NotFound(format!("Delivery episode {} not found", id))
}

// ============================================================
// PostgreSQL
// ============================================================

/// Row shape of `webhook_logs`; Postgres has no unsigned integers.
#[derive(Debug, sqlx::FromRow)]
struct EpisodeRow {
    id: Uuid,
    user_id: Uuid,
    user_email: Option<String>,
    webhook_url: String,
    email_config_id: Option<String>,
    email_config_email: Option<String>,
    transaction_doc_id: Option<String>,
    transaction_id: Option<String>,
    payload: serde_json::Value,
    status: EpisodeStatus,
    attempts: Json<Vec<AttemptRecord>>,
    total_attempts: i32,
    last_error: Option<String>,
    final_status_code: Option<i32>,
    last_attempt_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<EpisodeRow> for DeliveryEpisode {
    fn from(row: EpisodeRow) -> Self {
        Self {
            id: row.id,
            user_id: row.user_id,
            user_email: row.user_email,
            webhook_url: row.webhook_url,
            email_config_id: row.email_config_id,
            email_config_email: row.email_config_email,
            transaction_doc_id: row.transaction_doc_id,
            transaction_id: row.transaction_id,
            payload: row.payload,
            status: row.status,
            attempts: row.attempts.0,
            total_attempts: row.total_attempts.max(0) as u32,
            last_error: row.last_error,
            final_status_code: row.final_status_code.and_then(|c| u16::try_from(c).ok()),
            last_attempt_at: row.last_attempt_at,
            completed_at: row.completed_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// `webhook_logs`-backed store.
#[derive(Clone)]
pub struct PgDeliveryLogStore {
    pool: PgPool,
}

impl PgDeliveryLogStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeliveryLogStore for PgDeliveryLogStore {
    async fn create(&self, fields: NewEpisode) -> Result<DeliveryEpisode, AppError> {
        let episode = DeliveryEpisode::new(fields, Utc::now());

        let row: EpisodeRow = sqlx::query_as(
            r#"
            INSERT INTO webhook_logs (
                id, user_id, user_email, webhook_url,
                email_config_id, email_config_email, transaction_doc_id, transaction_id,
                payload, status, attempts, total_attempts, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, '[]'::jsonb, 0, $11, $11)
            RETURNING *
            "#,
        )
        .bind(episode.id)
        .bind(episode.user_id)
        .bind(&episode.user_email)
        .bind(&episode.webhook_url)
        .bind(&episode.email_config_id)
        .bind(&episode.email_config_email)
        .bind(&episode.transaction_doc_id)
        .bind(&episode.transaction_id)
        .bind(&episode.payload)
        .bind(EpisodeStatus::Pending)
        .bind(episode.created_at)
        .fetch_one(&self.pool)
        .await?;

        tracing::debug!(episode_id = %row.id, user_id = %row.user_id, "Delivery episode created");
        Ok(row.into())
    }

    async fn append_attempt(
        &self,
        id: Uuid,
        attempt: AttemptRecord,
    ) -> Result<DeliveryEpisode, AppError> {
        let status_code = attempt.status_code.map(i32::from);

        let row: Option<EpisodeRow> = sqlx::query_as(
            r#"
            UPDATE webhook_logs
            SET attempts = attempts || jsonb_build_array($2::jsonb),
                total_attempts = jsonb_array_length(attempts) + 1,
                last_error = COALESCE($3, last_error),
                final_status_code = COALESCE($4, final_status_code),
                last_attempt_at = $5,
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(Json(&attempt))
        .bind(&attempt.error_message)
        .bind(status_code)
        .bind(attempt.completed_at)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Into::into).ok_or_else(|| not_found(id))
    }

    async fn set_status(
        &self,
        id: Uuid,
        status: EpisodeStatus,
    ) -> Result<DeliveryEpisode, AppError> {
        let row: Option<EpisodeRow> = sqlx::query_as(
            r#"
            UPDATE webhook_logs
            SET status = $2, updated_at = NOW()
            WHERE id = $1 AND status NOT IN ('success', 'failed')
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(status)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(row.into()),
            // Completed episodes are left untouched.
            None => self.get(id).await?.ok_or_else(|| not_found(id)),
        }
    }

    async fn mark_completed(
        &self,
        id: Uuid,
        completion: EpisodeCompletion,
    ) -> Result<DeliveryEpisode, AppError> {
        let status = if completion.success {
            EpisodeStatus::Success
        } else {
            EpisodeStatus::Failed
        };

        let row: Option<EpisodeRow> = sqlx::query_as(
            r#"
            UPDATE webhook_logs
            SET status = $2,
                final_status_code = COALESCE($3, final_status_code),
                last_error = COALESCE($4, last_error),
                completed_at = NOW(),
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(completion.final_status_code.map(i32::from))
        .bind(&completion.error_message)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Into::into).ok_or_else(|| not_found(id))
    }

    async fn get(&self, id: Uuid) -> Result<Option<DeliveryEpisode>, AppError> {
        let row: Option<EpisodeRow> = sqlx::query_as("SELECT * FROM webhook_logs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(Into::into))
    }

    async fn list(
        &self,
        filter: &EpisodeFilter,
        page: PageRequest,
        sort: SortOrder,
    ) -> Result<EpisodePage, AppError> {
        let direction = match sort {
            SortOrder::Desc => "DESC",
            SortOrder::Asc => "ASC",
        };
        let status = filter.status.map(|s| s.to_string());

        let query = format!(
            r#"
            SELECT * FROM webhook_logs
            WHERE ($1::uuid IS NULL OR user_id = $1)
              AND ($2::text IS NULL OR status = $2)
              AND ($3::text IS NULL OR transaction_id = $3)
            ORDER BY created_at {direction}, id {direction}
            LIMIT $4 OFFSET $5
            "#
        );

        let rows: Vec<EpisodeRow> = sqlx::query_as(&query)
            .bind(filter.user_id)
            .bind(&status)
            .bind(&filter.transaction_id)
            .bind(page.limit as i64)
            .bind(page.offset())
            .fetch_all(&self.pool)
            .await?;

        let (total,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM webhook_logs
            WHERE ($1::uuid IS NULL OR user_id = $1)
              AND ($2::text IS NULL OR status = $2)
              AND ($3::text IS NULL OR transaction_id = $3)
            "#,
        )
        .bind(filter.user_id)
        .bind(&status)
        .bind(&filter.transaction_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(EpisodePage {
            episodes: rows.into_iter().map(Into::into).collect(),
            pagination: Pagination::new(page, total),
        })
    }
}

// ============================================================
// In-memory
// ============================================================

/// Process-local store for tests and database-less local runs.
#[derive(Default)]
pub struct InMemoryDeliveryLogStore {
    episodes: RwLock<Vec<DeliveryEpisode>>,
}

impl InMemoryDeliveryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.episodes.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.episodes.read().await.is_empty()
    }

    async fn update<F>(&self, id: Uuid, apply: F) -> Result<DeliveryEpisode, AppError>
    where
        F: FnOnce(&mut DeliveryEpisode) + Send,
    {
        let mut episodes = self.episodes.write().await;
        let episode = episodes
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| not_found(id))?;
        apply(episode);
        Ok(episode.clone())
    }
}

#[async_trait]
impl DeliveryLogStore for InMemoryDeliveryLogStore {
    async fn create(&self, fields: NewEpisode) -> Result<DeliveryEpisode, AppError> {
        let episode = DeliveryEpisode::new(fields, Utc::now());
        self.episodes.write().await.push(episode.clone());
        Ok(episode)
    }

    async fn append_attempt(
        &self,
        id: Uuid,
        attempt: AttemptRecord,
    ) -> Result<DeliveryEpisode, AppError> {
        self.update(id, |episode| episode.record_attempt(attempt)).await
    }

    async fn set_status(
        &self,
        id: Uuid,
        status: EpisodeStatus,
    ) -> Result<DeliveryEpisode, AppError> {
        self.update(id, |episode| {
            if !episode.status.is_terminal() {
                episode.status = status;
                episode.updated_at = Utc::now();
            }
        })
        .await
    }

    async fn mark_completed(
        &self,
        id: Uuid,
        completion: EpisodeCompletion,
    ) -> Result<DeliveryEpisode, AppError> {
        self.update(id, |episode| episode.complete(&completion, Utc::now()))
            .await
    }

    async fn get(&self, id: Uuid) -> Result<Option<DeliveryEpisode>, AppError> {
        Ok(self
            .episodes
            .read()
            .await
            .iter()
            .find(|e| e.id == id)
            .cloned())
    }

    async fn list(
        &self,
        filter: &EpisodeFilter,
        page: PageRequest,
        sort: SortOrder,
    ) -> Result<EpisodePage, AppError> {
        let episodes = self.episodes.read().await;

        // Insertion order doubles as creation order.
        let mut matching: Vec<&DeliveryEpisode> = episodes
            .iter()
            .filter(|e| filter.user_id.is_none_or(|u| e.user_id == u))
            .filter(|e| filter.status.is_none_or(|s| e.status == s))
            .filter(|e| {
                filter
                    .transaction_id
                    .as_deref()
                    .is_none_or(|t| e.transaction_id.as_deref() == Some(t))
            })
            .collect();
        if sort == SortOrder::Desc {
            matching.reverse();
        }

        let total = matching.len() as i64;
        let episodes = matching
            .into_iter()
            .skip(page.offset() as usize)
            .take(page.limit as usize)
            .cloned()
            .collect();

        Ok(EpisodePage {
            episodes,
            pagination: Pagination::new(page, total),
        })
    }
}
