//! Delivery episode history for the dashboard.

use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use uuid::Uuid;

use payhook_common::error::AppError;
use payhook_common::types::{
    DeliveryEpisode, EpisodeFilter, EpisodePage, EpisodeStatus, PageRequest, SortOrder,
};

use crate::middleware::auth::AuthUser;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/webhooks/logs", get(list_logs))
        .route("/api/webhooks/logs/{id}", get(get_log))
}

#[derive(Debug, Deserialize)]
pub struct LogQuery {
    pub status: Option<String>,
    pub transaction_id: Option<String>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
    pub sort: Option<SortOrder>,
    /// Honoured for admins only
    pub user_id: Option<Uuid>,
}

/// GET /api/webhooks/logs: Paginated episodes, newest first by default.
async fn list_logs(
    State(state): State<AppState>,
    auth: AuthUser,
    Query(query): Query<LogQuery>,
) -> Result<Json<EpisodePage>, AppError> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<EpisodeStatus>)
        .transpose()?;

    let filter = EpisodeFilter {
        user_id: auth.scope(query.user_id),
        status,
        transaction_id: query.transaction_id,
    };

    let page = state
        .log_store
        .list(
            &filter,
            PageRequest::clamped(query.page, query.limit),
            query.sort.unwrap_or_default(),
        )
        .await?;

    Ok(Json(page))
}

/// GET /api/webhooks/logs/{id}: One episode with its full attempt history.
async fn get_log(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<DeliveryEpisode>, AppError> {
    state
        .log_store
        .get(id)
        .await?
        .filter(|episode| auth.is_admin() || episode.user_id == auth.user_id)
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("Webhook log {} not found", id)))
}
