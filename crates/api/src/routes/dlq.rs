use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use uuid::Uuid;

use payhook_common::error::AppError;
use payhook_common::types::{DlqFilter, DlqPage, DlqStatus, PageRequest};

use crate::middleware::auth::AuthUser;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/api/webhooks/dlq", get(list_dlq))
}

#[derive(Debug, Deserialize)]
pub struct DlqQuery {
    pub status: Option<String>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
    pub user_id: Option<Uuid>,
}

/// GET /api/webhooks/dlq: Dead-letter entries awaiting or done with slow retries.
async fn list_dlq(
    State(state): State<AppState>,
    auth: AuthUser,
    Query(query): Query<DlqQuery>,
) -> Result<Json<DlqPage>, AppError> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<DlqStatus>)
        .transpose()?;

    let filter = DlqFilter {
        user_id: auth.scope(query.user_id),
        status,
    };

    let page = state
        .dlq_store
        .list(&filter, PageRequest::clamped(query.page, query.limit))
        .await?;

    Ok(Json(page))
}
