//! Endpoint tools: URL validation, secret generation and test deliveries.

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use payhook_common::error::AppError;
use payhook_common::types::DeliveryMeta;
use payhook_engine::signature;
use payhook_engine::validator::ValidationReport;
use payhook_notifier::dispatcher::DeliveryOutcome;

use crate::middleware::auth::AuthUser;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/webhooks/validate", post(validate_endpoint))
        .route("/api/webhooks/secret", post(generate_secret))
        .route("/api/webhooks/test", post(test_delivery))
}

#[derive(Debug, Deserialize)]
pub struct EndpointRequest {
    pub url: String,
}

#[derive(Debug, Serialize)]
pub struct SecretResponse {
    pub secret: String,
}

/// POST /api/webhooks/validate: Check a URL without sending anything.
async fn validate_endpoint(
    State(state): State<AppState>,
    _auth: AuthUser,
    Json(req): Json<EndpointRequest>,
) -> Json<ValidationReport> {
    Json(state.validator.report(&req.url))
}

/// POST /api/webhooks/secret: Fresh signing secret for an endpoint.
async fn generate_secret(_auth: AuthUser) -> Json<SecretResponse> {
    Json(SecretResponse {
        secret: signature::generate_secret(),
    })
}

/// POST /api/webhooks/test: One-shot delivery of a sample event.
///
/// Rate limited per user; the attempt is logged and broadcast like any other
/// episode but never escalated to the DLQ.
async fn test_delivery(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(req): Json<EndpointRequest>,
) -> Result<Json<DeliveryOutcome>, AppError> {
    let endpoint = state
        .validator
        .validate(&req.url)
        .map_err(|e| AppError::Validation(e.to_string()))?;

    if let Some(limiter) = &state.rate_limiter {
        let decision = limiter.check_and_increment(auth.user_id).await?;
        if !decision.allowed {
            return Err(AppError::RateLimited(format!(
                "Test delivery limit reached, try again in {} seconds",
                decision.reset_in_secs
            )));
        }
    }

    let payload = sample_payload(auth.user_id);
    let outcome = state
        .dispatcher
        .deliver(endpoint.as_str(), &payload, 1, &DeliveryMeta::for_user(auth.user_id))
        .await;

    tracing::info!(
        user_id = %auth.user_id,
        success = outcome.success,
        status_code = ?outcome.status_code,
        "Test webhook sent"
    );

    Ok(Json(outcome))
}

fn sample_payload(user_id: Uuid) -> serde_json::Value {
    json!({
        "event": "webhook.test",
        "timestamp": Utc::now().to_rfc3339(),
        "userId": user_id,
        "data": {
            "transactionId": "TEST-0001",
            "amount": 100000,
            "currency": "VND",
            "description": "Payhook test delivery"
        }
    })
}
