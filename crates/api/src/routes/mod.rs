pub mod dlq;
pub mod endpoints;
pub mod health;
pub mod logs;
pub mod realtime;

use axum::Router;

use crate::state::AppState;

/// Build the complete API router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(health::router())
        .merge(logs::router())
        .merge(dlq::router())
        .merge(endpoints::router())
        .merge(realtime::router())
        .with_state(state)
}
