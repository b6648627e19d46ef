//! Payhook API server binary entrypoint.
//!
//! Serves the dashboard API and runs the DLQ processor in the background.

use std::net::SocketAddr;
use std::sync::Arc;

use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use payhook_common::config::AppConfig;
use payhook_common::db::{create_pool, run_migrations};
use payhook_common::redis_pool::create_redis_pool;
use payhook_engine::dlq_store::{DlqStore, PgDlqStore};
use payhook_engine::log_store::PgDeliveryLogStore;
use payhook_engine::rate_limiter::WebhookRateLimiter;
use payhook_notifier::dlq_processor::{DlqProcessor, DlqProcessorConfig};

use payhook_api::routes::create_router;
use payhook_api::state::AppState;

/// Dashboard requests carry small JSON bodies only.
const MAX_REQUEST_BODY_BYTES: usize = 64 * 1024;

const DEFAULT_LOG_FILTER: &str =
    "payhook_api=debug,payhook_notifier=debug,payhook_engine=info,tower_http=debug";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    tracing::info!("Starting Payhook API server...");

    let config = AppConfig::from_env()?;

    let pool = create_pool(&config.database_url, config.db_max_connections).await?;
    run_migrations(&pool).await?;

    let redis = create_redis_pool(&config.redis_url).await?;
    let rate_limiter = WebhookRateLimiter::new(redis, config.webhook_rate_limit_per_hour);

    let dlq_store: Arc<dyn DlqStore> = Arc::new(PgDlqStore::new(pool.clone()));
    let state = AppState::new(
        config.clone(),
        Arc::new(PgDeliveryLogStore::new(pool)),
        dlq_store.clone(),
        Some(rate_limiter),
    )?;

    // DLQ slow retries share the API's dispatcher so retries are broadcast too.
    let processor = DlqProcessor::new(
        dlq_store,
        state.dispatcher.clone(),
        DlqProcessorConfig::from_app_config(&config),
    );
    let processor_handle = tokio::spawn(async move { processor.run().await });

    let app = create_router(state)
        .layer(RequestBodyLimitLayer::new(MAX_REQUEST_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    tracing::info!(%addr, env = %config.app_env, "API server listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    processor_handle.abort();
    tracing::info!("Payhook API server stopped.");
    Ok(())
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    if std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Received shutdown signal, stopping gracefully...");
}
