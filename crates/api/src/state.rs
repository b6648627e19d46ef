//! Shared application state for the Axum API server.

use std::sync::Arc;

use payhook_common::config::AppConfig;
use payhook_common::error::AppError;
use payhook_engine::dlq_store::DlqStore;
use payhook_engine::log_store::DeliveryLogStore;
use payhook_engine::rate_limiter::WebhookRateLimiter;
use payhook_engine::validator::EndpointValidator;
use payhook_notifier::dispatcher::{DispatcherConfig, WebhookDispatcher};
use payhook_notifier::pipeline::DeliveryPipeline;
use payhook_notifier::realtime::ConnectionRegistry;

/// Application state shared across all route handlers via Axum `State`.
#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub log_store: Arc<dyn DeliveryLogStore>,
    pub dlq_store: Arc<dyn DlqStore>,
    pub registry: Arc<ConnectionRegistry>,
    pub validator: EndpointValidator,
    pub dispatcher: Arc<WebhookDispatcher>,
    /// Validate, deliver and escalate to the DLQ for in-process producers
    pub pipeline: Arc<DeliveryPipeline>,
    /// `None` disables the test-delivery limit (no Redis available)
    pub rate_limiter: Option<WebhookRateLimiter>,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        log_store: Arc<dyn DeliveryLogStore>,
        dlq_store: Arc<dyn DlqStore>,
        rate_limiter: Option<WebhookRateLimiter>,
    ) -> Result<Self, AppError> {
        let registry = Arc::new(ConnectionRegistry::new());
        let dispatcher = Arc::new(WebhookDispatcher::new(
            log_store.clone(),
            registry.clone(),
            DispatcherConfig::from_app_config(&config),
        )?);
        let validator = EndpointValidator::new(config.is_production());
        let pipeline = Arc::new(DeliveryPipeline::new(
            validator,
            dispatcher.clone(),
            dlq_store.clone(),
            config.dlq_max_retries,
        ));

        Ok(Self {
            config,
            log_store,
            dlq_store,
            registry,
            validator,
            dispatcher,
            pipeline,
            rate_limiter,
        })
    }
}
