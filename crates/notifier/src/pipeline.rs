//! Producer entry point: validate, deliver, escalate to the DLQ.

use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use payhook_common::types::{DeliveryMeta, NewDlqEntry};
use payhook_engine::dlq_store::DlqStore;
use payhook_engine::validator::{EndpointError, EndpointValidator};

use crate::dispatcher::{DeliveryOutcome, WebhookDispatcher};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineOutcome {
    pub delivery: DeliveryOutcome,
    /// Set when the failed delivery was handed to the DLQ
    pub dlq_entry_id: Option<Uuid>,
}

pub struct DeliveryPipeline {
    validator: EndpointValidator,
    dispatcher: Arc<WebhookDispatcher>,
    dlq: Arc<dyn DlqStore>,
    dlq_max_retries: i32,
}

impl DeliveryPipeline {
    pub fn new(
        validator: EndpointValidator,
        dispatcher: Arc<WebhookDispatcher>,
        dlq: Arc<dyn DlqStore>,
        dlq_max_retries: i32,
    ) -> Self {
        Self {
            validator,
            dispatcher,
            dlq,
            dlq_max_retries,
        }
    }

    /// Deliver one event with the configured fast-retry budget.
    ///
    /// Invalid endpoints are rejected before any episode exists. Transient
    /// failures that survive every fast retry are queued for slow retries;
    /// 4xx failures are not.
    pub async fn submit(
        &self,
        url: &str,
        payload: serde_json::Value,
        meta: DeliveryMeta,
    ) -> Result<PipelineOutcome, EndpointError> {
        let endpoint = self.validator.validate(url).inspect_err(|e| {
            tracing::warn!(user_id = %meta.user_id, error = %e, "Webhook endpoint rejected");
        })?;

        let max_attempts = self.dispatcher.config().max_attempts;
        let delivery = self
            .dispatcher
            .deliver(endpoint.as_str(), &payload, max_attempts, &meta)
            .await;

        let dlq_entry_id = if delivery.success || delivery.permanent {
            None
        } else {
            self.escalate(endpoint.as_str(), payload, meta, &delivery).await
        };

        Ok(PipelineOutcome {
            delivery,
            dlq_entry_id,
        })
    }

    async fn escalate(
        &self,
        url: &str,
        payload: serde_json::Value,
        meta: DeliveryMeta,
        delivery: &DeliveryOutcome,
    ) -> Option<Uuid> {
        let user_id = meta.user_id;
        let fields = NewDlqEntry {
            webhook_log_id: delivery.episode_id,
            webhook_url: url.to_string(),
            payload,
            meta,
            last_error: delivery.error.clone(),
            max_retries: self.dlq_max_retries,
        };

        match self.dlq.add(fields).await {
            Ok(entry) => Some(entry.id),
            Err(e) => {
                tracing::error!(
                    user_id = %user_id,
                    episode_id = ?delivery.episode_id,
                    error = %e,
                    "Failed to enqueue delivery in DLQ"
                );
                None
            }
        }
    }
}
