//! Outbound webhook dispatcher.
//!
//! One call to [`WebhookDispatcher::deliver`] is one delivery episode: the
//! episode row is opened before the first attempt, every attempt is appended
//! as it completes, and the episode is closed as `success` or `failed`.
//! Persistence and broadcast failures are logged and never interrupt delivery.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use reqwest::Client;
use serde::Serialize;
use uuid::Uuid;

use payhook_common::config::AppConfig;
use payhook_common::error::AppError;
use payhook_common::types::{
    AttemptRecord, DeliveryEpisode, DeliveryMeta, EpisodeCompletion, EpisodeStatus,
    MAX_RESPONSE_BODY_CHARS, NewEpisode, cap_response_body, snapshot_payload,
};
use payhook_engine::log_store::DeliveryLogStore;

use crate::backoff::FastRetryBackoff;
use crate::localize::{describe_status, describe_transport_error};
use crate::realtime::{EpisodeBroadcaster, EpisodeEvent};

/// Bytes read from a receiver body; enough for the stored character cap.
const RESPONSE_BODY_BUDGET: usize = MAX_RESPONSE_BODY_CHARS * 4;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Per-attempt receiver timeout
    pub timeout: Duration,
    pub user_agent: String,
    pub backoff: FastRetryBackoff,
    /// Fast-retry budget used by producers that don't pass their own
    pub max_attempts: u32,
}

impl DispatcherConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.webhook_timeout_secs),
            user_agent: config.webhook_user_agent.clone(),
            backoff: FastRetryBackoff::new(Duration::from_secs(config.webhook_backoff_unit_secs)),
            max_attempts: config.webhook_max_attempts,
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: "Payhook/1.0".to_string(),
            backoff: FastRetryBackoff::default(),
            max_attempts: 5,
        }
    }
}

/// Result of one delivery episode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryOutcome {
    pub success: bool,
    /// Attempts actually made
    pub attempts: u32,
    /// Last HTTP status received, if any
    pub status_code: Option<u16>,
    /// Localized description of the last failure
    pub error: Option<String>,
    /// `None` when the episode row could not be created
    pub episode_id: Option<Uuid>,
    /// The final failure was a 4xx; no tier should retry it
    pub permanent: bool,
}

pub struct WebhookDispatcher {
    client: Client,
    log_store: Arc<dyn DeliveryLogStore>,
    broadcaster: Arc<dyn EpisodeBroadcaster>,
    config: DispatcherConfig,
}

impl WebhookDispatcher {
    pub fn new(
        log_store: Arc<dyn DeliveryLogStore>,
        broadcaster: Arc<dyn EpisodeBroadcaster>,
        config: DispatcherConfig,
    ) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            log_store,
            broadcaster,
            config,
        })
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Deliver `payload` to an already validated `url`, retrying transient
    /// failures up to `max_attempts` times (0 is treated as 1).
    pub async fn deliver(
        &self,
        url: &str,
        payload: &serde_json::Value,
        max_attempts: u32,
        meta: &DeliveryMeta,
    ) -> DeliveryOutcome {
        let max_attempts = max_attempts.max(1);
        let episode_id = self.open_episode(url, payload, meta).await;

        let mut outcome = DeliveryOutcome {
            success: false,
            attempts: 0,
            status_code: None,
            error: None,
            episode_id,
            permanent: false,
        };

        for attempt_number in 1..=max_attempts {
            let attempt = self.send_once(url, payload, attempt_number).await;

            outcome.attempts = attempt_number;
            if attempt.status_code.is_some() {
                outcome.status_code = attempt.status_code;
            }
            outcome.error = attempt.error_message.clone();
            let success = attempt.success;
            let status_code = attempt.status_code;

            self.record_attempt(episode_id, attempt).await;

            if success {
                outcome.success = true;
                tracing::info!(
                    episode_id = ?episode_id,
                    user_id = %meta.user_id,
                    attempt = attempt_number,
                    status_code = ?status_code,
                    "Webhook delivered"
                );
                break;
            }

            tracing::warn!(
                episode_id = ?episode_id,
                user_id = %meta.user_id,
                attempt = attempt_number,
                max_attempts,
                status_code = ?status_code,
                error = outcome.error.as_deref().unwrap_or_default(),
                "Webhook attempt failed"
            );

            if status_code.is_some_and(|c| (400..500).contains(&c)) {
                outcome.permanent = true;
                break;
            }

            if attempt_number < max_attempts {
                self.mark_retrying(episode_id).await;
                tokio::time::sleep(self.config.backoff.delay_after(attempt_number)).await;
            }
        }

        self.close_episode(
            episode_id,
            EpisodeCompletion {
                success: outcome.success,
                final_status_code: outcome.status_code,
                error_message: if outcome.success {
                    None
                } else {
                    outcome.error.clone()
                },
            },
        )
        .await;

        if !outcome.success {
            tracing::error!(
                episode_id = ?episode_id,
                user_id = %meta.user_id,
                attempts = outcome.attempts,
                permanent = outcome.permanent,
                "Webhook delivery failed"
            );
        }

        outcome
    }

    async fn send_once(
        &self,
        url: &str,
        payload: &serde_json::Value,
        attempt_number: u32,
    ) -> AttemptRecord {
        let requested_at = Utc::now();
        let start = Instant::now();

        let result = self.client.post(url).json(payload).send().await;

        let (success, status_code, error_message, response_body) = match result {
            Ok(response) => {
                let status = response.status();
                let body = read_body_prefix(response, RESPONSE_BODY_BUDGET).await;
                let error = (!status.is_success()).then(|| describe_status(status));
                (
                    status.is_success(),
                    Some(status.as_u16()),
                    error,
                    Some(cap_response_body(&body)),
                )
            }
            Err(e) => (false, None, Some(describe_transport_error(&e)), None),
        };

        AttemptRecord {
            attempt_number,
            success,
            status_code,
            error_message,
            response_body,
            requested_at,
            completed_at: Utc::now(),
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }

    async fn open_episode(
        &self,
        url: &str,
        payload: &serde_json::Value,
        meta: &DeliveryMeta,
    ) -> Option<Uuid> {
        let fields = NewEpisode {
            webhook_url: url.to_string(),
            payload: snapshot_payload(payload),
            meta: meta.clone(),
        };

        match self.log_store.create(fields).await {
            Ok(episode) => {
                self.notify(EpisodeEvent::New, &episode);
                Some(episode.id)
            }
            Err(e) => {
                tracing::error!(
                    user_id = %meta.user_id,
                    error = %e,
                    "Failed to create delivery episode, delivering without log"
                );
                None
            }
        }
    }

    async fn record_attempt(&self, episode_id: Option<Uuid>, attempt: AttemptRecord) {
        let Some(id) = episode_id else { return };
        let attempt_number = attempt.attempt_number;
        match self.log_store.append_attempt(id, attempt).await {
            Ok(episode) => self.notify(EpisodeEvent::Update, &episode),
            Err(e) => tracing::error!(
                episode_id = %id,
                attempt = attempt_number,
                error = %e,
                "Failed to record delivery attempt"
            ),
        }
    }

    async fn mark_retrying(&self, episode_id: Option<Uuid>) {
        let Some(id) = episode_id else { return };
        match self.log_store.set_status(id, EpisodeStatus::Retrying).await {
            Ok(episode) => self.notify(EpisodeEvent::Update, &episode),
            Err(e) => tracing::error!(episode_id = %id, error = %e, "Failed to mark episode retrying"),
        }
    }

    async fn close_episode(&self, episode_id: Option<Uuid>, completion: EpisodeCompletion) {
        let Some(id) = episode_id else { return };
        match self.log_store.mark_completed(id, completion).await {
            Ok(episode) => self.notify(EpisodeEvent::Update, &episode),
            Err(e) => tracing::error!(episode_id = %id, error = %e, "Failed to complete episode"),
        }
    }

    fn notify(&self, event: EpisodeEvent, episode: &DeliveryEpisode) {
        if let Err(e) = self.broadcaster.broadcast(event, episode) {
            tracing::warn!(episode_id = %episode.id, error = %e, "Realtime broadcast failed");
        }
    }
}

/// Read at most `budget` bytes of the body and drop the rest unread.
async fn read_body_prefix(mut response: reqwest::Response, budget: usize) -> String {
    let mut buf: Vec<u8> = Vec::new();
    while buf.len() < budget {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                let take = chunk.len().min(budget - buf.len());
                buf.extend_from_slice(&chunk[..take]);
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(error = %e, "Failed to read webhook response body");
                break;
            }
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}
