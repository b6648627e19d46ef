//! Slow-retry sweeper for the dead-letter queue.
//!
//! Each sweep picks a bounded batch of due entries and retries them one at a
//! time with a single-attempt delivery. Sweeps run on a fixed interval, the
//! first one immediately at startup.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::MissedTickBehavior;

use payhook_common::config::AppConfig;
use payhook_common::error::AppError;
use payhook_common::types::{DlqEntry, DlqRetryUpdate, DlqStatus};
use payhook_engine::dlq_store::DlqStore;

use crate::dispatcher::WebhookDispatcher;

/// Shortest period `run` will tick at; `tokio::time::interval` panics on zero.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct DlqProcessorConfig {
    pub interval: Duration,
    pub batch_size: i64,
    pub retention_days: i64,
}

impl DlqProcessorConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            interval: Duration::from_secs(config.dlq_sweep_interval_secs),
            batch_size: config.dlq_batch_size,
            retention_days: config.dlq_retention_days,
        }
    }
}

impl Default for DlqProcessorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30 * 60),
            batch_size: 10,
            retention_days: 30,
        }
    }
}

/// Counts from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub picked: usize,
    pub resolved: usize,
    pub failed: usize,
    pub rescheduled: usize,
    pub purged: u64,
}

enum RetryResult {
    Resolved,
    Failed,
    Rescheduled,
    Skipped,
}

pub struct DlqProcessor {
    store: Arc<dyn DlqStore>,
    dispatcher: Arc<WebhookDispatcher>,
    config: DlqProcessorConfig,
}

impl DlqProcessor {
    pub fn new(
        store: Arc<dyn DlqStore>,
        dispatcher: Arc<WebhookDispatcher>,
        config: DlqProcessorConfig,
    ) -> Self {
        Self {
            store,
            dispatcher,
            config,
        }
    }

    /// Sweep forever. The next tick waits for the current sweep to finish.
    pub async fn run(&self) {
        let period = self.config.interval.max(MIN_SWEEP_INTERVAL);
        if period != self.config.interval {
            tracing::warn!(
                configured_ms = self.config.interval.as_millis() as u64,
                "DLQ sweep interval too short, using the minimum"
            );
        }
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            interval_secs = period.as_secs(),
            batch_size = self.config.batch_size,
            "DLQ processor started"
        );

        loop {
            ticker.tick().await;
            match self.sweep().await {
                Ok(report) if report.picked > 0 || report.purged > 0 => {
                    tracing::info!(
                        picked = report.picked,
                        resolved = report.resolved,
                        failed = report.failed,
                        rescheduled = report.rescheduled,
                        purged = report.purged,
                        "DLQ sweep finished"
                    );
                }
                Ok(_) => tracing::debug!("DLQ sweep found nothing due"),
                Err(e) => tracing::error!(error = %e, "DLQ sweep failed"),
            }
        }
    }

    /// Retry every due entry in one batch, then purge stale terminal entries.
    pub async fn sweep(&self) -> Result<SweepReport, AppError> {
        let due = self.store.get_pending_retries(self.config.batch_size).await?;
        let mut report = SweepReport {
            picked: due.len(),
            ..SweepReport::default()
        };

        for entry in &due {
            match self.retry(entry).await {
                RetryResult::Resolved => report.resolved += 1,
                RetryResult::Failed => report.failed += 1,
                RetryResult::Rescheduled => report.rescheduled += 1,
                RetryResult::Skipped => {}
            }
        }

        report.purged = match self.store.delete_old_entries(self.config.retention_days).await {
            Ok(purged) => purged,
            Err(e) => {
                tracing::error!(error = %e, "Failed to purge old DLQ entries");
                0
            }
        };

        Ok(report)
    }

    async fn retry(&self, entry: &DlqEntry) -> RetryResult {
        let retry_count = entry.retry_count + 1;

        if let Err(e) = self
            .store
            .update_after_retry(
                entry.id,
                DlqRetryUpdate {
                    status: DlqStatus::Retrying,
                    retry_count,
                    error: None,
                },
            )
            .await
        {
            tracing::error!(dlq_id = %entry.id, error = %e, "Failed to claim DLQ entry");
            return RetryResult::Skipped;
        }

        let outcome = self
            .dispatcher
            .deliver(&entry.webhook_url, &entry.payload, 1, &entry.meta())
            .await;

        let result = if outcome.success {
            self.store.mark_resolved(entry.id).await.map(|_| RetryResult::Resolved)
        } else if outcome.permanent || retry_count >= entry.max_retries {
            self.store
                .mark_failed(entry.id, outcome.error.clone())
                .await
                .map(|_| RetryResult::Failed)
        } else {
            self.store
                .update_after_retry(
                    entry.id,
                    DlqRetryUpdate {
                        status: DlqStatus::Pending,
                        retry_count,
                        error: outcome.error.clone(),
                    },
                )
                .await
                .map(|_| RetryResult::Rescheduled)
        };

        match result {
            Ok(result) => {
                tracing::info!(
                    dlq_id = %entry.id,
                    retry = retry_count,
                    max_retries = entry.max_retries,
                    success = outcome.success,
                    "DLQ retry finished"
                );
                result
            }
            Err(e) => {
                tracing::error!(dlq_id = %entry.id, error = %e, "Failed to record DLQ retry result");
                RetryResult::Skipped
            }
        }
    }
}
