use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

/// Serialized payload snapshots above this size are replaced by a preview.
pub const MAX_PAYLOAD_SNAPSHOT_BYTES: usize = 10_000;

/// Receiver response bodies are cut to this many characters before storage.
pub const MAX_RESPONSE_BODY_CHARS: usize = 1_000;

/// Status of a delivery episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum EpisodeStatus {
    Pending,
    Retrying,
    Success,
    Failed,
}

impl EpisodeStatus {
    /// `success` and `failed` admit no further automatic transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, EpisodeStatus::Success | EpisodeStatus::Failed)
    }
}

impl std::fmt::Display for EpisodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EpisodeStatus::Pending => write!(f, "pending"),
            EpisodeStatus::Retrying => write!(f, "retrying"),
            EpisodeStatus::Success => write!(f, "success"),
            EpisodeStatus::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for EpisodeStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(EpisodeStatus::Pending),
            "retrying" => Ok(EpisodeStatus::Retrying),
            "success" => Ok(EpisodeStatus::Success),
            "failed" => Ok(EpisodeStatus::Failed),
            other => Err(AppError::Validation(format!(
                "Invalid status '{}'. Valid values: pending, retrying, success, failed",
                other
            ))),
        }
    }
}

/// Status of a dead-letter queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum DlqStatus {
    Pending,
    Retrying,
    Failed,
    Resolved,
}

impl DlqStatus {
    /// `resolved` and `failed` entries are frozen until purged.
    pub fn is_terminal(self) -> bool {
        matches!(self, DlqStatus::Resolved | DlqStatus::Failed)
    }
}

impl std::fmt::Display for DlqStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DlqStatus::Pending => write!(f, "pending"),
            DlqStatus::Retrying => write!(f, "retrying"),
            DlqStatus::Failed => write!(f, "failed"),
            DlqStatus::Resolved => write!(f, "resolved"),
        }
    }
}

impl FromStr for DlqStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DlqStatus::Pending),
            "retrying" => Ok(DlqStatus::Retrying),
            "failed" => Ok(DlqStatus::Failed),
            "resolved" => Ok(DlqStatus::Resolved),
            other => Err(AppError::Validation(format!(
                "Invalid status '{}'. Valid values: pending, retrying, failed, resolved",
                other
            ))),
        }
    }
}

/// Dashboard role carried in the JWT. Admins observe every user's episodes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    #[default]
    User,
    Admin,
}

impl std::fmt::Display for UserRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UserRole::User => write!(f, "user"),
            UserRole::Admin => write!(f, "admin"),
        }
    }
}

/// Correlation metadata a producer attaches to a delivery.
///
/// Only `user_id` is mandatory; the rest ties the episode back to the email
/// configuration and transaction document that triggered it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeliveryMeta {
    pub user_id: Uuid,
    pub user_email: Option<String>,
    pub email_config_id: Option<String>,
    pub email_config_email: Option<String>,
    pub transaction_doc_id: Option<String>,
    pub transaction_id: Option<String>,
}

impl DeliveryMeta {
    pub fn for_user(user_id: Uuid) -> Self {
        Self {
            user_id,
            ..Self::default()
        }
    }
}

/// One HTTP attempt inside an episode. Never mutated once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 1-based, monotonic within the episode
    pub attempt_number: u32,
    pub success: bool,
    /// `None` when no HTTP response was received (timeout, DNS, refused)
    pub status_code: Option<u16>,
    /// Localized failure description
    pub error_message: Option<String>,
    /// Receiver body, cut to `MAX_RESPONSE_BODY_CHARS`
    pub response_body: Option<String>,
    pub requested_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// One logical delivery of a single outbound event and its attempt history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryEpisode {
    pub id: Uuid,
    pub user_id: Uuid,
    pub user_email: Option<String>,
    pub webhook_url: String,
    pub email_config_id: Option<String>,
    pub email_config_email: Option<String>,
    pub transaction_doc_id: Option<String>,
    pub transaction_id: Option<String>,
    pub payload: serde_json::Value,
    pub status: EpisodeStatus,
    pub attempts: Vec<AttemptRecord>,
    pub total_attempts: u32,
    pub last_error: Option<String>,
    pub final_status_code: Option<u16>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeliveryEpisode {
    /// Build a fresh `pending` episode with no attempts.
    pub fn new(fields: NewEpisode, now: DateTime<Utc>) -> Self {
        let NewEpisode {
            webhook_url,
            payload,
            meta,
        } = fields;

        Self {
            id: Uuid::new_v4(),
            user_id: meta.user_id,
            user_email: meta.user_email,
            webhook_url,
            email_config_id: meta.email_config_id,
            email_config_email: meta.email_config_email,
            transaction_doc_id: meta.transaction_doc_id,
            transaction_id: meta.transaction_id,
            payload,
            status: EpisodeStatus::Pending,
            attempts: Vec::new(),
            total_attempts: 0,
            last_error: None,
            final_status_code: None,
            last_attempt_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Append an attempt and refresh the cached summary fields.
    pub fn record_attempt(&mut self, attempt: AttemptRecord) {
        self.last_attempt_at = Some(attempt.completed_at);
        if let Some(error) = &attempt.error_message {
            self.last_error = Some(error.clone());
        }
        if attempt.status_code.is_some() {
            self.final_status_code = attempt.status_code;
        }
        self.updated_at = attempt.completed_at;
        self.attempts.push(attempt);
        self.total_attempts = self.attempts.len() as u32;
    }

    /// Apply the terminal write.
    pub fn complete(&mut self, completion: &EpisodeCompletion, now: DateTime<Utc>) {
        self.status = if completion.success {
            EpisodeStatus::Success
        } else {
            EpisodeStatus::Failed
        };
        if completion.final_status_code.is_some() {
            self.final_status_code = completion.final_status_code;
        }
        if completion.error_message.is_some() {
            self.last_error = completion.error_message.clone();
        }
        self.completed_at = Some(now);
        self.updated_at = now;
    }
}

/// Fields required to open a delivery episode.
#[derive(Debug, Clone)]
pub struct NewEpisode {
    pub webhook_url: String,
    /// Already size-capped via [`snapshot_payload`]
    pub payload: serde_json::Value,
    pub meta: DeliveryMeta,
}

/// Terminal result written by `mark_completed`.
#[derive(Debug, Clone, PartialEq)]
pub struct EpisodeCompletion {
    pub success: bool,
    pub final_status_code: Option<u16>,
    pub error_message: Option<String>,
}

/// Ordering for episode listings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Desc,
    Asc,
}

/// Dashboard filter for episode listings.
#[derive(Debug, Clone, Default)]
pub struct EpisodeFilter {
    pub user_id: Option<Uuid>,
    pub status: Option<EpisodeStatus>,
    pub transaction_id: Option<String>,
}

/// Dashboard filter for DLQ listings.
#[derive(Debug, Clone, Default)]
pub struct DlqFilter {
    pub user_id: Option<Uuid>,
    pub status: Option<DlqStatus>,
}

/// Requested page, normalised through [`PageRequest::clamped`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u32,
    pub limit: u32,
}

impl PageRequest {
    pub const DEFAULT_LIMIT: u32 = 20;
    pub const MAX_LIMIT: u32 = 100;

    /// Page starts at 1; limit is clamped to `[1, 100]`.
    pub fn clamped(page: Option<u32>, limit: Option<u32>) -> Self {
        Self {
            page: page.unwrap_or(1).max(1),
            limit: limit
                .unwrap_or(Self::DEFAULT_LIMIT)
                .clamp(1, Self::MAX_LIMIT),
        }
    }

    pub fn offset(&self) -> i64 {
        (self.page as i64 - 1) * self.limit as i64
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::clamped(None, None)
    }
}

/// Pagination block returned alongside list results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub page: u32,
    pub limit: u32,
    pub total: i64,
    pub total_pages: i64,
}

impl Pagination {
    pub fn new(request: PageRequest, total: i64) -> Self {
        let limit = request.limit as i64;
        Self {
            page: request.page,
            limit: request.limit,
            total,
            total_pages: (total + limit - 1) / limit,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodePage {
    pub episodes: Vec<DeliveryEpisode>,
    pub pagination: Pagination,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqPage {
    pub entries: Vec<DlqEntry>,
    pub pagination: Pagination,
}

/// An episode that exhausted its fast retries, waiting for slow retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct DlqEntry {
    pub id: Uuid,
    /// Back-reference to the originating episode (not ownership)
    pub webhook_log_id: Option<Uuid>,
    pub user_id: Uuid,
    pub user_email: Option<String>,
    pub webhook_url: String,
    pub email_config_id: Option<String>,
    pub email_config_email: Option<String>,
    pub transaction_doc_id: Option<String>,
    pub transaction_id: Option<String>,
    /// Full payload, resent verbatim
    pub payload: serde_json::Value,
    pub status: DlqStatus,
    pub retry_count: i32,
    pub max_retries: i32,
    pub last_error: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl DlqEntry {
    /// Rebuild the producer metadata stored alongside the entry.
    pub fn meta(&self) -> DeliveryMeta {
        DeliveryMeta {
            user_id: self.user_id,
            user_email: self.user_email.clone(),
            email_config_id: self.email_config_id.clone(),
            email_config_email: self.email_config_email.clone(),
            transaction_doc_id: self.transaction_doc_id.clone(),
            transaction_id: self.transaction_id.clone(),
        }
    }
}

/// Fields required to enqueue a DLQ entry.
#[derive(Debug, Clone)]
pub struct NewDlqEntry {
    pub webhook_log_id: Option<Uuid>,
    pub webhook_url: String,
    pub payload: serde_json::Value,
    pub meta: DeliveryMeta,
    pub last_error: Option<String>,
    pub max_retries: i32,
}

/// Status change written after (or before) a slow retry.
#[derive(Debug, Clone, PartialEq)]
pub struct DlqRetryUpdate {
    pub status: DlqStatus,
    pub retry_count: i32,
    pub error: Option<String>,
}

/// Cap a payload for storage in the episode log.
///
/// Payloads whose serialized form exceeds `MAX_PAYLOAD_SNAPSHOT_BYTES` are
/// replaced by a marker object carrying the original size and a preview. The
/// serialized marker itself stays within the cap.
pub fn snapshot_payload(payload: &serde_json::Value) -> serde_json::Value {
    let serialized = payload.to_string();
    if serialized.len() <= MAX_PAYLOAD_SNAPSHOT_BYTES {
        return payload.clone();
    }

    // The preview is re-escaped inside the marker, so shrink until it fits.
    let mut budget = MAX_PAYLOAD_SNAPSHOT_BYTES;
    loop {
        let marker = serde_json::json!({
            "truncated": true,
            "original_size": serialized.len(),
            "preview": truncate_at_char_boundary(&serialized, budget),
        });
        let size = marker.to_string().len();
        if size <= MAX_PAYLOAD_SNAPSHOT_BYTES || budget == 0 {
            return marker;
        }
        budget = budget.saturating_sub(size - MAX_PAYLOAD_SNAPSHOT_BYTES);
    }
}

/// Cut a receiver body to `MAX_RESPONSE_BODY_CHARS` characters.
pub fn cap_response_body(body: &str) -> String {
    body.chars().take(MAX_RESPONSE_BODY_CHARS).collect()
}

fn truncate_at_char_boundary(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attempt(n: u32, status_code: Option<u16>, error: Option<&str>) -> AttemptRecord {
        let now = Utc::now();
        AttemptRecord {
            attempt_number: n,
            success: error.is_none(),
            status_code,
            error_message: error.map(str::to_string),
            response_body: None,
            requested_at: now,
            completed_at: now,
            duration_ms: 12,
        }
    }

    fn episode() -> DeliveryEpisode {
        DeliveryEpisode::new(
            NewEpisode {
                webhook_url: "https://hooks.example.com/tx".to_string(),
                payload: serde_json::json!({"event": "transaction.created"}),
                meta: DeliveryMeta::for_user(Uuid::new_v4()),
            },
            Utc::now(),
        )
    }

    #[test]
    fn test_new_episode_is_pending_and_empty() {
        let ep = episode();
        assert_eq!(ep.status, EpisodeStatus::Pending);
        assert!(ep.attempts.is_empty());
        assert_eq!(ep.total_attempts, 0);
        assert!(ep.completed_at.is_none());
    }

    #[test]
    fn test_record_attempt_refreshes_summary() {
        let mut ep = episode();
        ep.record_attempt(attempt(1, None, Some("timeout")));
        ep.record_attempt(attempt(2, Some(503), Some("HTTP 503")));

        assert_eq!(ep.total_attempts, 2);
        assert_eq!(ep.attempts.len() as u32, ep.total_attempts);
        assert_eq!(ep.last_error.as_deref(), Some("HTTP 503"));
        assert_eq!(ep.final_status_code, Some(503));
        assert!(ep.last_attempt_at.is_some());
        for (i, a) in ep.attempts.iter().enumerate() {
            assert_eq!(a.attempt_number as usize, i + 1);
        }
    }

    #[test]
    fn test_network_failure_keeps_previous_status_code() {
        let mut ep = episode();
        ep.record_attempt(attempt(1, Some(502), Some("HTTP 502")));
        ep.record_attempt(attempt(2, None, Some("refused")));
        assert_eq!(ep.final_status_code, Some(502));
        assert_eq!(ep.last_error.as_deref(), Some("refused"));
    }

    #[test]
    fn test_complete_sets_terminal_status() {
        let mut ep = episode();
        ep.record_attempt(attempt(1, Some(200), None));
        ep.complete(
            &EpisodeCompletion {
                success: true,
                final_status_code: Some(200),
                error_message: None,
            },
            Utc::now(),
        );
        assert_eq!(ep.status, EpisodeStatus::Success);
        assert!(ep.status.is_terminal());
        assert!(ep.completed_at.is_some());
    }

    #[test]
    fn test_page_request_clamping() {
        assert_eq!(PageRequest::clamped(None, None), PageRequest { page: 1, limit: 20 });
        assert_eq!(PageRequest::clamped(Some(0), Some(0)), PageRequest { page: 1, limit: 1 });
        assert_eq!(PageRequest::clamped(Some(3), Some(500)), PageRequest { page: 3, limit: 100 });
        assert_eq!(PageRequest::clamped(Some(3), Some(25)).offset(), 50);
    }

    #[test]
    fn test_pagination_total_pages() {
        let request = PageRequest::clamped(Some(1), Some(20));
        assert_eq!(Pagination::new(request, 0).total_pages, 0);
        assert_eq!(Pagination::new(request, 20).total_pages, 1);
        assert_eq!(Pagination::new(request, 21).total_pages, 2);
    }

    #[test]
    fn test_status_round_trip_through_strings() {
        for status in [
            EpisodeStatus::Pending,
            EpisodeStatus::Retrying,
            EpisodeStatus::Success,
            EpisodeStatus::Failed,
        ] {
            assert_eq!(status.to_string().parse::<EpisodeStatus>().unwrap(), status);
        }
        assert!("done".parse::<DlqStatus>().is_err());
    }

    #[test]
    fn test_snapshot_payload_small_is_unchanged() {
        let payload = serde_json::json!({"orderId": "A1", "amount": 150000});
        assert_eq!(snapshot_payload(&payload), payload);
    }

    #[test]
    fn test_snapshot_payload_large_is_truncated() {
        let payload = serde_json::json!({"blob": "é".repeat(MAX_PAYLOAD_SNAPSHOT_BYTES)});
        let snapshot = snapshot_payload(&payload);
        assert_eq!(snapshot["truncated"], true);
        assert!(snapshot["original_size"].as_u64().unwrap() > MAX_PAYLOAD_SNAPSHOT_BYTES as u64);
        assert!(snapshot.to_string().len() <= MAX_PAYLOAD_SNAPSHOT_BYTES);
    }

    #[test]
    fn test_snapshot_marker_fits_cap_with_escaped_preview() {
        // Nested JSON strings double up on escapes once embedded in the preview.
        let items: Vec<String> = (0..2_000).map(|i| format!("\"tx-{i}\"")).collect();
        let payload = serde_json::json!({ "items": items });
        assert!(payload.to_string().len() > MAX_PAYLOAD_SNAPSHOT_BYTES);

        let snapshot = snapshot_payload(&payload);
        assert_eq!(snapshot["truncated"], true);
        assert_eq!(
            snapshot["original_size"].as_u64().unwrap(),
            payload.to_string().len() as u64
        );
        assert!(snapshot.to_string().len() <= MAX_PAYLOAD_SNAPSHOT_BYTES);
        assert!(!snapshot["preview"].as_str().unwrap().is_empty());
    }

    #[test]
    fn test_cap_response_body() {
        let body = "x".repeat(MAX_RESPONSE_BODY_CHARS + 50);
        assert_eq!(cap_response_body(&body).len(), MAX_RESPONSE_BODY_CHARS);
        assert_eq!(cap_response_body("ok"), "ok");
    }
}
