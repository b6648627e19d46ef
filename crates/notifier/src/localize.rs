//! User-facing (Vietnamese) descriptions of delivery failures.
//!
//! Transport errors are matched by lowercase substring against the full error
//! source chain; the first matching phrase wins. Unmapped errors pass through
//! verbatim.

use std::error::Error as StdError;

use reqwest::StatusCode;

/// The receiver timeout is configurable, so the message names no duration.
pub const TIMEOUT_MESSAGE: &str = "Hết thời gian chờ phản hồi từ máy chủ";

const PHRASES: &[(&str, &str)] = &[
    ("timed out", TIMEOUT_MESSAGE),
    ("timeout", TIMEOUT_MESSAGE),
    ("connection refused", "Máy chủ từ chối kết nối"),
    ("dns error", "Không phân giải được tên miền"),
    ("failed to lookup address", "Không phân giải được tên miền"),
    ("certificate", "Chứng chỉ SSL không hợp lệ"),
    ("connection reset", "Kết nối bị đóng đột ngột"),
    ("connection closed", "Kết nối bị đóng đột ngột"),
];

/// Translate a raw error description through the phrase table.
pub fn localize(raw: &str) -> String {
    let lower = raw.to_lowercase();
    PHRASES
        .iter()
        .find(|(needle, _)| lower.contains(needle))
        .map(|(_, phrase)| (*phrase).to_string())
        .unwrap_or_else(|| raw.to_string())
}

/// Describe a transport failure (no HTTP response).
pub fn describe_transport_error(err: &reqwest::Error) -> String {
    if err.is_timeout() {
        return TIMEOUT_MESSAGE.to_string();
    }
    localize(&error_chain(err))
}

/// Describe a non-2xx response, e.g. `HTTP 503 Service Unavailable`.
pub fn describe_status(status: StatusCode) -> String {
    match status.canonical_reason() {
        Some(reason) => format!("HTTP {} {}", status.as_u16(), reason),
        None => format!("HTTP {}", status.as_u16()),
    }
}

fn error_chain(err: &dyn StdError) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        text.push_str(": ");
        text.push_str(&inner.to_string());
        source = inner.source();
    }
    text
}
