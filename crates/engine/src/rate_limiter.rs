//! Redis-backed hourly send counter per user.
//!
//! Uses a fixed window keyed by the hour bucket: `INCR` the counter and refresh
//! its TTL in the same transaction so stale buckets expire on their own.

use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use serde::Serialize;
use uuid::Uuid;

use payhook_common::error::AppError;

/// Default sends allowed per user per hour.
pub const DEFAULT_LIMIT_PER_HOUR: u32 = 100;

const WINDOW_SECS: i64 = 3_600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_in_secs: u64,
}

#[derive(Clone)]
pub struct WebhookRateLimiter {
    redis: ConnectionManager,
    limit_per_hour: u32,
}

impl WebhookRateLimiter {
    pub fn new(redis: ConnectionManager, limit_per_hour: u32) -> Self {
        Self {
            redis,
            limit_per_hour,
        }
    }

    /// Count one send for `user_id` and report whether it fits in the window.
    ///
    /// Rejected calls still increment the counter; the window resets at the
    /// top of the next hour regardless.
    pub async fn check_and_increment(&self, user_id: Uuid) -> Result<RateLimitDecision, AppError> {
        let now = Utc::now();
        let key = bucket_key(user_id, now);
        let mut redis = self.redis.clone();

        let (count,): (u64,) = redis::pipe()
            .atomic()
            .cmd("INCR")
            .arg(&key)
            .cmd("EXPIRE")
            .arg(&key)
            .arg(WINDOW_SECS)
            .ignore()
            .query_async(&mut redis)
            .await?;

        let decision = decide(count, self.limit_per_hour, now);
        if !decision.allowed {
            tracing::warn!(
                user_id = %user_id,
                count,
                limit = self.limit_per_hour,
                "Webhook rate limit exceeded"
            );
        }

        Ok(decision)
    }
}

fn bucket_key(user_id: Uuid, now: DateTime<Utc>) -> String {
    format!(
        "webhook:ratelimit:{}:{}",
        user_id,
        now.timestamp().div_euclid(WINDOW_SECS)
    )
}

fn decide(count: u64, limit: u32, now: DateTime<Utc>) -> RateLimitDecision {
    let limit = u64::from(limit);
    let elapsed = now.timestamp().rem_euclid(WINDOW_SECS);
    RateLimitDecision {
        allowed: count <= limit,
        remaining: limit.saturating_sub(count) as u32,
        reset_in_secs: (WINDOW_SECS - elapsed) as u64,
    }
}
