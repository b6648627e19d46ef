use std::str::FromStr;

use serde::Deserialize;

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string
    pub redis_url: String,

    /// Secret used to verify dashboard JWTs (issued by the auth service)
    pub jwt_secret: String,

    /// `production` disables plain-HTTP localhost webhook endpoints
    pub app_env: String,

    /// Port the dashboard API listens on
    pub http_port: u16,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,

    /// Per-attempt receiver timeout in seconds (default: 10)
    pub webhook_timeout_secs: u64,

    /// Fast-retry budget per delivery episode (default: 5)
    pub webhook_max_attempts: u32,

    /// Multiplier applied to the Fibonacci fast-retry sequence (default: 10s)
    pub webhook_backoff_unit_secs: u64,

    /// User-Agent sent on every outbound webhook
    pub webhook_user_agent: String,

    /// Hourly per-user cap for dashboard test deliveries (default: 100)
    pub webhook_rate_limit_per_hour: u32,

    /// DLQ sweep interval in seconds (default: 1800 = 30 min)
    pub dlq_sweep_interval_secs: u64,

    /// Maximum DLQ entries retried per sweep (default: 10)
    pub dlq_batch_size: i64,

    /// Slow-retry budget for each DLQ entry (default: 3)
    pub dlq_max_retries: i32,

    /// Terminal DLQ entries older than this are purged after a sweep (default: 30)
    pub dlq_retention_days: i64,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable is required"))?,
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            jwt_secret: std::env::var("JWT_SECRET")
                .map_err(|_| anyhow::anyhow!("JWT_SECRET environment variable is required"))?,
            app_env: std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string()),
            http_port: parse_var("HTTP_PORT", 3000)?,
            db_max_connections: parse_var("DB_MAX_CONNECTIONS", 20)?,
            webhook_timeout_secs: parse_secs("WEBHOOK_TIMEOUT_SECS", 10)?,
            webhook_max_attempts: parse_var("WEBHOOK_MAX_ATTEMPTS", 5)?,
            webhook_backoff_unit_secs: parse_var("WEBHOOK_BACKOFF_UNIT_SECS", 10)?,
            webhook_user_agent: std::env::var("WEBHOOK_USER_AGENT")
                .unwrap_or_else(|_| "Payhook/1.0".to_string()),
            webhook_rate_limit_per_hour: parse_var("WEBHOOK_RATE_LIMIT_PER_HOUR", 100)?,
            dlq_sweep_interval_secs: parse_secs("DLQ_SWEEP_INTERVAL_SECS", 1800)?,
            dlq_batch_size: parse_var("DLQ_BATCH_SIZE", 10)?,
            dlq_max_retries: parse_var("DLQ_MAX_RETRIES", 3)?,
            dlq_retention_days: parse_var("DLQ_RETENTION_DAYS", 30)?,
        })
    }

    /// Whether the service runs with production endpoint rules.
    pub fn is_production(&self) -> bool {
        self.app_env.eq_ignore_ascii_case("production")
    }
}

/// Read an optional numeric variable, falling back to `default` when unset.
fn parse_var<T: FromStr>(key: &str, default: T) -> anyhow::Result<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("{} must be a valid {}", key, std::any::type_name::<T>())),
        Err(_) => Ok(default),
    }
}

/// Read a duration in seconds; zero is rejected.
fn parse_secs(key: &str, default: u64) -> anyhow::Result<u64> {
    nonzero(key, parse_var(key, default)?)
}

fn nonzero(key: &str, value: u64) -> anyhow::Result<u64> {
    if value == 0 {
        anyhow::bail!("{} must be greater than zero", key);
    }
    Ok(value)
}
