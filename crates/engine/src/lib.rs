//! Payhook engine: endpoint validation, signatures, persistence and rate limits.

pub mod dlq_store;
pub mod log_store;
pub mod rate_limiter;
pub mod signature;
pub mod validator;
