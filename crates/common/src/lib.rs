//! Shared configuration, persistence helpers, errors and domain types for
//! the Payhook webhook delivery services.

pub mod config;
pub mod db;
pub mod error;
pub mod redis_pool;
pub mod types;
