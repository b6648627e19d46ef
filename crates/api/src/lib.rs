//! Payhook dashboard API: delivery logs, DLQ, endpoint tools and realtime push.

pub mod middleware;
pub mod routes;
pub mod state;
