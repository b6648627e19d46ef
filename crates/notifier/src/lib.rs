//! Outbound webhook delivery: fast retries, dead-letter slow retries and
//! realtime episode push.

pub mod backoff;
pub mod dispatcher;
pub mod dlq_processor;
pub mod localize;
pub mod pipeline;
pub mod realtime;
