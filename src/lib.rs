//! Quotaflow - Rate-Limited Event Pipeline
//!
//! Events are published to a partitioned stream keyed by entity id. A consumer
//! group checks every event against a per-entity sliding-window quota kept in a
//! shared ordered-set store, delivers the admitted ones and redirects the rest
//! to a dead-letter stream, which a second, independent group audits.

pub mod config;
pub mod error;
pub mod event;
pub mod ingress;
pub mod pipeline;
pub mod ratelimit;
pub mod telemetry;
pub mod transport;
