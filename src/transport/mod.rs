//! Partitioned log transport ports.
//!
//! The pipeline only talks to the log through [`Transport`] and
//! [`Subscription`]; each hosting environment supplies a binding:
//! - [`MemoryTransport`]: in-process log with consumer groups, used by tests and demos.
//! - `KafkaTransport` (feature `kafka`): rdkafka producer and consumer.
//!
//! Subscriptions are manual-commit only. A committed offset means "every record
//! up to and including this one has been handled".

mod memory;
mod router;

#[cfg(feature = "kafka")]
mod kafka;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::{MemorySubscription, MemoryTransport};
pub use router::{murmur2, PartitionRouter};

#[cfg(feature = "kafka")]
pub use kafka::{KafkaSubscription, KafkaTransport};

/// Errors raised by a transport binding.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport unavailable: {0}")]
    Unavailable(String),
    #[error("unknown stream {0}")]
    UnknownStream(String),
    #[error("partition {partition} of {stream} is not assigned to this member")]
    NotAssigned { stream: String, partition: u32 },
    #[error("subscription closed")]
    Closed,
    #[error("transport backend error: {0}")]
    Backend(String),
}

/// A record read from a stream partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub stream: String,
    pub partition: u32,
    pub offset: u64,
    pub key: String,
    pub payload: Vec<u8>,
}

/// Where a published record landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordPosition {
    pub partition: u32,
    pub offset: u64,
}

/// Producer and subscription factory for a partitioned log.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Append `payload` to `stream`, placing it by `key`.
    async fn publish(
        &self,
        stream: &str,
        key: &str,
        payload: Vec<u8>,
    ) -> Result<RecordPosition, TransportError>;

    /// Join consumer group `group` on `stream`.
    async fn subscribe(
        &self,
        stream: &str,
        group: &str,
    ) -> Result<Box<dyn Subscription>, TransportError>;
}

/// One member of a consumer group.
///
/// Partitions are fetched independently so that each owned partition can be
/// driven by its own sequential loop.
#[async_trait]
pub trait Subscription: Send + Sync {
    /// Wait until the owned partitions differ from `current`.
    ///
    /// Returns `None` once the subscription is closed.
    async fn next_assignment(&self, current: &[u32]) -> Result<Option<Vec<u32>>, TransportError>;

    /// Next record of `partition` in offset order.
    ///
    /// Returns `None` when the partition is no longer owned or the subscription closed.
    async fn fetch(&self, partition: u32) -> Result<Option<Record>, TransportError>;

    /// Mark every record of `partition` up to `offset` as handled.
    async fn commit(&self, partition: u32, offset: u64) -> Result<(), TransportError>;

    /// Move the fetch position of `partition` back to its committed offset.
    async fn rewind(&self, partition: u32) -> Result<(), TransportError>;

    /// Leave the group and release every owned partition.
    async fn close(&self);
}
