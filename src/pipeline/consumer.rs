//! Primary consumer: rate-limit gate with dead-letter redirect.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use super::delivery::Deliverer;
use super::producer::EventProducer;
use super::runner::{ConsumerStats, RecordHandler};
use crate::error::Result;
use crate::event::Event;
use crate::ratelimit::{Decision, SlidingWindowLimiter};
use crate::transport::Record;

/// Why an event was redirected to the dead-letter stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// The entity already had `in_window` events admitted in the current window.
    QuotaExceeded { in_window: u64 },
    /// The limiter store failed or timed out.
    LimiterUnavailable,
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyReason::QuotaExceeded { .. } => f.write_str("quota_exceeded"),
            DenyReason::LimiterUnavailable => f.write_str("limiter_unavailable"),
        }
    }
}

/// Terminal state of one primary record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Delivered,
    DeadLettered(DenyReason),
    /// Payload was not a valid event and was forwarded unchanged.
    Undecodable,
}

/// Handles records of the primary stream.
///
/// Every record ends up exactly one of delivered, dead-lettered or forwarded
/// as undecodable before it is acknowledged. Store failures count as denials.
pub struct NotificationHandler {
    limiter: Arc<SlidingWindowLimiter>,
    producer: Arc<EventProducer>,
    deliverer: Arc<dyn Deliverer>,
    stats: Arc<ConsumerStats>,
}

impl NotificationHandler {
    pub fn new(
        limiter: Arc<SlidingWindowLimiter>,
        producer: Arc<EventProducer>,
        deliverer: Arc<dyn Deliverer>,
    ) -> Self {
        Self {
            limiter,
            producer,
            deliverer,
            stats: ConsumerStats::new(),
        }
    }

    /// Run one record through decode, limiter and delivery or redirect.
    ///
    /// An error means the record must not be acknowledged.
    pub async fn process(&self, record: &Record) -> Result<Outcome> {
        let event = match Event::decode(&record.payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(
                    partition = record.partition,
                    offset = record.offset,
                    key = %record.key,
                    error = %e,
                    "Undecodable record, forwarding to dead-letter stream"
                );
                self.producer.forward_undecodable(record).await?;
                return Ok(Outcome::Undecodable);
            }
        };

        info!(
            entity_id = %event.entity_id(),
            kind = %event.kind(),
            partition = record.partition,
            offset = record.offset,
            "Received event"
        );

        let denied = match self.limiter.check(event.entity_id()).await {
            Ok(Decision::Allowed { .. }) => None,
            Ok(Decision::Denied { in_window }) => Some(DenyReason::QuotaExceeded { in_window }),
            Err(e) => {
                warn!(entity_id = %event.entity_id(), error = %e, "Rate limiter unavailable, failing closed");
                Some(DenyReason::LimiterUnavailable)
            }
        };

        match denied {
            None => {
                self.deliverer.deliver(&event).await?;
                Ok(Outcome::Delivered)
            }
            Some(reason) => {
                warn!(
                    entity_id = %event.entity_id(),
                    reason = %reason,
                    "Event denied, redirecting to dead-letter stream"
                );
                let position = self.producer.publish_dead_letter(&event).await?;
                info!(
                    entity_id = %event.entity_id(),
                    partition = position.partition,
                    offset = position.offset,
                    "Event dead-lettered"
                );
                Ok(Outcome::DeadLettered(reason))
            }
        }
    }
}

#[async_trait]
impl RecordHandler for NotificationHandler {
    async fn handle(&self, record: &Record) -> Result<()> {
        match self.process(record).await? {
            Outcome::Delivered => self.stats.record_delivered(),
            Outcome::DeadLettered(_) => self.stats.record_dead_lettered(),
            Outcome::Undecodable => self.stats.record_undecodable(),
        }
        Ok(())
    }

    fn stats(&self) -> &Arc<ConsumerStats> {
        &self.stats
    }
}
