//! Inbound request surface: submit events and inspect quotas.
//!
//! Acceptance only means the event reached the primary stream. Whether it is
//! eventually delivered or dead-lettered is decided later by the consumer.

use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::error::{QuotaflowError, Result};
use crate::event::Event;
use crate::pipeline::EventProducer;
use crate::ratelimit::SlidingWindowLimiter;
use crate::transport::RecordPosition;

pub const DEFAULT_BURST_COUNT: u32 = 8;
pub const DEFAULT_BURST_KIND: &str = "PROMOTIONAL";

/// Current window usage for one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaStatus {
    pub entity_id: String,
    pub in_window: u64,
    pub limit: u64,
    pub blocked: bool,
}

#[derive(Debug, Clone)]
pub struct Ingress {
    producer: Arc<EventProducer>,
    limiter: Arc<SlidingWindowLimiter>,
}

impl Ingress {
    pub fn new(producer: Arc<EventProducer>, limiter: Arc<SlidingWindowLimiter>) -> Self {
        Self { producer, limiter }
    }

    /// Validate and publish one event.
    pub async fn submit(&self, entity_id: &str, kind: &str, payload: &str) -> Result<RecordPosition> {
        let event = Event::new(entity_id, kind, payload)?;
        self.producer.publish(&event).await
    }

    /// Publish `count` numbered events for `entity_id`, stopping at the first failure.
    pub async fn burst(&self, entity_id: &str, count: u32, kind: &str) -> Result<Vec<RecordPosition>> {
        if entity_id.trim().is_empty() {
            return Err(QuotaflowError::InvalidEvent("entity_id must not be empty".into()));
        }
        let mut positions = Vec::with_capacity(count as usize);
        for i in 1..=count {
            let payload = format!("Notification #{} - {} for {}", i, kind, entity_id);
            positions.push(self.submit(entity_id, kind, &payload).await?);
        }
        info!(entity_id = %entity_id, count, kind = %kind, "Burst published");
        Ok(positions)
    }

    /// Window usage for `entity_id` without consuming any quota.
    pub async fn quota_status(&self, entity_id: &str) -> Result<QuotaStatus> {
        let in_window = self.limiter.count(entity_id).await?;
        let limit = self.limiter.limit();
        Ok(QuotaStatus {
            entity_id: entity_id.to_string(),
            in_window,
            limit,
            blocked: in_window >= limit,
        })
    }
}
