//! Dead-letter consumer: record every redirected event and acknowledge it.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use super::runner::{ConsumerStats, RecordHandler};
use crate::error::Result;
use crate::event::Event;
use crate::transport::Record;

/// Destination for dead-lettered events.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn denied(&self, event: &Event, record: &Record);

    /// A record that never decoded into an event.
    async fn undecodable(&self, record: &Record, reason: &str);
}

/// Audit sink that writes every entry to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAuditSink;

#[async_trait]
impl AuditSink for LogAuditSink {
    async fn denied(&self, event: &Event, record: &Record) {
        warn!(
            entity_id = %event.entity_id(),
            kind = %event.kind(),
            payload = %event.payload(),
            created_at = %event.created_at(),
            partition = record.partition,
            offset = record.offset,
            "Dead-lettered event"
        );
    }

    async fn undecodable(&self, record: &Record, reason: &str) {
        warn!(
            key = %record.key,
            partition = record.partition,
            offset = record.offset,
            bytes = record.payload.len(),
            reason = %reason,
            "Dead-lettered record could not be decoded"
        );
    }
}

/// Handles records of the dead-letter stream.
///
/// Never consults the limiter and never republishes, so a dead-lettered event
/// cannot loop back into either stream.
pub struct DeadLetterHandler {
    sink: Arc<dyn AuditSink>,
    stats: Arc<ConsumerStats>,
}

impl DeadLetterHandler {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self {
            sink,
            stats: ConsumerStats::new(),
        }
    }
}

#[async_trait]
impl RecordHandler for DeadLetterHandler {
    async fn handle(&self, record: &Record) -> Result<()> {
        match Event::decode(&record.payload) {
            Ok(event) => {
                self.sink.denied(&event, record).await;
                self.stats.record_dead_lettered();
            }
            Err(e) => {
                self.sink.undecodable(record, &e.to_string()).await;
                self.stats.record_undecodable();
            }
        }
        Ok(())
    }

    fn stats(&self) -> &Arc<ConsumerStats> {
        &self.stats
    }
}
