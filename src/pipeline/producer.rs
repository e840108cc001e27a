//! Keyed publication onto the primary and dead-letter streams.

use std::sync::Arc;

use tracing::{error, info};

use crate::config::StreamsConfig;
use crate::error::{QuotaflowError, Result};
use crate::event::Event;
use crate::transport::{Record, RecordPosition, Transport};

/// Publishes events keyed by their entity id.
///
/// Publish failures are returned to the caller and never retried here.
pub struct EventProducer {
    transport: Arc<dyn Transport>,
    events_stream: String,
    dead_letter_stream: String,
}

impl std::fmt::Debug for EventProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventProducer")
            .field("events_stream", &self.events_stream)
            .field("dead_letter_stream", &self.dead_letter_stream)
            .finish()
    }
}

impl EventProducer {
    pub fn new(transport: Arc<dyn Transport>, streams: &StreamsConfig) -> Self {
        Self {
            transport,
            events_stream: streams.events.clone(),
            dead_letter_stream: streams.dead_letter.clone(),
        }
    }

    pub fn events_stream(&self) -> &str {
        &self.events_stream
    }

    pub fn dead_letter_stream(&self) -> &str {
        &self.dead_letter_stream
    }

    /// Publish `event` to the primary stream.
    pub async fn publish(&self, event: &Event) -> Result<RecordPosition> {
        let position = self
            .send(&self.events_stream, event.entity_id(), event.encode()?)
            .await
            .inspect_err(|e| {
                error!(entity_id = %event.entity_id(), error = %e, "Failed to publish event");
            })?;

        info!(
            entity_id = %event.entity_id(),
            kind = %event.kind(),
            partition = position.partition,
            offset = position.offset,
            "Event published"
        );
        Ok(position)
    }

    /// Publish `event` unchanged to the dead-letter stream, under the same entity key.
    pub async fn publish_dead_letter(&self, event: &Event) -> Result<RecordPosition> {
        self.send(&self.dead_letter_stream, event.entity_id(), event.encode()?)
            .await
            .inspect_err(|e| {
                error!(entity_id = %event.entity_id(), error = %e, "Failed to dead-letter event");
            })
    }

    /// Copy a record that could not be decoded to the dead-letter stream byte for byte.
    pub async fn forward_undecodable(&self, record: &Record) -> Result<RecordPosition> {
        self.send(&self.dead_letter_stream, &record.key, record.payload.clone())
            .await
            .inspect_err(|e| {
                error!(
                    partition = record.partition,
                    offset = record.offset,
                    error = %e,
                    "Failed to forward undecodable record"
                );
            })
    }

    async fn send(&self, stream: &str, key: &str, payload: Vec<u8>) -> Result<RecordPosition> {
        self.transport
            .publish(stream, key, payload)
            .await
            .map_err(|source| QuotaflowError::Publish {
                stream: stream.to_string(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryTransport, TransportError};

    fn producer() -> (EventProducer, MemoryTransport) {
        let streams = StreamsConfig::default();
        let transport = MemoryTransport::from_config(&streams).unwrap();
        (EventProducer::new(Arc::new(transport.clone()), &streams), transport)
    }

    #[tokio::test]
    async fn test_publish_keys_by_entity() {
        let (producer, transport) = producer();
        let event = Event::new("u1", "ORDER", "shipped").unwrap();

        let position = producer.publish(&event).await.unwrap();
        assert_eq!(position.partition, 1);

        let records = transport.records("notifications");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key, "u1");
        assert_eq!(Event::decode(&records[0].payload).unwrap(), event);
    }

    #[tokio::test]
    async fn test_dead_letter_keeps_event_unchanged() {
        let (producer, transport) = producer();
        let event = Event::new("u2", "PROMOTIONAL", "50% off").unwrap();

        producer.publish_dead_letter(&event).await.unwrap();

        let records = transport.records("notifications.DLT");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key, "u2");
        assert_eq!(Event::decode(&records[0].payload).unwrap(), event);
        assert!(transport.records("notifications").is_empty());
    }

    #[tokio::test]
    async fn test_forward_undecodable_copies_bytes() {
        let (producer, transport) = producer();
        let record = Record {
            stream: "notifications".into(),
            partition: 0,
            offset: 7,
            key: "u3".into(),
            payload: b"\x00garbage".to_vec(),
        };

        producer.forward_undecodable(&record).await.unwrap();

        let records = transport.records("notifications.DLT");
        assert_eq!(records[0].payload, b"\x00garbage");
        assert_eq!(records[0].key, "u3");
    }

    #[tokio::test]
    async fn test_publish_error_is_surfaced() {
        let (producer, transport) = producer();
        transport.set_publish_failure("notifications", true);
        let event = Event::new("u1", "ORDER", "shipped").unwrap();

        let err = producer.publish(&event).await.unwrap_err();
        assert!(matches!(
            err,
            QuotaflowError::Publish {
                source: TransportError::Unavailable(_),
                ..
            }
        ));
    }
}
