//! Event record carried through the pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{QuotaflowError, Result};

/// An immutable event published on behalf of one entity.
///
/// The entity id is both the partition key and the rate-limit subject, so it is
/// never allowed to be empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    entity_id: String,
    kind: String,
    payload: String,
    created_at: DateTime<Utc>,
}

impl Event {
    /// Create an event stamped with the current time.
    pub fn new(
        entity_id: impl Into<String>,
        kind: impl Into<String>,
        payload: impl Into<String>,
    ) -> Result<Self> {
        Self::with_timestamp(entity_id, kind, payload, Utc::now())
    }

    /// Create an event with an explicit creation time.
    pub fn with_timestamp(
        entity_id: impl Into<String>,
        kind: impl Into<String>,
        payload: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Result<Self> {
        let event = Self {
            entity_id: entity_id.into(),
            kind: kind.into(),
            payload: payload.into(),
            created_at,
        };
        event.validate()?;
        Ok(event)
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn validate(&self) -> Result<()> {
        if self.entity_id.trim().is_empty() {
            return Err(QuotaflowError::InvalidEvent("entity_id must not be empty".into()));
        }
        Ok(())
    }

    /// Serialize the event for the wire.
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| QuotaflowError::InvalidEvent(e.to_string()))
    }

    /// Decode a wire payload, rejecting malformed JSON and empty entity ids.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let event: Event =
            serde_json::from_slice(bytes).map_err(|e| QuotaflowError::Decode(e.to_string()))?;
        event
            .validate()
            .map_err(|e| QuotaflowError::Decode(e.to_string()))?;
        Ok(event)
    }
}
