//! Error types for the Quotaflow pipeline.

use thiserror::Error;

use crate::ratelimit::StoreError;
use crate::transport::TransportError;

/// Main error type for Quotaflow operations.
#[derive(Error, Debug)]
pub enum QuotaflowError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// An event violated its invariants before being published
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    /// A record payload could not be decoded into an event
    #[error("Decode error: {0}")]
    Decode(String),

    /// The sliding-window store could not be reached in time
    #[error("Rate limiter unavailable: {0}")]
    LimiterUnavailable(#[from] StoreError),

    /// A record could not be appended to a stream
    #[error("Publish error on stream {stream}: {source}")]
    Publish {
        stream: String,
        #[source]
        source: TransportError,
    },

    /// The downstream delivery side effect failed
    #[error("Delivery error: {0}")]
    Delivery(String),

    /// Subscription or commit failures
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Quotaflow operations.
pub type Result<T> = std::result::Result<T, QuotaflowError>;
