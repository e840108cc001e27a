//! Configuration management for Quotaflow.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{QuotaflowError, Result};

/// Prefix for environment variable overrides, e.g. `QUOTAFLOW__RATE_LIMIT__MAX_PER_WINDOW=10`.
const ENV_PREFIX: &str = "QUOTAFLOW";

/// Main configuration for the Quotaflow service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuotaflowConfig {
    /// Stream names and partition counts
    #[serde(default)]
    pub streams: StreamsConfig,

    /// Consumer group configuration
    #[serde(default)]
    pub consumer: ConsumerConfig,

    /// Sliding-window rate limiting configuration
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Downstream delivery configuration
    #[serde(default)]
    pub delivery: DeliveryConfig,

    /// Transport and store backends
    #[serde(default)]
    pub backend: BackendConfig,

    /// Log output configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Stream configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamsConfig {
    /// Primary event stream
    #[serde(default = "default_events_stream")]
    pub events: String,

    /// Partitions of the primary stream
    #[serde(default = "default_events_partitions")]
    pub events_partitions: u32,

    /// Dead-letter stream for denied events
    #[serde(default = "default_dead_letter_stream")]
    pub dead_letter: String,

    /// Partitions of the dead-letter stream
    #[serde(default = "default_dead_letter_partitions")]
    pub dead_letter_partitions: u32,
}

impl Default for StreamsConfig {
    fn default() -> Self {
        Self {
            events: default_events_stream(),
            events_partitions: default_events_partitions(),
            dead_letter: default_dead_letter_stream(),
            dead_letter_partitions: default_dead_letter_partitions(),
        }
    }
}

fn default_events_stream() -> String {
    "notifications".to_string()
}

fn default_events_partitions() -> u32 {
    3
}

fn default_dead_letter_stream() -> String {
    "notifications.DLT".to_string()
}

fn default_dead_letter_partitions() -> u32 {
    1
}

/// Consumer group configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Group consuming the primary stream
    #[serde(default = "default_group_id")]
    pub group_id: String,

    /// Group consuming the dead-letter stream
    #[serde(default = "default_dead_letter_group_id")]
    pub dead_letter_group_id: String,

    /// Pause before a failed message is redelivered
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Upper bound of the random jitter added to the retry backoff
    #[serde(default = "default_retry_jitter_ms")]
    pub retry_jitter_ms: u64,

    /// Records buffered per partition worker
    #[serde(default = "default_partition_queue_depth")]
    pub partition_queue_depth: usize,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            group_id: default_group_id(),
            dead_letter_group_id: default_dead_letter_group_id(),
            retry_backoff_ms: default_retry_backoff_ms(),
            retry_jitter_ms: default_retry_jitter_ms(),
            partition_queue_depth: default_partition_queue_depth(),
        }
    }
}

impl ConsumerConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn retry_jitter(&self) -> Duration {
        Duration::from_millis(self.retry_jitter_ms)
    }
}

fn default_group_id() -> String {
    "notification-group".to_string()
}

fn default_dead_letter_group_id() -> String {
    "notification-dlt-group".to_string()
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_retry_jitter_ms() -> u64 {
    100
}

fn default_partition_queue_depth() -> usize {
    64
}

/// Sliding-window rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Admissions allowed per entity inside one window
    #[serde(default = "default_max_per_window")]
    pub max_per_window: u64,

    /// Window length in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Extra idle time before an entity's key expires
    #[serde(default = "default_expiry_margin_secs")]
    pub expiry_margin_secs: u64,

    /// Prefix of the per-entity window key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Upper bound for each store round trip
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_per_window: default_max_per_window(),
            window_secs: default_window_secs(),
            expiry_margin_secs: default_expiry_margin_secs(),
            key_prefix: default_key_prefix(),
            store_timeout_ms: default_store_timeout_ms(),
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn expiry_margin(&self) -> Duration {
        Duration::from_secs(self.expiry_margin_secs)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

fn default_max_per_window() -> u64 {
    5
}

fn default_window_secs() -> u64 {
    60
}

fn default_expiry_margin_secs() -> u64 {
    5
}

fn default_key_prefix() -> String {
    "rate_limit:".to_string()
}

fn default_store_timeout_ms() -> u64 {
    250
}

/// Downstream delivery configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Simulated provider latency per delivered event
    #[serde(default = "default_simulated_latency_ms")]
    pub simulated_latency_ms: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            simulated_latency_ms: default_simulated_latency_ms(),
        }
    }
}

fn default_simulated_latency_ms() -> u64 {
    50
}

/// Which implementation backs the transport and the window store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In-process implementation, state is lost on exit
    #[default]
    Memory,
    /// Networked implementation (Kafka for the transport, Redis for the store)
    External,
}

/// Backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Transport implementation
    #[serde(default)]
    pub transport: BackendKind,

    /// Window store implementation
    #[serde(default)]
    pub store: BackendKind,

    /// Kafka bootstrap servers, used when `transport` is external
    #[serde(default = "default_kafka_brokers")]
    pub kafka_brokers: String,

    /// Redis connection URL, used when `store` is external
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            transport: BackendKind::default(),
            store: BackendKind::default(),
            kafka_brokers: default_kafka_brokers(),
            redis_url: default_redis_url(),
        }
    }
}

fn default_kafka_brokers() -> String {
    "127.0.0.1:9092".to_string()
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/".to_string()
}

/// Log line format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Output format
    #[serde(default)]
    pub format: LogFormat,

    /// Filter directive used when `RUST_LOG` is unset
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            filter: default_log_filter(),
        }
    }
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl QuotaflowConfig {
    /// Load configuration from an optional file, layered with `QUOTAFLOW__*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(config::File::from(path));
        }
        let layered = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| QuotaflowError::Config(e.to_string()))?;

        let config: QuotaflowConfig = layered
            .try_deserialize()
            .map_err(|e| QuotaflowError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: QuotaflowConfig = serde_yaml::from_str(yaml)
            .map_err(|e| QuotaflowError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Render the effective configuration as YAML.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| QuotaflowError::Config(e.to_string()))
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        let streams = &self.streams;
        if streams.events.is_empty() || streams.dead_letter.is_empty() {
            return Err(QuotaflowError::Config("stream names must not be empty".into()));
        }
        if streams.events == streams.dead_letter {
            return Err(QuotaflowError::Config(
                "events and dead-letter streams must differ".into(),
            ));
        }
        if streams.events_partitions == 0 || streams.dead_letter_partitions == 0 {
            return Err(QuotaflowError::Config("partition counts must be positive".into()));
        }

        let consumer = &self.consumer;
        if consumer.group_id.is_empty() || consumer.dead_letter_group_id.is_empty() {
            return Err(QuotaflowError::Config("group ids must not be empty".into()));
        }
        if consumer.group_id == consumer.dead_letter_group_id {
            return Err(QuotaflowError::Config(
                "primary and dead-letter consumer groups must be independent".into(),
            ));
        }
        if consumer.partition_queue_depth == 0 {
            return Err(QuotaflowError::Config("partition_queue_depth must be positive".into()));
        }

        let rate_limit = &self.rate_limit;
        if rate_limit.max_per_window == 0 {
            return Err(QuotaflowError::Config("max_per_window must be positive".into()));
        }
        if rate_limit.window_secs == 0 {
            return Err(QuotaflowError::Config("window_secs must be positive".into()));
        }
        if rate_limit.store_timeout_ms == 0 {
            return Err(QuotaflowError::Config("store_timeout_ms must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_reference_deployment() {
        let config = QuotaflowConfig::default();
        assert_eq!(config.streams.events, "notifications");
        assert_eq!(config.streams.events_partitions, 3);
        assert_eq!(config.streams.dead_letter, "notifications.DLT");
        assert_eq!(config.streams.dead_letter_partitions, 1);
        assert_eq!(config.consumer.group_id, "notification-group");
        assert_eq!(config.consumer.dead_letter_group_id, "notification-dlt-group");
        assert_eq!(config.rate_limit.max_per_window, 5);
        assert_eq!(config.rate_limit.window(), Duration::from_secs(60));
        assert_eq!(config.rate_limit.key_prefix, "rate_limit:");
        assert_eq!(config.backend.transport, BackendKind::Memory);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = r#"
rate_limit:
  max_per_window: 10
  window_secs: 30
logging:
  format: json
"#;
        let config = QuotaflowConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.rate_limit.max_per_window, 10);
        assert_eq!(config.rate_limit.window_secs, 30);
        assert_eq!(config.rate_limit.expiry_margin_secs, 5);
        assert_eq!(config.streams.events, "notifications");
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_backend_kind_parsing() {
        let yaml = r#"
backend:
  transport: external
  store: memory
  kafka_brokers: "kafka:9092"
"#;
        let config = QuotaflowConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.backend.transport, BackendKind::External);
        assert_eq!(config.backend.store, BackendKind::Memory);
        assert_eq!(config.backend.kafka_brokers, "kafka:9092");
    }

    #[test]
    fn test_rejects_zero_limit() {
        let yaml = r#"
rate_limit:
  max_per_window: 0
"#;
        assert!(matches!(
            QuotaflowConfig::from_yaml(yaml),
            Err(QuotaflowError::Config(_))
        ));
    }

    #[test]
    fn test_rejects_shared_consumer_group() {
        let mut config = QuotaflowConfig::default();
        config.consumer.dead_letter_group_id = config.consumer.group_id.clone();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_partitions() {
        let mut config = QuotaflowConfig::default();
        config.streams.events_partitions = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_yaml_round_trip_of_effective_config() {
        let config = QuotaflowConfig::default();
        let yaml = config.to_yaml().unwrap();
        let parsed = QuotaflowConfig::from_yaml(&yaml).unwrap();
        assert_eq!(parsed.streams.dead_letter, config.streams.dead_letter);
        assert_eq!(parsed.consumer.retry_backoff(), config.consumer.retry_backoff());
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = QuotaflowConfig::load(None).unwrap();
        assert_eq!(config.streams.events_partitions, 3);
    }
}
