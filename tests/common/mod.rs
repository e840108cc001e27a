#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use quotaflow::config::QuotaflowConfig;
use quotaflow::error::{QuotaflowError, Result};
use quotaflow::event::Event;
use quotaflow::pipeline::{AuditSink, Deliverer, Pipeline};
use quotaflow::ratelimit::{ManualClock, MemoryOrderedSetStore, OrderedSetStore, StoreError};
use quotaflow::transport::{MemoryTransport, Record};

pub const START_MILLIS: i64 = 1_700_000_000_000;

/// Deliverer that remembers every event and can be told to fail or stall.
#[derive(Default)]
pub struct RecordingDeliverer {
    delivered: Mutex<Vec<Event>>,
    started: AtomicUsize,
    fail_next: AtomicU32,
    failing_entity: Mutex<Option<String>>,
    latency: Mutex<Duration>,
}

impl RecordingDeliverer {
    pub fn delivered(&self) -> Vec<Event> {
        self.delivered.lock().clone()
    }

    pub fn payloads_for(&self, entity_id: &str) -> Vec<String> {
        self.delivered
            .lock()
            .iter()
            .filter(|e| e.entity_id() == entity_id)
            .map(|e| e.payload().to_string())
            .collect()
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn fail_next(&self, times: u32) {
        self.fail_next.store(times, Ordering::SeqCst);
    }

    /// Reject every delivery for `entity_id` until cleared with `None`.
    pub fn fail_entity(&self, entity_id: Option<&str>) {
        *self.failing_entity.lock() = entity_id.map(str::to_string);
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }
}

#[async_trait]
impl Deliverer for RecordingDeliverer {
    async fn deliver(&self, event: &Event) -> Result<()> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let failing = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let entity_blocked = self.failing_entity.lock().as_deref() == Some(event.entity_id());
        if failing || entity_blocked {
            return Err(QuotaflowError::Delivery("provider rejected the request".into()));
        }
        self.delivered.lock().push(event.clone());
        Ok(())
    }
}

/// Audit sink that keeps what the dead-letter consumer saw.
#[derive(Default)]
pub struct RecordingSink {
    denied: Mutex<Vec<Event>>,
    undecodable: Mutex<Vec<Vec<u8>>>,
}

impl RecordingSink {
    pub fn denied(&self) -> Vec<Event> {
        self.denied.lock().clone()
    }

    pub fn undecodable(&self) -> Vec<Vec<u8>> {
        self.undecodable.lock().clone()
    }
}

#[async_trait]
impl AuditSink for RecordingSink {
    async fn denied(&self, event: &Event, _record: &Record) {
        self.denied.lock().push(event.clone());
    }

    async fn undecodable(&self, record: &Record, _reason: &str) {
        self.undecodable.lock().push(record.payload.clone());
    }
}

/// Store whose every command fails, like a Redis that refuses connections.
pub struct UnreachableStore;

#[async_trait]
impl OrderedSetStore for UnreachableStore {
    async fn remove_range(&self, _: &str, _: i64, _: i64) -> std::result::Result<u64, StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }

    async fn cardinality(&self, _: &str) -> std::result::Result<u64, StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }

    async fn insert(&self, _: &str, _: i64, _: &str) -> std::result::Result<(), StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }

    async fn expire(&self, _: &str, _: Duration) -> std::result::Result<(), StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }
}

/// Default configuration with instant delivery and short retry pauses.
pub fn config() -> QuotaflowConfig {
    let mut config = QuotaflowConfig::default();
    config.delivery.simulated_latency_ms = 0;
    config.consumer.retry_backoff_ms = 10;
    config.consumer.retry_jitter_ms = 0;
    config
}

pub struct Harness {
    pub pipeline: Pipeline,
    pub transport: MemoryTransport,
    pub clock: Arc<ManualClock>,
    pub store: Arc<MemoryOrderedSetStore>,
    pub deliverer: Arc<RecordingDeliverer>,
    pub sink: Arc<RecordingSink>,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(config(), None)
    }

    pub fn with_config(config: QuotaflowConfig) -> Self {
        Self::build(config, None)
    }

    /// Harness whose limiter talks to `store` instead of the in-memory one.
    pub fn with_store(store: Arc<dyn OrderedSetStore>) -> Self {
        Self::build(config(), Some(store))
    }

    pub fn build(config: QuotaflowConfig, store: Option<Arc<dyn OrderedSetStore>>) -> Self {
        let clock = Arc::new(ManualClock::new(START_MILLIS));
        let memory_store = Arc::new(MemoryOrderedSetStore::new(clock.clone()));
        let transport = MemoryTransport::from_config(&config.streams).unwrap();
        let deliverer = Arc::new(RecordingDeliverer::default());
        let sink = Arc::new(RecordingSink::default());

        let pipeline = Pipeline::builder(config)
            .transport(Arc::new(transport.clone()))
            .store(store.unwrap_or_else(|| memory_store.clone() as Arc<dyn OrderedSetStore>))
            .clock(clock.clone())
            .deliverer(deliverer.clone())
            .audit_sink(sink.clone())
            .build()
            .unwrap();

        Self {
            pipeline,
            transport,
            clock,
            store: memory_store,
            deliverer,
            sink,
        }
    }

    pub fn events_stream(&self) -> String {
        self.pipeline.config().streams.events.clone()
    }

    pub fn dead_letter_stream(&self) -> String {
        self.pipeline.config().streams.dead_letter.clone()
    }

    pub fn dead_lettered(&self) -> Vec<Event> {
        self.transport
            .records(&self.dead_letter_stream())
            .iter()
            .map(|r| Event::decode(&r.payload).unwrap())
            .collect()
    }

    pub fn primary_lag(&self) -> u64 {
        let config = self.pipeline.config();
        self.transport
            .lag(&config.streams.events, &config.consumer.group_id)
    }

    pub fn dead_letter_lag(&self) -> u64 {
        let config = self.pipeline.config();
        self.transport
            .lag(&config.streams.dead_letter, &config.consumer.dead_letter_group_id)
    }
}

/// Poll `check` until it holds, failing the test after a few seconds.
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
