//! Producer, primary consumer and dead-letter consumer wiring.
//!
//! [`Pipeline`] owns the shared pieces (limiter, producer, ports) and hands
//! out the two consumer runners. Each runner joins its own consumer group, so
//! the primary and dead-letter consumers progress independently.

mod consumer;
mod dead_letter;
mod delivery;
mod producer;
mod runner;

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::QuotaflowConfig;
use crate::error::Result;
use crate::ingress::Ingress;
use crate::ratelimit::{
    Clock, MemoryOrderedSetStore, OrderedSetStore, SlidingWindowLimiter, SystemClock,
    WindowSettings,
};
use crate::transport::{MemoryTransport, Transport};

pub use consumer::{DenyReason, NotificationHandler, Outcome};
pub use dead_letter::{AuditSink, DeadLetterHandler, LogAuditSink};
pub use delivery::{Deliverer, LogDeliverer};
pub use producer::EventProducer;
pub use runner::{ConsumerRunner, ConsumerStats, RecordHandler, RunnerSettings, StatsSnapshot};

/// Assembles a [`Pipeline`], defaulting every port to its in-process binding.
pub struct PipelineBuilder {
    config: QuotaflowConfig,
    transport: Option<Arc<dyn Transport>>,
    store: Option<Arc<dyn OrderedSetStore>>,
    clock: Option<Arc<dyn Clock>>,
    deliverer: Option<Arc<dyn Deliverer>>,
    audit_sink: Option<Arc<dyn AuditSink>>,
}

impl PipelineBuilder {
    pub fn new(config: QuotaflowConfig) -> Self {
        Self {
            config,
            transport: None,
            store: None,
            clock: None,
            deliverer: None,
            audit_sink: None,
        }
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn store(mut self, store: Arc<dyn OrderedSetStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn deliverer(mut self, deliverer: Arc<dyn Deliverer>) -> Self {
        self.deliverer = Some(deliverer);
        self
    }

    pub fn audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit_sink = Some(sink);
        self
    }

    pub fn build(self) -> Result<Pipeline> {
        self.config.validate()?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock::new()));
        let store = match self.store {
            Some(store) => store,
            None => Arc::new(MemoryOrderedSetStore::new(clock.clone())),
        };
        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(MemoryTransport::from_config(&self.config.streams)?),
        };
        let deliverer = self
            .deliverer
            .unwrap_or_else(|| Arc::new(LogDeliverer::from(&self.config.delivery)));
        let audit_sink = self.audit_sink.unwrap_or_else(|| Arc::new(LogAuditSink));

        let limiter = Arc::new(SlidingWindowLimiter::new(
            store,
            clock,
            WindowSettings::from(&self.config.rate_limit),
        ));
        let producer = Arc::new(EventProducer::new(transport.clone(), &self.config.streams));

        let primary = Arc::new(NotificationHandler::new(
            limiter.clone(),
            producer.clone(),
            deliverer,
        ));
        let dead_letter = Arc::new(DeadLetterHandler::new(audit_sink));

        Ok(Pipeline {
            config: self.config,
            transport,
            limiter,
            producer,
            primary,
            dead_letter,
        })
    }
}

/// Fully wired pipeline.
pub struct Pipeline {
    config: QuotaflowConfig,
    transport: Arc<dyn Transport>,
    limiter: Arc<SlidingWindowLimiter>,
    producer: Arc<EventProducer>,
    primary: Arc<NotificationHandler>,
    dead_letter: Arc<DeadLetterHandler>,
}

impl Pipeline {
    pub fn builder(config: QuotaflowConfig) -> PipelineBuilder {
        PipelineBuilder::new(config)
    }

    pub fn config(&self) -> &QuotaflowConfig {
        &self.config
    }

    pub fn limiter(&self) -> &Arc<SlidingWindowLimiter> {
        &self.limiter
    }

    pub fn producer(&self) -> &Arc<EventProducer> {
        &self.producer
    }

    pub fn primary_handler(&self) -> &Arc<NotificationHandler> {
        &self.primary
    }

    pub fn ingress(&self) -> Ingress {
        Ingress::new(self.producer.clone(), self.limiter.clone())
    }

    pub fn primary_stats(&self) -> StatsSnapshot {
        self.primary.stats().snapshot()
    }

    pub fn dead_letter_stats(&self) -> StatsSnapshot {
        self.dead_letter.stats().snapshot()
    }

    /// Runner for the primary stream under the primary group.
    pub fn primary_runner(&self) -> ConsumerRunner<NotificationHandler> {
        ConsumerRunner::new(
            self.transport.clone(),
            &self.config.streams.events,
            &self.config.consumer.group_id,
            self.primary.clone(),
            RunnerSettings::from(&self.config.consumer),
        )
    }

    /// Runner for the dead-letter stream under its own group.
    pub fn dead_letter_runner(&self) -> ConsumerRunner<DeadLetterHandler> {
        ConsumerRunner::new(
            self.transport.clone(),
            &self.config.streams.dead_letter,
            &self.config.consumer.dead_letter_group_id,
            self.dead_letter.clone(),
            RunnerSettings::from(&self.config.consumer),
        )
    }

    /// Spawn both consumers.
    pub fn start(&self) -> RunningPipeline {
        let (shutdown, rx) = watch::channel(false);
        let primary = tokio::spawn(self.primary_runner().run(rx.clone()));
        let dead_letter = tokio::spawn(self.dead_letter_runner().run(rx));
        info!(
            events = %self.config.streams.events,
            dead_letter = %self.config.streams.dead_letter,
            "Pipeline started"
        );
        RunningPipeline {
            shutdown,
            primary,
            dead_letter,
        }
    }
}

/// Handles of the two spawned consumers.
pub struct RunningPipeline {
    shutdown: watch::Sender<bool>,
    primary: JoinHandle<Result<()>>,
    dead_letter: JoinHandle<Result<()>>,
}

impl RunningPipeline {
    /// Signal both consumers and wait for their in-flight records.
    ///
    /// Returns the first consumer error, if any.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown.send(true);
        let primary = join_consumer("primary", self.primary).await;
        let dead_letter = join_consumer("dead-letter", self.dead_letter).await;
        info!("Pipeline stopped");
        primary.and(dead_letter)
    }
}

async fn join_consumer(name: &str, handle: JoinHandle<Result<()>>) -> Result<()> {
    match handle.await {
        Ok(result) => result.inspect_err(|e| {
            error!(consumer = %name, error = %e, "Consumer exited with error");
        }),
        Err(e) => {
            error!(consumer = %name, error = %e, "Consumer task panicked");
            Err(std::io::Error::other(e).into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;

    #[tokio::test]
    async fn test_builder_defaults_to_memory_ports() {
        let pipeline = Pipeline::builder(QuotaflowConfig::default()).build().unwrap();
        assert_eq!(pipeline.limiter().limit(), 5);
        assert_eq!(pipeline.producer().events_stream(), "notifications");
        assert_eq!(pipeline.primary_stats(), StatsSnapshot::default());
    }

    #[test]
    fn test_builder_rejects_invalid_config() {
        let mut config = QuotaflowConfig::default();
        config.consumer.dead_letter_group_id = config.consumer.group_id.clone();
        assert!(Pipeline::builder(config).build().is_err());
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let mut config = QuotaflowConfig::default();
        config.delivery.simulated_latency_ms = 0;
        let pipeline = Pipeline::builder(config).build().unwrap();
        let running = pipeline.start();

        let event = Event::new("u1", "ORDER", "shipped").unwrap();
        pipeline.producer().publish(&event).await.unwrap();

        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        while pipeline.primary_stats().acknowledged < 1 {
            assert!(tokio::time::Instant::now() < deadline, "event never acknowledged");
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        tokio_test::assert_ok!(running.shutdown().await);
        assert_eq!(pipeline.primary_stats().delivered, 1);
    }
}
