//! Group consumption loop shared by the primary and dead-letter consumers.
//!
//! One worker task drives each owned partition: fetch, handle, commit, in
//! strict offset order. A slow record only holds up its own partition. A
//! handler failure leaves the record uncommitted and rewinds the partition so
//! the record is fetched again after a backoff.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use rand::Rng;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::ConsumerConfig;
use crate::error::Result;
use crate::transport::{Record, Subscription, Transport, TransportError};

/// Per-record side effect run by a [`ConsumerRunner`].
///
/// `Ok` acknowledges the record. `Err` leaves it unacknowledged so it is
/// redelivered, which means handlers run at least once per record.
#[async_trait]
pub trait RecordHandler: Send + Sync + 'static {
    async fn handle(&self, record: &Record) -> Result<()>;

    /// Counters shared with the runner.
    fn stats(&self) -> &Arc<ConsumerStats>;
}

/// Running totals for one consumer.
#[derive(Debug, Default)]
pub struct ConsumerStats {
    received: AtomicU64,
    delivered: AtomicU64,
    dead_lettered: AtomicU64,
    undecodable: AtomicU64,
    failed: AtomicU64,
    acknowledged: AtomicU64,
}

/// Point-in-time copy of [`ConsumerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub received: u64,
    pub delivered: u64,
    pub dead_lettered: u64,
    pub undecodable: u64,
    pub failed: u64,
    pub acknowledged: u64,
}

impl ConsumerStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_lettered(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_undecodable(&self) {
        self.undecodable.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_acknowledged(&self) {
        self.acknowledged.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            undecodable: self.undecodable.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            acknowledged: self.acknowledged.load(Ordering::Relaxed),
        }
    }
}

/// Retry pacing for unacknowledged records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunnerSettings {
    pub retry_backoff: Duration,
    pub retry_jitter: Duration,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self::from(&ConsumerConfig::default())
    }
}

impl From<&ConsumerConfig> for RunnerSettings {
    fn from(config: &ConsumerConfig) -> Self {
        Self {
            retry_backoff: config.retry_backoff(),
            retry_jitter: config.retry_jitter(),
        }
    }
}

impl RunnerSettings {
    fn backoff(&self) -> Duration {
        let jitter_ms = self.retry_jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return self.retry_backoff;
        }
        self.retry_backoff + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

/// Joins a consumer group and feeds every owned partition to a [`RecordHandler`].
pub struct ConsumerRunner<H: RecordHandler> {
    transport: Arc<dyn Transport>,
    stream: String,
    group: String,
    handler: Arc<H>,
    settings: RunnerSettings,
}

impl<H: RecordHandler> ConsumerRunner<H> {
    pub fn new(
        transport: Arc<dyn Transport>,
        stream: impl Into<String>,
        group: impl Into<String>,
        handler: Arc<H>,
        settings: RunnerSettings,
    ) -> Self {
        Self {
            transport,
            stream: stream.into(),
            group: group.into(),
            handler,
            settings,
        }
    }

    /// Consume until `shutdown` turns true or the subscription ends.
    ///
    /// Failing to join the group is returned. Everything after that is
    /// logged and retried. On shutdown each worker finishes its in-flight
    /// record before the member leaves the group.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let subscription: Arc<dyn Subscription> =
            Arc::from(self.transport.subscribe(&self.stream, &self.group).await?);
        info!(stream = %self.stream, group = %self.group, "Consumer started");

        let (exited_tx, mut exited_rx) = mpsc::unbounded_channel::<(u32, u64)>();
        let mut workers = Workers::default();
        let mut owned: Vec<u32> = Vec::new();

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                next = subscription.next_assignment(&owned) => match next {
                    Ok(Some(assignment)) => {
                        info!(
                            stream = %self.stream,
                            group = %self.group,
                            partitions = ?assignment,
                            "Partitions assigned"
                        );
                        owned = assignment;
                        self.spawn_missing(&subscription, &owned, &mut workers, &exited_tx, &shutdown, Duration::ZERO);
                    }
                    Ok(None) => {
                        info!(stream = %self.stream, group = %self.group, "Subscription closed");
                        break;
                    }
                    Err(e) => {
                        warn!(stream = %self.stream, group = %self.group, error = %e, "Assignment poll failed");
                        tokio::time::sleep(self.settings.backoff()).await;
                    }
                },
                Some((partition, id)) = exited_rx.recv() => {
                    workers.exited(partition, id);
                    // Revoked and re-assigned while the old worker was still busy.
                    let delay = self.settings.retry_backoff;
                    self.spawn_missing(&subscription, &owned, &mut workers, &exited_tx, &shutdown, delay);
                }
            }
        }

        info!(stream = %self.stream, group = %self.group, "Consumer stopping");
        drop(exited_tx);
        join_all(workers.handles.into_values().map(|(_, handle)| handle)).await;
        subscription.close().await;
        info!(stream = %self.stream, group = %self.group, "Consumer stopped");
        Ok(())
    }

    fn spawn_missing(
        &self,
        subscription: &Arc<dyn Subscription>,
        owned: &[u32],
        workers: &mut Workers,
        exited: &mpsc::UnboundedSender<(u32, u64)>,
        shutdown: &watch::Receiver<bool>,
        start_delay: Duration,
    ) {
        for &partition in owned {
            if workers.handles.contains_key(&partition) {
                continue;
            }
            workers.next_id += 1;
            let id = workers.next_id;
            let worker = PartitionWorker {
                subscription: subscription.clone(),
                handler: self.handler.clone(),
                stream: self.stream.clone(),
                partition,
                settings: self.settings,
                start_delay,
            };
            let exited = exited.clone();
            let shutdown = shutdown.clone();
            let handle = tokio::spawn(async move {
                worker.run(shutdown).await;
                let _ = exited.send((partition, id));
            });
            workers.handles.insert(partition, (id, handle));
        }
    }
}

/// Live partition workers, keyed by partition and tagged with a spawn id.
#[derive(Default)]
struct Workers {
    handles: HashMap<u32, (u64, JoinHandle<()>)>,
    next_id: u64,
}

impl Workers {
    fn exited(&mut self, partition: u32, id: u64) {
        if self.handles.get(&partition).is_some_and(|(live, _)| *live == id) {
            self.handles.remove(&partition);
        }
    }
}

struct PartitionWorker<H: RecordHandler> {
    subscription: Arc<dyn Subscription>,
    handler: Arc<H>,
    stream: String,
    partition: u32,
    settings: RunnerSettings,
    start_delay: Duration,
}

impl<H: RecordHandler> PartitionWorker<H> {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let partition = self.partition;
        if !self.start_delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(self.start_delay) => {}
                _ = shutdown.changed() => return,
            }
        }
        debug!(stream = %self.stream, partition, "Partition worker started");

        // After a rewind, records past this offset were fetched before the
        // rewind took effect and will be fetched again.
        let mut expected: Option<u64> = None;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let fetched = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                fetched = self.subscription.fetch(partition) => fetched,
            };
            let record = match fetched {
                Ok(Some(record)) => record,
                Ok(None) => break,
                Err(e) => {
                    warn!(stream = %self.stream, partition, error = %e, "Fetch failed");
                    if !self.pause(&mut shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            if expected.is_some_and(|next| record.offset > next) {
                trace!(stream = %self.stream, partition, offset = record.offset, "Skipping stale record");
                continue;
            }

            let stats = self.handler.stats();
            stats.record_received();
            match self.handler.handle(&record).await {
                Ok(()) => match self.subscription.commit(partition, record.offset).await {
                    Ok(()) => {
                        stats.record_acknowledged();
                        expected = Some(record.offset + 1);
                    }
                    Err(TransportError::NotAssigned { .. }) | Err(TransportError::Closed) => {
                        warn!(
                            stream = %self.stream,
                            partition,
                            offset = record.offset,
                            "Partition lost before acknowledgement, record will be redelivered"
                        );
                        break;
                    }
                    Err(e) => {
                        // A later commit covers this offset.
                        warn!(
                            stream = %self.stream,
                            partition,
                            offset = record.offset,
                            error = %e,
                            "Acknowledgement failed"
                        );
                        expected = Some(record.offset + 1);
                    }
                },
                Err(e) => {
                    stats.record_failed();
                    warn!(
                        stream = %self.stream,
                        partition,
                        offset = record.offset,
                        error = %e,
                        "Record left unacknowledged, retrying after backoff"
                    );
                    expected = Some(record.offset);
                    if !self.rewind(&mut shutdown).await {
                        break;
                    }
                    if !self.pause(&mut shutdown).await {
                        break;
                    }
                }
            }
        }

        debug!(stream = %self.stream, partition, "Partition worker stopped");
    }

    /// Move the partition back to its committed offset, retrying until the
    /// transport accepts. Returns `false` if the worker has to stop.
    ///
    /// Nothing is fetched in between: the fetch position is already past the
    /// failed record.
    async fn rewind(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        loop {
            match self.subscription.rewind(self.partition).await {
                Ok(()) => return true,
                Err(TransportError::NotAssigned { .. }) | Err(TransportError::Closed) => {
                    debug!(stream = %self.stream, partition = self.partition, "Partition lost during rewind");
                    return false;
                }
                Err(e) => {
                    warn!(
                        stream = %self.stream,
                        partition = self.partition,
                        error = %e,
                        "Rewind failed, retrying after backoff"
                    );
                    if !self.pause(shutdown).await {
                        return false;
                    }
                }
            }
        }
    }

    /// Sleep for one backoff. Returns `false` if shutdown arrived first.
    async fn pause(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.settings.backoff()) => true,
            _ = shutdown.changed() => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::QuotaflowError;
    use crate::transport::MemoryTransport;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use tokio::time::timeout;

    /// Fails the first attempt of every offset listed in `fail_once`.
    struct ScriptedHandler {
        seen: Mutex<Vec<(u32, u64)>>,
        fail_once: Mutex<HashSet<u64>>,
        stats: Arc<ConsumerStats>,
    }

    impl ScriptedHandler {
        fn new(fail_once: &[u64]) -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
                fail_once: Mutex::new(fail_once.iter().copied().collect()),
                stats: ConsumerStats::new(),
            })
        }

        fn seen(&self) -> Vec<(u32, u64)> {
            self.seen.lock().clone()
        }
    }

    #[async_trait]
    impl RecordHandler for ScriptedHandler {
        async fn handle(&self, record: &Record) -> Result<()> {
            self.seen.lock().push((record.partition, record.offset));
            if self.fail_once.lock().remove(&record.offset) {
                return Err(QuotaflowError::Delivery("scripted failure".into()));
            }
            Ok(())
        }

        fn stats(&self) -> &Arc<ConsumerStats> {
            &self.stats
        }
    }

    fn fast() -> RunnerSettings {
        RunnerSettings {
            retry_backoff: Duration::from_millis(5),
            retry_jitter: Duration::ZERO,
        }
    }

    async fn wait_for(mut check: impl FnMut() -> bool) {
        timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    async fn setup(records: usize) -> MemoryTransport {
        let transport = MemoryTransport::new();
        transport.create_stream("events", 3).unwrap();
        for i in 0..records {
            transport
                .publish("events", "u1", format!("{}", i).into_bytes())
                .await
                .unwrap();
        }
        transport
    }

    #[test]
    fn test_backoff_stays_within_jitter() {
        let settings = RunnerSettings {
            retry_backoff: Duration::from_millis(100),
            retry_jitter: Duration::from_millis(20),
        };
        for _ in 0..100 {
            let backoff = settings.backoff();
            assert!(backoff >= Duration::from_millis(100));
            assert!(backoff <= Duration::from_millis(120));
        }
    }

    #[tokio::test]
    async fn test_runner_acknowledges_in_order() {
        let transport = setup(4).await;
        let handler = ScriptedHandler::new(&[]);
        let runner = ConsumerRunner::new(
            Arc::new(transport.clone()),
            "events",
            "g",
            handler.clone(),
            fast(),
        );
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(runner.run(rx));

        wait_for(|| transport.committed_offset("events", "g", 1) == 4).await;
        assert_eq!(handler.seen(), vec![(1, 0), (1, 1), (1, 2), (1, 3)]);
        assert_eq!(handler.stats.snapshot().acknowledged, 4);

        tx.send(true).unwrap();
        task.await.unwrap().unwrap();
        assert_eq!(transport.member_count("events", "g"), 0);
    }

    #[tokio::test]
    async fn test_failed_record_is_retried_before_later_ones() {
        let transport = setup(3).await;
        let handler = ScriptedHandler::new(&[1]);
        let runner = ConsumerRunner::new(
            Arc::new(transport.clone()),
            "events",
            "g",
            handler.clone(),
            fast(),
        );
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(runner.run(rx));

        wait_for(|| transport.committed_offset("events", "g", 1) == 3).await;
        let offsets: Vec<u64> = handler.seen().iter().map(|(_, o)| *o).collect();
        assert_eq!(offsets, vec![0, 1, 1, 2]);

        let stats = handler.stats.snapshot();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.acknowledged, 3);

        tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }

    /// Memory transport whose subscriptions fail the first `rewind_failures` rewinds.
    struct FlakyRewindTransport {
        inner: MemoryTransport,
        rewind_failures: Arc<AtomicU64>,
    }

    struct FlakyRewindSubscription {
        inner: Box<dyn Subscription>,
        rewind_failures: Arc<AtomicU64>,
    }

    #[async_trait]
    impl Transport for FlakyRewindTransport {
        async fn publish(
            &self,
            stream: &str,
            key: &str,
            payload: Vec<u8>,
        ) -> std::result::Result<crate::transport::RecordPosition, TransportError> {
            self.inner.publish(stream, key, payload).await
        }

        async fn subscribe(
            &self,
            stream: &str,
            group: &str,
        ) -> std::result::Result<Box<dyn Subscription>, TransportError> {
            Ok(Box::new(FlakyRewindSubscription {
                inner: self.inner.subscribe(stream, group).await?,
                rewind_failures: self.rewind_failures.clone(),
            }))
        }
    }

    #[async_trait]
    impl Subscription for FlakyRewindSubscription {
        async fn next_assignment(
            &self,
            current: &[u32],
        ) -> std::result::Result<Option<Vec<u32>>, TransportError> {
            self.inner.next_assignment(current).await
        }

        async fn fetch(&self, partition: u32) -> std::result::Result<Option<Record>, TransportError> {
            self.inner.fetch(partition).await
        }

        async fn commit(&self, partition: u32, offset: u64) -> std::result::Result<(), TransportError> {
            self.inner.commit(partition, offset).await
        }

        async fn rewind(&self, partition: u32) -> std::result::Result<(), TransportError> {
            let failing = self
                .rewind_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(TransportError::Backend("seek timed out".into()));
            }
            self.inner.rewind(partition).await
        }

        async fn close(&self) {
            self.inner.close().await
        }
    }

    #[tokio::test]
    async fn test_transient_rewind_failure_is_retried() {
        let transport = setup(3).await;
        let rewind_failures = Arc::new(AtomicU64::new(2));
        let flaky = FlakyRewindTransport {
            inner: transport.clone(),
            rewind_failures: rewind_failures.clone(),
        };
        let handler = ScriptedHandler::new(&[0]);
        let runner = ConsumerRunner::new(Arc::new(flaky), "events", "g", handler.clone(), fast());
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(runner.run(rx));

        wait_for(|| transport.committed_offset("events", "g", 1) == 3).await;
        assert_eq!(rewind_failures.load(Ordering::SeqCst), 0);
        let offsets: Vec<u64> = handler.seen().iter().map(|(_, o)| *o).collect();
        assert_eq!(offsets, vec![0, 0, 1, 2]);
        assert_eq!(handler.stats.snapshot().acknowledged, 3);

        tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_subscribe_failure_is_returned() {
        let transport = MemoryTransport::new();
        let runner = ConsumerRunner::new(
            Arc::new(transport),
            "missing",
            "g",
            ScriptedHandler::new(&[]),
            fast(),
        );
        let (_tx, rx) = watch::channel(false);

        assert!(matches!(
            runner.run(rx).await,
            Err(QuotaflowError::Transport(TransportError::UnknownStream(_)))
        ));
    }

    #[tokio::test]
    async fn test_dropped_shutdown_sender_stops_runner() {
        let transport = setup(0).await;
        let runner = ConsumerRunner::new(
            Arc::new(transport.clone()),
            "events",
            "g",
            ScriptedHandler::new(&[]),
            fast(),
        );
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(runner.run(rx));

        wait_for(|| transport.member_count("events", "g") == 1).await;
        drop(tx);
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap().unwrap();
    }
}
