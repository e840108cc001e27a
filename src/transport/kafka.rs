//! Kafka binding of the transport ports.
//!
//! One `StreamConsumer` per subscription is polled by a background pump that
//! fans records out into per-partition queues. A partition whose queue fills
//! up is paused at the broker until its worker drains it. A rebalance drops
//! the queue and cached commit of every partition it revokes, so a partition
//! handed back later restarts from the committed offset.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rdkafka::client::ClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{
    BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer,
};
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{Message, Offset, TopicPartitionList};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use super::{Record, RecordPosition, Subscription, Transport, TransportError};

const SEND_TIMEOUT: Duration = Duration::from_secs(10);
const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);
const ASSIGNMENT_POLL: Duration = Duration::from_millis(250);

impl From<KafkaError> for TransportError {
    fn from(e: KafkaError) -> Self {
        TransportError::Backend(e.to_string())
    }
}

/// Kafka producer plus a factory for manual-commit consumers.
pub struct KafkaTransport {
    brokers: String,
    producer: FutureProducer,
    queue_depth: usize,
}

impl std::fmt::Debug for KafkaTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaTransport")
            .field("brokers", &self.brokers)
            .field("queue_depth", &self.queue_depth)
            .finish()
    }
}

impl KafkaTransport {
    /// Create the shared producer. Keys are placed with the Java-compatible murmur2 partitioner.
    ///
    /// A partition is paused once `queue_depth` fetched records wait for its worker.
    pub fn connect(brokers: &str, queue_depth: usize) -> Result<Self, TransportError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "10000")
            .set("partitioner", "murmur2_random")
            .create()
            .map_err(|e| TransportError::Unavailable(e.to_string()))?;

        info!(brokers = %brokers, "Kafka producer created");
        Ok(Self {
            brokers: brokers.to_string(),
            producer,
            queue_depth: queue_depth.max(1),
        })
    }
}

#[async_trait]
impl Transport for KafkaTransport {
    async fn publish(
        &self,
        stream: &str,
        key: &str,
        payload: Vec<u8>,
    ) -> Result<RecordPosition, TransportError> {
        let record = FutureRecord::to(stream).key(key).payload(&payload);
        match self.producer.send(record, SEND_TIMEOUT).await {
            Ok((partition, offset)) => Ok(RecordPosition {
                partition: partition as u32,
                offset: offset as u64,
            }),
            Err((e, _)) => Err(TransportError::Unavailable(e.to_string())),
        }
    }

    async fn subscribe(
        &self,
        stream: &str,
        group: &str,
    ) -> Result<Box<dyn Subscription>, TransportError> {
        let buffers = Arc::new(PartitionBuffers::default());
        let context = RebalanceContext {
            stream: stream.to_string(),
            buffers: buffers.clone(),
        };
        let consumer: StreamConsumer<RebalanceContext> = ClientConfig::new()
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", group)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", "earliest")
            .create_with_context(context)
            .map_err(|e| TransportError::Unavailable(e.to_string()))?;
        consumer.subscribe(&[stream])?;

        let shared = Arc::new(KafkaShared {
            consumer,
            stream: stream.to_string(),
            buffers,
            closed: AtomicBool::new(false),
            arrived: Notify::new(),
            stop: Notify::new(),
            pause_at: self.queue_depth,
            resume_at: self.queue_depth / 4,
        });
        tokio::spawn(pump(shared.clone()));

        info!(stream = %stream, group = %group, "Kafka consumer subscribed");
        Ok(Box::new(KafkaSubscription { shared }))
    }
}

#[derive(Default)]
struct PartitionQueue {
    records: VecDeque<Record>,
    paused: bool,
}

/// Fetched-but-unhandled records and locally known commits, per partition.
#[derive(Default)]
struct PartitionBuffers {
    queues: Mutex<HashMap<u32, PartitionQueue>>,
    committed: Mutex<HashMap<u32, u64>>,
}

impl PartitionBuffers {
    fn forget(&self, partition: u32) -> usize {
        self.committed.lock().remove(&partition);
        self.queues
            .lock()
            .remove(&partition)
            .map(|queue| queue.records.len())
            .unwrap_or(0)
    }
}

/// Drops local state of partitions the group takes away from this member.
struct RebalanceContext {
    stream: String,
    buffers: Arc<PartitionBuffers>,
}

impl ClientContext for RebalanceContext {}

impl ConsumerContext for RebalanceContext {
    fn pre_rebalance(&self, _consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        let Rebalance::Revoke(revoked) = rebalance else {
            return;
        };
        for element in revoked.elements() {
            if element.topic() != self.stream {
                continue;
            }
            let partition = element.partition() as u32;
            let dropped = self.buffers.forget(partition);
            info!(stream = %self.stream, partition, dropped, "Partition revoked");
        }
    }
}

struct KafkaShared {
    consumer: StreamConsumer<RebalanceContext>,
    stream: String,
    buffers: Arc<PartitionBuffers>,
    closed: AtomicBool,
    arrived: Notify,
    stop: Notify,
    pause_at: usize,
    resume_at: usize,
}

impl KafkaShared {
    fn partition_list(&self, partition: u32) -> TopicPartitionList {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition(&self.stream, partition as i32);
        tpl
    }

    fn owned(&self) -> Result<Vec<u32>, TransportError> {
        let assignment = self.consumer.assignment()?;
        let mut owned: Vec<u32> = assignment
            .elements()
            .iter()
            .filter(|e| e.topic() == self.stream)
            .map(|e| e.partition() as u32)
            .collect();
        owned.sort_unstable();
        Ok(owned)
    }

    fn enqueue(&self, record: Record) {
        let partition = record.partition;
        let pause = {
            let mut queues = self.buffers.queues.lock();
            let queue = queues.entry(partition).or_default();
            queue.records.push_back(record);
            let pause = !queue.paused && queue.records.len() >= self.pause_at;
            queue.paused |= pause;
            pause
        };
        if pause {
            debug!(stream = %self.stream, partition, "Pausing partition, worker is behind");
            if let Err(e) = self.consumer.pause(&self.partition_list(partition)) {
                warn!(partition, error = %e, "Failed to pause partition");
            }
        }
        self.arrived.notify_waiters();
    }

    fn dequeue(&self, partition: u32) -> Option<Record> {
        let (record, resume) = {
            let mut queues = self.buffers.queues.lock();
            let queue = queues.get_mut(&partition)?;
            let record = queue.records.pop_front()?;
            let resume = queue.paused && queue.records.len() <= self.resume_at;
            if resume {
                queue.paused = false;
            }
            (record, resume)
        };
        if resume {
            if let Err(e) = self.consumer.resume(&self.partition_list(partition)) {
                warn!(partition, error = %e, "Failed to resume partition");
            }
        }
        Some(record)
    }
}

async fn pump(shared: Arc<KafkaShared>) {
    loop {
        if shared.closed.load(Ordering::SeqCst) {
            break;
        }
        let received = tokio::select! {
            _ = shared.stop.notified() => break,
            received = shared.consumer.recv() => received.map(|msg| Record {
                stream: msg.topic().to_string(),
                partition: msg.partition() as u32,
                offset: msg.offset() as u64,
                key: msg
                    .key()
                    .map(|k| String::from_utf8_lossy(k).into_owned())
                    .unwrap_or_default(),
                payload: msg.payload().map(<[u8]>::to_vec).unwrap_or_default(),
            }),
        };
        match received {
            Ok(record) => shared.enqueue(record),
            Err(e) => {
                warn!(stream = %shared.stream, error = %e, "Kafka receive failed");
                tokio::time::sleep(ASSIGNMENT_POLL).await;
            }
        }
    }
    debug!(stream = %shared.stream, "Kafka pump stopped");
}

/// Consumer group member backed by an rdkafka `StreamConsumer`.
pub struct KafkaSubscription {
    shared: Arc<KafkaShared>,
}

#[async_trait]
impl Subscription for KafkaSubscription {
    async fn next_assignment(&self, current: &[u32]) -> Result<Option<Vec<u32>>, TransportError> {
        loop {
            if self.shared.closed.load(Ordering::SeqCst) {
                return Ok(None);
            }
            let owned = self.shared.owned()?;
            if owned.as_slice() != current {
                return Ok(Some(owned));
            }
            tokio::time::sleep(ASSIGNMENT_POLL).await;
        }
    }

    async fn fetch(&self, partition: u32) -> Result<Option<Record>, TransportError> {
        loop {
            let arrived = self.shared.arrived.notified();
            tokio::pin!(arrived);
            arrived.as_mut().enable();

            if self.shared.closed.load(Ordering::SeqCst) {
                return Ok(None);
            }
            // Buffered records of a revoked partition belong to its new owner.
            if !self.shared.owned()?.contains(&partition) {
                self.shared.buffers.forget(partition);
                return Ok(None);
            }
            if let Some(record) = self.shared.dequeue(partition) {
                return Ok(Some(record));
            }

            // Revocations do not wake us, so re-check ownership periodically.
            let _ = tokio::time::timeout(ASSIGNMENT_POLL, arrived).await;
        }
    }

    async fn commit(&self, partition: u32, offset: u64) -> Result<(), TransportError> {
        if !self.shared.owned()?.contains(&partition) {
            return Err(TransportError::NotAssigned {
                stream: self.shared.stream.clone(),
                partition,
            });
        }
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(
            &self.shared.stream,
            partition as i32,
            Offset::Offset(offset as i64 + 1),
        )?;
        self.shared.consumer.commit(&tpl, CommitMode::Async)?;
        self.shared.buffers.committed.lock().insert(partition, offset + 1);
        Ok(())
    }

    async fn rewind(&self, partition: u32) -> Result<(), TransportError> {
        let was_paused = match self.shared.buffers.queues.lock().get_mut(&partition) {
            Some(queue) => {
                queue.records.clear();
                std::mem::replace(&mut queue.paused, false)
            }
            None => false,
        };

        let known = self.shared.buffers.committed.lock().get(&partition).copied();
        let target = match known {
            Some(next) => Offset::Offset(next as i64),
            None => {
                let committed = self
                    .shared
                    .consumer
                    .committed_offsets(self.shared.partition_list(partition), CONTROL_TIMEOUT)?;
                match committed
                    .find_partition(&self.shared.stream, partition as i32)
                    .map(|e| e.offset())
                {
                    Some(Offset::Offset(next)) => Offset::Offset(next),
                    _ => Offset::Beginning,
                }
            }
        };

        self.shared
            .consumer
            .seek(&self.shared.stream, partition as i32, target, CONTROL_TIMEOUT)?;
        if was_paused {
            self.shared.consumer.resume(&self.shared.partition_list(partition))?;
        }
        debug!(stream = %self.shared.stream, partition, offset = ?target, "Rewound partition");
        Ok(())
    }

    async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.stop.notify_one();
        self.shared.consumer.unsubscribe();
        self.shared.arrived.notify_waiters();
        info!(stream = %self.shared.stream, "Kafka consumer left group");
    }
}

impl Drop for KafkaSubscription {
    fn drop(&mut self) {
        if !self.shared.closed.swap(true, Ordering::SeqCst) {
            self.shared.stop.notify_one();
        }
    }
}
