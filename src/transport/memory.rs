//! In-process partitioned log with consumer groups.
//!
//! Semantics follow a broker closely enough to exercise the consumption protocol:
//! - records are placed by [`PartitionRouter`] and never removed,
//! - each group keeps one committed offset per partition,
//! - group members split partitions (`partition % members`) and every join or
//!   leave starts a new generation,
//! - a newly owned partition is read from its committed offset, so anything a
//!   previous owner fetched but never committed is delivered again,
//! - commits and rewinds from a member that does not own the partition fail.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info};

use super::router::PartitionRouter;
use super::{Record, RecordPosition, Subscription, Transport, TransportError};
use crate::config::StreamsConfig;

struct StoredRecord {
    key: String,
    payload: Vec<u8>,
}

#[derive(Default)]
struct GroupState {
    /// Member ids in join order
    members: Vec<u64>,
    /// Next offset to read per partition
    committed: HashMap<u32, u64>,
    generation: u64,
}

impl GroupState {
    fn owned_by(&self, member: u64, partitions: u32) -> Vec<u32> {
        let Some(index) = self.members.iter().position(|m| *m == member) else {
            return Vec::new();
        };
        let count = self.members.len() as u32;
        (0..partitions)
            .filter(|p| p % count == index as u32)
            .collect()
    }

    fn committed(&self, partition: u32) -> u64 {
        self.committed.get(&partition).copied().unwrap_or(0)
    }
}

struct StreamLog {
    partitions: Vec<Vec<StoredRecord>>,
    groups: HashMap<String, GroupState>,
}

impl StreamLog {
    fn partition_count(&self) -> u32 {
        self.partitions.len() as u32
    }
}

#[derive(Default)]
struct State {
    streams: HashMap<String, StreamLog>,
    failing: HashSet<String>,
}

struct Shared {
    state: Mutex<State>,
    changed: Notify,
    router: PartitionRouter,
    next_member: AtomicU64,
}

/// In-memory [`Transport`].
///
/// Clones share the same log.
#[derive(Clone)]
pub struct MemoryTransport {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("MemoryTransport")
            .field("streams", &state.streams.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                changed: Notify::new(),
                router: PartitionRouter::new(),
                next_member: AtomicU64::new(1),
            }),
        }
    }

    /// Transport with the primary and dead-letter streams already created.
    pub fn from_config(streams: &StreamsConfig) -> Result<Self, TransportError> {
        let transport = Self::new();
        transport.create_stream(&streams.events, streams.events_partitions)?;
        transport.create_stream(&streams.dead_letter, streams.dead_letter_partitions)?;
        Ok(transport)
    }

    /// Create `stream` with `partitions` partitions. Re-creating with the same count is a no-op.
    pub fn create_stream(&self, stream: &str, partitions: u32) -> Result<(), TransportError> {
        if partitions == 0 {
            return Err(TransportError::Backend(format!(
                "stream {} needs at least one partition",
                stream
            )));
        }
        let mut state = self.shared.state.lock();
        if let Some(existing) = state.streams.get(stream) {
            if existing.partition_count() != partitions {
                return Err(TransportError::Backend(format!(
                    "stream {} already exists with {} partitions",
                    stream,
                    existing.partition_count()
                )));
            }
            return Ok(());
        }
        state.streams.insert(
            stream.to_string(),
            StreamLog {
                partitions: (0..partitions).map(|_| Vec::new()).collect(),
                groups: HashMap::new(),
            },
        );
        info!(stream = %stream, partitions, "Created stream");
        Ok(())
    }

    /// Make every publish to `stream` fail until cleared.
    pub fn set_publish_failure(&self, stream: &str, failing: bool) {
        let mut state = self.shared.state.lock();
        if failing {
            state.failing.insert(stream.to_string());
        } else {
            state.failing.remove(stream);
        }
    }

    pub fn partition_count(&self, stream: &str) -> Option<u32> {
        let state = self.shared.state.lock();
        state.streams.get(stream).map(StreamLog::partition_count)
    }

    /// Every record of `stream`, partition by partition in offset order.
    pub fn records(&self, stream: &str) -> Vec<Record> {
        let state = self.shared.state.lock();
        let Some(log) = state.streams.get(stream) else {
            return Vec::new();
        };
        log.partitions
            .iter()
            .enumerate()
            .flat_map(|(partition, records)| {
                records.iter().enumerate().map(move |(offset, stored)| Record {
                    stream: stream.to_string(),
                    partition: partition as u32,
                    offset: offset as u64,
                    key: stored.key.clone(),
                    payload: stored.payload.clone(),
                })
            })
            .collect()
    }

    /// Log end offset of every partition of `stream`.
    pub fn end_offsets(&self, stream: &str) -> Vec<u64> {
        let state = self.shared.state.lock();
        state
            .streams
            .get(stream)
            .map(|log| log.partitions.iter().map(|p| p.len() as u64).collect())
            .unwrap_or_default()
    }

    /// Next offset `group` will read from `partition` of `stream`.
    pub fn committed_offset(&self, stream: &str, group: &str, partition: u32) -> u64 {
        let state = self.shared.state.lock();
        state
            .streams
            .get(stream)
            .and_then(|log| log.groups.get(group))
            .map(|g| g.committed(partition))
            .unwrap_or(0)
    }

    /// Records of `stream` not yet committed by `group`.
    pub fn lag(&self, stream: &str, group: &str) -> u64 {
        let state = self.shared.state.lock();
        let Some(log) = state.streams.get(stream) else {
            return 0;
        };
        let group = log.groups.get(group);
        log.partitions
            .iter()
            .enumerate()
            .map(|(p, records)| {
                let committed = group.map(|g| g.committed(p as u32)).unwrap_or(0);
                (records.len() as u64).saturating_sub(committed)
            })
            .sum()
    }

    /// Live members of `group` on `stream`.
    pub fn member_count(&self, stream: &str, group: &str) -> usize {
        let state = self.shared.state.lock();
        state
            .streams
            .get(stream)
            .and_then(|log| log.groups.get(group))
            .map(|g| g.members.len())
            .unwrap_or(0)
    }

    fn leave(&self, stream: &str, group: &str, member: u64) {
        let mut state = self.shared.state.lock();
        if let Some(g) = state
            .streams
            .get_mut(stream)
            .and_then(|log| log.groups.get_mut(group))
        {
            let before = g.members.len();
            g.members.retain(|m| *m != member);
            if g.members.len() != before {
                g.generation += 1;
                debug!(stream = %stream, group = %group, member, "Member left group");
            }
        }
        drop(state);
        self.shared.changed.notify_waiters();
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn publish(
        &self,
        stream: &str,
        key: &str,
        payload: Vec<u8>,
    ) -> Result<RecordPosition, TransportError> {
        let position = {
            let mut state = self.shared.state.lock();
            if state.failing.contains(stream) {
                return Err(TransportError::Unavailable(format!(
                    "stream {} is not accepting writes",
                    stream
                )));
            }
            let log = state
                .streams
                .get_mut(stream)
                .ok_or_else(|| TransportError::UnknownStream(stream.to_string()))?;
            let partition = self.shared.router.route(key, log.partition_count());
            let records = &mut log.partitions[partition as usize];
            records.push(StoredRecord {
                key: key.to_string(),
                payload,
            });
            RecordPosition {
                partition,
                offset: records.len() as u64 - 1,
            }
        };
        self.shared.changed.notify_waiters();
        Ok(position)
    }

    async fn subscribe(
        &self,
        stream: &str,
        group: &str,
    ) -> Result<Box<dyn Subscription>, TransportError> {
        let member = self.shared.next_member.fetch_add(1, Ordering::SeqCst);
        {
            let mut state = self.shared.state.lock();
            let log = state
                .streams
                .get_mut(stream)
                .ok_or_else(|| TransportError::UnknownStream(stream.to_string()))?;
            let g = log.groups.entry(group.to_string()).or_default();
            g.members.push(member);
            g.generation += 1;
            info!(
                stream = %stream,
                group = %group,
                member,
                members = g.members.len(),
                "Member joined group"
            );
        }
        self.shared.changed.notify_waiters();

        Ok(Box::new(MemorySubscription {
            transport: self.clone(),
            stream: stream.to_string(),
            group: group.to_string(),
            member,
            cursor: Mutex::new(Cursor::default()),
        }))
    }
}

#[derive(Default)]
struct Cursor {
    /// Next offset to fetch per owned partition
    positions: HashMap<u32, u64>,
    generation: u64,
    closed: bool,
}

/// Group member handed out by [`MemoryTransport::subscribe`].
///
/// Dropping it without [`Subscription::close`] still leaves the group, which
/// is how tests model a crashed consumer.
pub struct MemorySubscription {
    transport: MemoryTransport,
    stream: String,
    group: String,
    member: u64,
    cursor: Mutex<Cursor>,
}

impl MemorySubscription {
    fn not_assigned(&self, partition: u32) -> TransportError {
        TransportError::NotAssigned {
            stream: self.stream.clone(),
            partition,
        }
    }

    /// Owned partitions, with fetch positions reconciled against the current generation.
    ///
    /// `None` once the member is no longer part of the group.
    fn reconcile(&self, state: &State, cursor: &mut Cursor) -> Result<Option<Vec<u32>>, TransportError> {
        if cursor.closed {
            return Ok(None);
        }
        let log = state
            .streams
            .get(&self.stream)
            .ok_or_else(|| TransportError::UnknownStream(self.stream.clone()))?;
        let Some(group) = log.groups.get(&self.group) else {
            return Ok(None);
        };
        if !group.members.contains(&self.member) {
            return Ok(None);
        }

        let owned = group.owned_by(self.member, log.partition_count());
        if cursor.generation != group.generation {
            cursor.positions.retain(|p, _| owned.contains(p));
            for partition in &owned {
                let committed = group.committed(*partition);
                let position = cursor.positions.entry(*partition).or_insert(committed);
                // Another owner may have moved the group past us meanwhile.
                *position = (*position).max(committed);
            }
            cursor.generation = group.generation;
        }
        Ok(Some(owned))
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        if !self.cursor.get_mut().closed {
            self.transport.leave(&self.stream, &self.group, self.member);
        }
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next_assignment(&self, current: &[u32]) -> Result<Option<Vec<u32>>, TransportError> {
        loop {
            let notified = self.transport.shared.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = self.transport.shared.state.lock();
                let mut cursor = self.cursor.lock();
                match self.reconcile(&state, &mut cursor)? {
                    None => return Ok(None),
                    Some(owned) if owned.as_slice() != current => return Ok(Some(owned)),
                    Some(_) => {}
                }
            }

            notified.await;
        }
    }

    async fn fetch(&self, partition: u32) -> Result<Option<Record>, TransportError> {
        loop {
            let notified = self.transport.shared.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = self.transport.shared.state.lock();
                let mut cursor = self.cursor.lock();
                let Some(owned) = self.reconcile(&state, &mut cursor)? else {
                    return Ok(None);
                };
                if !owned.contains(&partition) {
                    return Ok(None);
                }

                let log = &state.streams[&self.stream];
                let records = &log.partitions[partition as usize];
                let position = cursor.positions.entry(partition).or_insert(0);
                if let Some(stored) = records.get(*position as usize) {
                    let record = Record {
                        stream: self.stream.clone(),
                        partition,
                        offset: *position,
                        key: stored.key.clone(),
                        payload: stored.payload.clone(),
                    };
                    *position += 1;
                    return Ok(Some(record));
                }
            }

            notified.await;
        }
    }

    async fn commit(&self, partition: u32, offset: u64) -> Result<(), TransportError> {
        {
            let mut state = self.transport.shared.state.lock();
            let log = state
                .streams
                .get_mut(&self.stream)
                .ok_or_else(|| TransportError::UnknownStream(self.stream.clone()))?;
            let partitions = log.partition_count();
            let group = log
                .groups
                .get_mut(&self.group)
                .ok_or(TransportError::Closed)?;
            if !group.owned_by(self.member, partitions).contains(&partition) {
                return Err(self.not_assigned(partition));
            }
            let committed = group.committed.entry(partition).or_insert(0);
            *committed = (*committed).max(offset + 1);
        }
        self.transport.shared.changed.notify_waiters();
        Ok(())
    }

    async fn rewind(&self, partition: u32) -> Result<(), TransportError> {
        let state = self.transport.shared.state.lock();
        let mut cursor = self.cursor.lock();
        let owned = self
            .reconcile(&state, &mut cursor)?
            .ok_or(TransportError::Closed)?;
        if !owned.contains(&partition) {
            return Err(self.not_assigned(partition));
        }
        let committed = state.streams[&self.stream].groups[&self.group].committed(partition);
        cursor.positions.insert(partition, committed);
        debug!(
            stream = %self.stream,
            group = %self.group,
            partition,
            offset = committed,
            "Rewound partition to committed offset"
        );
        Ok(())
    }

    async fn close(&self) {
        let already_closed = {
            let mut cursor = self.cursor.lock();
            std::mem::replace(&mut cursor.closed, true)
        };
        if !already_closed {
            self.transport.leave(&self.stream, &self.group, self.member);
        }
    }
}
