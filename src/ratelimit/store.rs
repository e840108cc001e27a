//! Ordered-set store port and its in-memory implementation.
//!
//! The store mirrors the subset of sorted-set commands the sliding window needs.
//! Each command is atomic on its own; callers must not assume a sequence of
//! commands is transactional.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, trace};

use super::clock::Clock;

/// Minimum time between two full sweeps of expired keys.
const SWEEP_INTERVAL_MS: i64 = 1_000;

/// Errors raised by an ordered-set store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unreachable: {0}")]
    Unavailable(String),
    #[error("store call exceeded {0:?}")]
    Timeout(Duration),
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Sorted set of members ordered by an integer score, one set per key.
#[async_trait]
pub trait OrderedSetStore: Send + Sync {
    /// Remove every member of `key` whose score lies in `[low, high]`.
    ///
    /// Returns the number of removed members.
    async fn remove_range(&self, key: &str, low: i64, high: i64) -> Result<u64, StoreError>;

    /// Number of members stored under `key`.
    async fn cardinality(&self, key: &str) -> Result<u64, StoreError>;

    /// Add `member` with `score` to `key`, creating the set if needed.
    async fn insert(&self, key: &str, score: i64, member: &str) -> Result<(), StoreError>;

    /// Expire the whole key after `ttl` of inactivity.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
struct ScoredSet {
    members: BTreeSet<(i64, String)>,
    expires_at: Option<i64>,
}

impl ScoredSet {
    fn is_expired(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// In-process ordered-set store.
///
/// Keys expire against the injected clock: an expired key is dropped the next
/// time any command touches it, and inserts sweep the whole map at most once
/// per [`SWEEP_INTERVAL_MS`] so idle keys do not pile up.
#[derive(Clone)]
pub struct MemoryOrderedSetStore {
    sets: Arc<DashMap<String, ScoredSet>>,
    clock: Arc<dyn Clock>,
    last_sweep: Arc<AtomicI64>,
}

impl std::fmt::Debug for MemoryOrderedSetStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryOrderedSetStore")
            .field("keys", &self.sets.len())
            .finish()
    }
}

impl MemoryOrderedSetStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let now = clock.now_millis();
        Self {
            sets: Arc::new(DashMap::new()),
            clock,
            last_sweep: Arc::new(AtomicI64::new(now)),
        }
    }

    /// Drop the key if its expiry has passed.
    fn evict_if_expired(&self, key: &str) {
        let now = self.clock.now_millis();
        if self.sets.remove_if(key, |_, set| set.is_expired(now)).is_some() {
            trace!(key = %key, "Expired idle key");
        }
    }

    /// Drop every expired key, unless another sweep ran within the interval.
    ///
    /// Must not be called while holding a reference into `sets`.
    fn sweep_expired(&self) {
        let now = self.clock.now_millis();
        let last = self.last_sweep.load(Ordering::Relaxed);
        if now - last < SWEEP_INTERVAL_MS {
            return;
        }
        if self
            .last_sweep
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return;
        }

        let before = self.sets.len();
        self.sets.retain(|_, set| !set.is_expired(now));
        let evicted = before.saturating_sub(self.sets.len());
        if evicted > 0 {
            debug!(evicted, remaining = self.sets.len(), "Swept expired keys");
        }
    }

    /// Whether `key` currently exists (expired keys do not).
    pub fn contains_key(&self, key: &str) -> bool {
        self.evict_if_expired(key);
        self.sets.contains_key(key)
    }

    /// Number of live keys.
    pub fn key_count(&self) -> usize {
        let now = self.clock.now_millis();
        self.sets.retain(|_, set| !set.is_expired(now));
        self.sets.len()
    }

    /// Scores stored under `key`, lowest first.
    pub fn scores(&self, key: &str) -> Vec<i64> {
        self.evict_if_expired(key);
        self.sets
            .get(key)
            .map(|set| set.members.iter().map(|(score, _)| *score).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl OrderedSetStore for MemoryOrderedSetStore {
    async fn remove_range(&self, key: &str, low: i64, high: i64) -> Result<u64, StoreError> {
        self.evict_if_expired(key);
        let Some(mut set) = self.sets.get_mut(key) else {
            return Ok(0);
        };
        let before = set.members.len();
        set.members
            .retain(|(score, _)| *score < low || *score > high);
        let removed = (before - set.members.len()) as u64;
        let now_empty = set.members.is_empty();
        drop(set);

        // Like a sorted set, an emptied key ceases to exist.
        if now_empty {
            self.sets.remove_if(key, |_, set| set.members.is_empty());
        }
        Ok(removed)
    }

    async fn cardinality(&self, key: &str) -> Result<u64, StoreError> {
        self.evict_if_expired(key);
        Ok(self
            .sets
            .get(key)
            .map(|set| set.members.len() as u64)
            .unwrap_or(0))
    }

    async fn insert(&self, key: &str, score: i64, member: &str) -> Result<(), StoreError> {
        self.sweep_expired();
        self.evict_if_expired(key);
        self.sets
            .entry(key.to_string())
            .or_default()
            .members
            .insert((score, member.to_string()));
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        self.evict_if_expired(key);
        if let Some(mut set) = self.sets.get_mut(key) {
            set.expires_at = Some(self.clock.now_millis() + ttl.as_millis() as i64);
        }
        Ok(())
    }
}
