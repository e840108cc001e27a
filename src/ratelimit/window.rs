//! Sliding-window admission control over an ordered-set store.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::clock::Clock;
use super::store::{OrderedSetStore, StoreError};
use crate::config::RateLimitConfig;
use crate::error::Result;

/// Store key holding one entity's admission records.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WindowKey(String);

impl WindowKey {
    pub fn new(prefix: &str, entity_id: &str) -> Self {
        Self(format!("{}{}", prefix, entity_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WindowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Admitted; `in_window` admissions were already recorded before this one.
    Allowed { in_window: u64 },
    /// Quota exhausted; nothing was recorded.
    Denied { in_window: u64 },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }

    /// Admissions observed after pruning, before this check recorded anything.
    pub fn in_window(&self) -> u64 {
        match self {
            Decision::Allowed { in_window } | Decision::Denied { in_window } => *in_window,
        }
    }
}

/// Sliding-window limiter settings.
#[derive(Debug, Clone)]
pub struct WindowSettings {
    /// Admissions allowed inside one window
    pub max_per_window: u64,
    /// Length of the sliding window
    pub window: Duration,
    /// Idle time past the window before the key expires
    pub expiry_margin: Duration,
    /// Prefix of every window key
    pub key_prefix: String,
    /// Bound for every store round trip
    pub store_timeout: Duration,
}

impl Default for WindowSettings {
    fn default() -> Self {
        Self::from(&RateLimitConfig::default())
    }
}

impl From<&RateLimitConfig> for WindowSettings {
    fn from(config: &RateLimitConfig) -> Self {
        Self {
            max_per_window: config.max_per_window,
            window: config.window(),
            expiry_margin: config.expiry_margin(),
            key_prefix: config.key_prefix.clone(),
            store_timeout: config.store_timeout(),
        }
    }
}

/// Per-entity sliding-window limiter.
///
/// All state lives in the store, so any number of consumer instances can share
/// one window. The prune/count/insert/expire sequence is not transactional:
/// two concurrent checks for the same entity may both observe `limit - 1` and
/// both admit.
pub struct SlidingWindowLimiter {
    store: Arc<dyn OrderedSetStore>,
    clock: Arc<dyn Clock>,
    settings: WindowSettings,
}

impl fmt::Debug for SlidingWindowLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlidingWindowLimiter")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl SlidingWindowLimiter {
    pub fn new(
        store: Arc<dyn OrderedSetStore>,
        clock: Arc<dyn Clock>,
        settings: WindowSettings,
    ) -> Self {
        Self {
            store,
            clock,
            settings,
        }
    }

    /// Admissions allowed per window.
    pub fn limit(&self) -> u64 {
        self.settings.max_per_window
    }

    pub fn window_key(&self, entity_id: &str) -> WindowKey {
        WindowKey::new(&self.settings.key_prefix, entity_id)
    }

    /// Check the quota for `entity_id` and record an admission if it is allowed.
    ///
    /// Store failures and timeouts surface as `LimiterUnavailable`; the caller
    /// decides the fail-open/fail-closed policy. Once the admission is stored
    /// the decision is `Allowed`: a failed expiry refresh only leaves the key
    /// on its previous expiry.
    pub async fn check(&self, entity_id: &str) -> Result<Decision> {
        let key = self.window_key(entity_id);
        let now = self.clock.now_millis();

        let in_window = self.prune_and_count(&key, now).await?;

        trace!(
            key = %key,
            count = in_window,
            limit = self.settings.max_per_window,
            "Checking sliding window"
        );

        if in_window >= self.settings.max_per_window {
            debug!(
                entity_id = %entity_id,
                count = in_window,
                limit = self.settings.max_per_window,
                window_secs = self.settings.window.as_secs(),
                "Sliding window exhausted"
            );
            return Ok(Decision::Denied { in_window });
        }

        // A fresh nonce per admission keeps same-millisecond admissions distinct.
        let member = Uuid::new_v4().to_string();
        self.bounded(self.store.insert(key.as_str(), now, &member))
            .await?;
        let ttl = self.settings.window + self.settings.expiry_margin;
        if let Err(e) = self.bounded(self.store.expire(key.as_str(), ttl)).await {
            warn!(key = %key, error = %e, "Admission recorded but key expiry not refreshed");
        }

        Ok(Decision::Allowed { in_window })
    }

    /// Admissions currently inside the window for `entity_id`.
    ///
    /// Prunes like `check` but never records anything.
    pub async fn count(&self, entity_id: &str) -> Result<u64> {
        let key = self.window_key(entity_id);
        let now = self.clock.now_millis();
        self.prune_and_count(&key, now).await
    }

    async fn prune_and_count(&self, key: &WindowKey, now: i64) -> Result<u64> {
        let cutoff = now - self.settings.window.as_millis() as i64;
        // Records scored exactly at the cutoff are still inside the window.
        let pruned = self
            .bounded(self.store.remove_range(key.as_str(), i64::MIN, cutoff - 1))
            .await?;
        if pruned > 0 {
            trace!(key = %key, pruned, "Pruned stale admissions");
        }
        let count = self.bounded(self.store.cardinality(key.as_str())).await?;
        Ok(count)
    }

    async fn bounded<T, F>(&self, call: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, StoreError>>,
    {
        match tokio::time::timeout(self.settings.store_timeout, call).await {
            Ok(result) => Ok(result?),
            Err(_) => {
                warn!(
                    timeout_ms = self.settings.store_timeout.as_millis() as u64,
                    "Window store call timed out"
                );
                Err(StoreError::Timeout(self.settings.store_timeout).into())
            }
        }
    }
}
