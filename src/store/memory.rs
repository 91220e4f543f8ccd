//! In-process store.
//!
//! Entries live in a [`DashMap`]; expiry is checked lazily against the
//! injected clock, and expired entries are swept every
//! [`SWEEP_INTERVAL`] writes. Per-key atomicity comes from holding the
//! shard entry while a transform or conditional write runs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use super::{SharedCounterStore, StoreResult};
use crate::clock::Clock;
use crate::ratelimit::{TransformOutcome, WindowTransform};

/// Writes between sweeps of expired entries.
pub const SWEEP_INTERVAL: u64 = 1024;

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at_ms: u64,
}

/// A [`SharedCounterStore`] held in this process.
///
/// Only safe to share between limiters in the same process; useful for
/// tests and single-instance deployments.
#[derive(Debug)]
pub struct MemoryStore {
    entries: DashMap<String, StoredValue>,
    clock: Arc<dyn Clock>,
    atomic_mutate: bool,
    /// Writes since creation, drives the sweep
    writes: AtomicU64,
}

impl MemoryStore {
    /// Create a store that supports atomic transforms.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
            atomic_mutate: true,
            writes: AtomicU64::new(0),
        }
    }

    /// Create a store that only offers read/write/compare-and-set, forcing
    /// callers onto the optimistic retry path.
    pub fn without_atomic_mutate(clock: Arc<dyn Clock>) -> Self {
        Self {
            atomic_mutate: false,
            ..Self::new(clock)
        }
    }

    /// Number of live (unexpired) entries.
    pub fn len(&self) -> usize {
        let now = self.clock.now_ms();
        self.entries.iter().filter(|e| e.expires_at_ms > now).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every expired entry, returning how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let before = self.entries.len();
        self.entries.retain(|_, stored| stored.expires_at_ms > now);
        before.saturating_sub(self.entries.len())
    }

    /// Count a write and sweep when the interval comes round.
    ///
    /// Must not be called while an entry guard is held.
    fn after_write(&self) {
        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % SWEEP_INTERVAL == 0 {
            let purged = self.purge_expired();
            if purged > 0 {
                debug!(purged = purged, "Swept expired entries");
            }
        }
    }

    fn expires_at(&self, expiry: Duration) -> u64 {
        self.clock.now_ms().saturating_add(expiry.as_millis() as u64)
    }

    fn live_value<'a>(&self, stored: &'a StoredValue) -> Option<&'a str> {
        (stored.expires_at_ms > self.clock.now_ms()).then_some(stored.value.as_str())
    }
}

#[async_trait]
impl SharedCounterStore for MemoryStore {
    async fn read(&self, key: &str) -> StoreResult<Option<String>> {
        let value = self
            .entries
            .get(key)
            .and_then(|stored| self.live_value(&stored).map(str::to_string));
        if value.is_none() {
            self.entries
                .remove_if(key, |_, stored| stored.expires_at_ms <= self.clock.now_ms());
        }
        Ok(value)
    }

    async fn write(&self, key: &str, value: &str, expiry: Duration) -> StoreResult<()> {
        self.entries.insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                expires_at_ms: self.expires_at(expiry),
            },
        );
        self.after_write();
        Ok(())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        expiry: Duration,
    ) -> StoreResult<bool> {
        let replacement = StoredValue {
            value: value.to_string(),
            expires_at_ms: self.expires_at(expiry),
        };

        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if self.live_value(occupied.get()) != expected {
                    return Ok(false);
                }
                occupied.insert(replacement);
            }
            Entry::Vacant(vacant) => {
                if expected.is_some() {
                    return Ok(false);
                }
                vacant.insert(replacement);
            }
        }
        self.after_write();
        Ok(true)
    }

    fn supports_mutate(&self) -> bool {
        self.atomic_mutate
    }

    async fn mutate(
        &self,
        key: &str,
        transform: &WindowTransform,
    ) -> StoreResult<TransformOutcome> {
        if !self.atomic_mutate {
            return Err(super::StoreError::Unsupported("mutate"));
        }

        let expires_at_ms = self.expires_at(transform.expiry());
        let outcome = {
            let mut entry = self
                .entries
                .entry(key.to_string())
                .or_insert_with(|| StoredValue {
                    value: String::new(),
                    expires_at_ms: 0,
                });

            let outcome = transform.apply(self.live_value(&entry));
            let encoded = outcome
                .record
                .encode()
                .map_err(|e| super::StoreError::Unavailable(e.to_string()))?;
            *entry = StoredValue {
                value: encoded,
                expires_at_ms,
            };
            outcome
        };
        self.after_write();
        Ok(outcome)
    }
}
