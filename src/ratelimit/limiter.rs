//! Core sliding-window limiter.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, trace, warn};

use super::decision::Decision;
use super::key::StorageKey;
use super::record::{Representation, WindowRecord, WindowTransform};
use crate::clock::{Clock, SystemClock};
use crate::error::{Result, WardenError};
use crate::store::{SharedCounterStore, StoreError};

/// Client id used when the caller does not namespace its limiter.
pub const DEFAULT_CLIENT_ID: &str = "default";

/// Upper bound on the backoff exponent between optimistic retries.
const MAX_BACKOFF_SHIFT: u32 = 6;

/// Tuning for a [`SlidingWindowLimiter`].
#[derive(Debug, Clone)]
pub struct LimiterOptions {
    /// How window records are stored
    pub representation: Representation,
    /// Conditional-write retries before giving up, when the store cannot mutate atomically
    pub max_retries: u32,
    /// Base delay between conditional-write retries
    pub retry_backoff: Duration,
    /// Time box for a whole `check_and_record` call
    pub operation_timeout: Option<Duration>,
}

impl Default for LimiterOptions {
    fn default() -> Self {
        Self {
            representation: Representation::Log,
            max_retries: 10,
            retry_backoff: Duration::from_millis(5),
            operation_timeout: None,
        }
    }
}

/// A stateless sliding-window limiter.
///
/// Every decision is computed from the shared store, so any number of
/// limiter instances (in any number of processes) can share one store.
pub struct SlidingWindowLimiter {
    /// The shared source of truth
    store: Arc<dyn SharedCounterStore>,
    /// Time source for hit timestamps
    clock: Arc<dyn Clock>,
    options: LimiterOptions,
}

impl SlidingWindowLimiter {
    /// Create a limiter on the system clock with default options.
    pub fn new(store: Arc<dyn SharedCounterStore>) -> Self {
        Self::with_options(store, Arc::new(SystemClock), LimiterOptions::default())
    }

    pub fn with_options(
        store: Arc<dyn SharedCounterStore>,
        clock: Arc<dyn Clock>,
        options: LimiterOptions,
    ) -> Self {
        Self {
            store,
            clock,
            options,
        }
    }

    /// Record a hit for `key` and decide whether it is over `limit`.
    ///
    /// `client_id` namespaces the stored record so that limiters configured
    /// differently can share a store.
    pub async fn check_and_record(
        &self,
        key: &str,
        window_ms: u64,
        limit: u64,
        block_duration_ms: u64,
        client_id: &str,
    ) -> Result<Decision> {
        validate(window_ms, limit)?;

        let storage_key = StorageKey::new(client_id, key);

        trace!(
            key = %storage_key,
            window_ms = window_ms,
            limit = limit,
            "Recording hit"
        );

        let (now, record) = match self.options.operation_timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.record_hit(&storage_key, window_ms))
                .await
                .map_err(|_| WardenError::StoreUnavailable(StoreError::Timeout(timeout)))??,
            None => self.record_hit(&storage_key, window_ms).await?,
        };

        let (total_hits, window_reset_ms) = record.tally(now, window_ms);
        let is_blocked = total_hits > limit;

        if is_blocked {
            debug!(
                key = %storage_key,
                total_hits = total_hits,
                limit = limit,
                "Rate limit exceeded"
            );
        }

        Ok(Decision {
            total_hits,
            is_blocked,
            window_reset_ms,
            block_expires_ms: if is_blocked { block_duration_ms } else { 0 },
        })
    }

    /// [`check_and_record`](Self::check_and_record) with second-granularity
    /// arguments and the default client id.
    pub async fn check_and_record_secs(
        &self,
        key: &str,
        window_secs: u64,
        limit: u64,
        block_duration_secs: u64,
    ) -> Result<Decision> {
        let window_ms = secs_to_ms(window_secs, "window")?;
        let block_duration_ms = secs_to_ms(block_duration_secs, "block duration")?;
        self.check_and_record(key, window_ms, limit, block_duration_ms, DEFAULT_CLIENT_ID)
            .await
    }

    async fn record_hit(&self, key: &StorageKey, window_ms: u64) -> Result<(u64, WindowRecord)> {
        let store_key = key.to_store_key();

        if self.store.supports_mutate() {
            let now = self.clock.now_ms();
            let transform = WindowTransform::new(now, window_ms, self.options.representation);
            let outcome = self.store.mutate(&store_key, &transform).await?;
            if outcome.recovered_corrupt {
                warn!(key = %key, "Discarded unreadable window record");
            }
            return Ok((now, outcome.record));
        }

        let attempts = self.options.max_retries + 1;
        for attempt in 0..attempts {
            let now = self.clock.now_ms();
            let transform = WindowTransform::new(now, window_ms, self.options.representation);

            let current = self.store.read(&store_key).await?;
            let outcome = transform.apply(current.as_deref());
            if outcome.recovered_corrupt {
                warn!(key = %key, "Discarded unreadable window record");
            }

            let encoded = outcome.record.encode()?;
            if self
                .store
                .compare_and_set(&store_key, current.as_deref(), &encoded, transform.expiry())
                .await?
            {
                return Ok((now, outcome.record));
            }

            debug!(key = %key, attempt = attempt, "Window record changed concurrently, retrying");
            if attempt + 1 < attempts {
                tokio::time::sleep(backoff_delay(self.options.retry_backoff, attempt)).await;
            }
        }

        Err(StoreError::Contention { attempts }.into())
    }
}

fn validate(window_ms: u64, limit: u64) -> Result<()> {
    if window_ms == 0 {
        return Err(WardenError::InvalidConfiguration(
            "window must be greater than zero".to_string(),
        ));
    }
    if limit == 0 {
        return Err(WardenError::InvalidConfiguration(
            "limit must be at least one".to_string(),
        ));
    }
    Ok(())
}

/// Convert a second-granularity setting to milliseconds, rejecting overflow.
pub fn secs_to_ms(secs: u64, what: &str) -> Result<u64> {
    secs.checked_mul(1000).ok_or_else(|| {
        WardenError::InvalidConfiguration(format!("{what} of {secs}s is too large"))
    })
}

/// Exponential backoff with up to one base interval of jitter.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exponential = base.saturating_mul(1 << attempt.min(MAX_BACKOFF_SHIFT));
    let jitter_ms = rand::thread_rng().gen_range(0..=base.as_millis() as u64);
    exponential + Duration::from_millis(jitter_ms)
}
