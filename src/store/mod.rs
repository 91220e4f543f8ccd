//! Shared counter store abstraction and adapters.
//!
//! The limiter only ever talks to a [`SharedCounterStore`]. Adapters map the
//! narrow contract (read, expiring write, conditional write and, when the
//! backend can run it atomically, a whole window transform) onto a concrete
//! key-value store.

mod memory;
#[cfg(feature = "redis-store")]
mod redis;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::clock::Clock;
use crate::config::{StoreBackend, StoreConfig};
use crate::ratelimit::{TransformOutcome, WindowTransform};

pub use memory::MemoryStore;
#[cfg(feature = "redis-store")]
pub use self::redis::RedisStore;

/// Errors raised by store adapters.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unreachable: {0}")]
    Unavailable(String),
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("write conflict persisted after {attempts} attempts")]
    Contention { attempts: u32 },
    #[error("operation not supported by this store: {0}")]
    Unsupported(&'static str),
    #[cfg(feature = "redis-store")]
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Trait for the external, TTL-capable key-value store the limiter shares
/// with every other limiter instance.
///
/// Values are serialized window records. Every write carries an expiry.
#[async_trait]
pub trait SharedCounterStore: Send + Sync {
    /// Read the raw value for `key`, `None` if absent or expired.
    async fn read(&self, key: &str) -> StoreResult<Option<String>>;

    /// Unconditionally write `value` with the given expiry.
    async fn write(&self, key: &str, value: &str, expiry: Duration) -> StoreResult<()>;

    /// Write `value` only if the current value equals `expected`
    /// (`None` meaning the key must be absent). Returns whether it wrote.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        expiry: Duration,
    ) -> StoreResult<bool>;

    /// Whether [`mutate`](Self::mutate) runs atomically on this store.
    fn supports_mutate(&self) -> bool {
        false
    }

    /// Apply `transform` to `key` as one indivisible operation and persist
    /// the result with `transform.expiry()`.
    async fn mutate(
        &self,
        _key: &str,
        _transform: &WindowTransform,
    ) -> StoreResult<TransformOutcome> {
        Err(StoreError::Unsupported("mutate"))
    }

    /// Check that the store is reachable.
    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}

/// Build the store selected by configuration.
pub async fn connect(
    config: &StoreConfig,
    clock: Arc<dyn Clock>,
) -> crate::error::Result<Arc<dyn SharedCounterStore>> {
    match config.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryStore::new(clock))),
        #[cfg(feature = "redis-store")]
        StoreBackend::Redis => Ok(Arc::new(RedisStore::connect(config).await?)),
        #[cfg(not(feature = "redis-store"))]
        StoreBackend::Redis => Err(crate::error::WardenError::Config(
            "redis store configured but the redis-store feature is not enabled".to_string(),
        )),
    }
}
