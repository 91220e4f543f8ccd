//! Slidewarden - Distributed Sliding-Window Rate Limiting
//!
//! This crate decides whether a request identified by an opaque key is
//! within its limit, using an exact sliding-window log (or an approximate
//! two-bucket counter) kept in a shared, TTL-capable key-value store. Any
//! number of stateless limiter instances can share one store; per-key
//! updates are made atomic either by the store itself or by optimistic
//! conditional writes.

pub mod clock;
pub mod config;
pub mod error;
pub mod guard;
pub mod ratelimit;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Result, WardenError};
pub use guard::{Admission, FailurePolicy, RateLimitGuard};
pub use ratelimit::{Decision, LimiterOptions, Representation, SlidingWindowLimiter};
pub use store::{MemoryStore, SharedCounterStore, StoreError};
