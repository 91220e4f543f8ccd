//! Request admission guard.
//!
//! Sits between a request-handling layer and the limiter: derives keys,
//! evaluates the configured throttlers, and applies the fail-open or
//! fail-closed policy when the store is unavailable.

mod admission;
mod service;

pub use admission::{Admission, FailurePolicy, ThrottlerDecision};
pub use service::RateLimitGuard;
