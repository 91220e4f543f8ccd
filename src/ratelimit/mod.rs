//! Rate limiting logic and window state.

mod decision;
mod key;
mod limiter;
mod record;
mod rules;

pub use decision::Decision;
pub use key::StorageKey;
pub use limiter::{secs_to_ms, LimiterOptions, SlidingWindowLimiter, DEFAULT_CLIENT_ID};
pub use record::{
    BucketCounter, Representation, TransformOutcome, WindowRecord, WindowTransform,
};
pub use rules::{ThrottlerConfig, ThrottlerRules};
