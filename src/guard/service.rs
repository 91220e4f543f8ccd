//! Request admission built on the sliding-window limiter.

use std::sync::Arc;

use futures::future::join_all;
use parking_lot::RwLock;
use tracing::{debug, info, instrument, warn};

use super::admission::{Admission, FailurePolicy, ThrottlerDecision};
use crate::error::{Result, WardenError};
use crate::ratelimit::{secs_to_ms, SlidingWindowLimiter, ThrottlerConfig, ThrottlerRules};

/// Applies every matching throttler to inbound requests.
///
/// The guard owns key derivation (`{caller}:{route}`) and the failure
/// policy; the limiter underneath stays policy-free.
pub struct RateLimitGuard {
    /// The limiter instance
    limiter: Arc<SlidingWindowLimiter>,
    /// Throttlers, replaceable at runtime
    rules: RwLock<ThrottlerRules>,
    failure_policy: FailurePolicy,
}

impl RateLimitGuard {
    /// Create a guard over `limiter`.
    pub fn new(
        limiter: Arc<SlidingWindowLimiter>,
        rules: ThrottlerRules,
        failure_policy: FailurePolicy,
    ) -> Self {
        Self {
            limiter,
            rules: RwLock::new(rules),
            failure_policy,
        }
    }

    /// Replace the throttler rules.
    pub fn set_rules(&self, rules: ThrottlerRules) {
        let mut current = self.rules.write();
        *current = rules;
    }

    /// Get the current rules.
    pub fn rules(&self) -> ThrottlerRules {
        self.rules.read().clone()
    }

    /// The limiter key for a caller on a route.
    pub fn derive_key(caller: &str, route: &str) -> String {
        format!("{}:{}", caller, route)
    }

    /// Record the request against every applicable throttler and decide.
    ///
    /// Store failures resolve through the failure policy. Invalid throttler
    /// settings are returned as errors.
    #[instrument(skip(self), fields(policy = ?self.failure_policy))]
    pub async fn admit(&self, caller: &str, route: &str) -> Result<Admission> {
        let throttlers: Vec<ThrottlerConfig> =
            self.rules.read().applicable(route).cloned().collect();
        let key = Self::derive_key(caller, route);

        debug!(
            key = %key,
            throttler_count = throttlers.len(),
            "Processing admission"
        );

        let mut checks = Vec::with_capacity(throttlers.len());
        for throttler in &throttlers {
            let window_ms = secs_to_ms(throttler.ttl_secs, "window")?;
            let block_ms = secs_to_ms(throttler.block_duration_secs(), "block duration")?;
            checks.push(self.limiter.check_and_record(
                &key,
                window_ms,
                throttler.limit,
                block_ms,
                &throttler.name,
            ));
        }
        let results = join_all(checks).await;

        let mut decisions = Vec::with_capacity(throttlers.len());
        let mut throttled = None;

        for (throttler, result) in throttlers.iter().zip(results) {
            let decision = match result {
                Ok(decision) => decision,
                Err(WardenError::StoreUnavailable(e)) => {
                    let allowed = self.failure_policy == FailurePolicy::Open;
                    warn!(
                        key = %key,
                        throttler = %throttler.name,
                        error = %e,
                        allowed = allowed,
                        "Counter store unavailable, applying failure policy"
                    );
                    return Ok(Admission::Degraded {
                        allowed,
                        reason: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            };

            if decision.is_blocked && throttled.is_none() {
                throttled = Some((throttler.name.clone(), decision));
            }
            decisions.push(ThrottlerDecision {
                throttler: throttler.name.clone(),
                limit: throttler.limit,
                decision,
            });
        }

        if let Some((throttler, decision)) = throttled {
            info!(
                key = %key,
                throttler = %throttler,
                total_hits = decision.total_hits,
                "Request throttled"
            );
            return Ok(Admission::Throttled { throttler, decision });
        }

        Ok(Admission::Allowed { decisions })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ratelimit::LimiterOptions;
    use crate::store::{MemoryStore, SharedCounterStore, StoreError, StoreResult};
    use async_trait::async_trait;
    use std::time::Duration;

    struct UnreachableStore;

    #[async_trait]
    impl SharedCounterStore for UnreachableStore {
        async fn read(&self, _key: &str) -> StoreResult<Option<String>> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn write(&self, _key: &str, _value: &str, _expiry: Duration) -> StoreResult<()> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn compare_and_set(
            &self,
            _key: &str,
            _expected: Option<&str>,
            _value: &str,
            _expiry: Duration,
        ) -> StoreResult<bool> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }
    }

    fn guard_with(
        store: Arc<dyn SharedCounterStore>,
        clock: Arc<ManualClock>,
        throttlers: Vec<ThrottlerConfig>,
        policy: FailurePolicy,
    ) -> RateLimitGuard {
        let limiter = Arc::new(SlidingWindowLimiter::with_options(
            store,
            clock,
            LimiterOptions::default(),
        ));
        let rules = ThrottlerRules::from_throttlers(throttlers).unwrap();
        RateLimitGuard::new(limiter, rules, policy)
    }

    fn memory_guard(throttlers: Vec<ThrottlerConfig>) -> (Arc<ManualClock>, RateLimitGuard) {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let guard = guard_with(store, clock.clone(), throttlers, FailurePolicy::Closed);
        (clock, guard)
    }

    #[tokio::test]
    async fn test_throttles_after_limit() {
        let mut throttler = ThrottlerConfig::new("default", 60, 3);
        throttler.block_duration_secs = Some(30);
        let (_clock, guard) = memory_guard(vec![throttler]);

        for _ in 0..3 {
            let admission = guard.admit("10.0.0.1", "/api/v1/teams").await.unwrap();
            assert!(admission.is_allowed());
        }

        let admission = guard.admit("10.0.0.1", "/api/v1/teams").await.unwrap();
        assert!(!admission.is_allowed());
        assert_eq!(admission.retry_after(), Some(Duration::from_secs(30)));
        match admission {
            Admission::Throttled { throttler, decision } => {
                assert_eq!(throttler, "default");
                assert_eq!(decision.total_hits, 4);
            }
            other => panic!("expected throttled, got {:?}", other),
        }

        // Another caller is unaffected.
        assert!(guard.admit("10.0.0.2", "/api/v1/teams").await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn test_window_elapses() {
        let (clock, guard) = memory_guard(vec![ThrottlerConfig::new("default", 1, 1)]);

        assert!(guard.admit("c", "/r").await.unwrap().is_allowed());
        assert!(!guard.admit("c", "/r").await.unwrap().is_allowed());

        clock.advance(Duration::from_secs(1));
        assert!(guard.admit("c", "/r").await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn test_evaluates_every_applicable_throttler() {
        let mut auth = ThrottlerConfig::new("auth", 60, 1);
        auth.routes = vec!["/auth".to_string()];
        let (_clock, guard) = memory_guard(vec![ThrottlerConfig::new("global", 60, 10), auth]);

        match guard.admit("c", "/auth/login").await.unwrap() {
            Admission::Allowed { decisions } => {
                let names: Vec<_> = decisions.iter().map(|d| d.throttler.as_str()).collect();
                assert_eq!(names, vec!["global", "auth"]);
            }
            other => panic!("expected allowed, got {:?}", other),
        }

        match guard.admit("c", "/auth/login").await.unwrap() {
            Admission::Throttled { throttler, .. } => assert_eq!(throttler, "auth"),
            other => panic!("expected throttled, got {:?}", other),
        }

        // The global throttler still admits other routes.
        assert!(guard.admit("c", "/teams").await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn test_no_applicable_throttlers() {
        let mut scoped = ThrottlerConfig::new("scoped", 60, 1);
        scoped.routes = vec!["/admin".to_string()];
        let (_clock, guard) = memory_guard(vec![scoped]);

        let admission = guard.admit("c", "/public").await.unwrap();
        assert_eq!(admission, Admission::Allowed { decisions: Vec::new() });
    }

    #[tokio::test]
    async fn test_failure_policy() {
        for (policy, expected) in [(FailurePolicy::Open, true), (FailurePolicy::Closed, false)] {
            let guard = guard_with(
                Arc::new(UnreachableStore),
                Arc::new(ManualClock::new(0)),
                vec![ThrottlerConfig::new("default", 60, 10)],
                policy,
            );

            let admission = guard.admit("c", "/r").await.unwrap();
            assert!(matches!(admission, Admission::Degraded { .. }));
            assert_eq!(admission.is_allowed(), expected);
        }
    }

    #[tokio::test]
    async fn test_invalid_throttler_is_an_error() {
        let (_clock, guard) = memory_guard(Vec::new());
        guard.set_rules(ThrottlerRules {
            throttlers: vec![ThrottlerConfig::new("broken", 0, 1)],
        });

        let result = guard.admit("c", "/r").await;
        assert!(matches!(result, Err(WardenError::InvalidConfiguration(_))));
    }

    #[tokio::test]
    async fn test_oversized_throttler_window_is_rejected() {
        let (_clock, guard) = memory_guard(Vec::new());
        let mut huge_block = ThrottlerConfig::new("huge-block", 60, 1);
        huge_block.block_duration_secs = Some(u64::MAX);

        for throttler in [ThrottlerConfig::new("huge-window", u64::MAX, 1), huge_block] {
            guard.set_rules(ThrottlerRules::from_throttlers(vec![throttler]).unwrap());
            let result = guard.admit("c", "/r").await;
            assert!(matches!(result, Err(WardenError::InvalidConfiguration(_))));
        }
    }

    #[tokio::test]
    async fn test_set_rules_replaces_throttlers() {
        let (_clock, guard) = memory_guard(vec![ThrottlerConfig::new("default", 60, 1)]);
        guard.admit("c", "/r").await.unwrap();
        assert!(!guard.admit("c", "/r").await.unwrap().is_allowed());

        let relaxed = ThrottlerConfig::new("relaxed", 60, 100);
        guard.set_rules(ThrottlerRules::from_throttlers(vec![relaxed]).unwrap());
        assert!(guard.admit("c", "/r").await.unwrap().is_allowed());
        assert_eq!(guard.rules().throttlers[0].name, "relaxed");
    }

    #[test]
    fn test_derive_key() {
        assert_eq!(
            RateLimitGuard::derive_key("10.0.0.1", "/api/v1/players"),
            "10.0.0.1:/api/v1/players"
        );
    }
}
