//! Admission outcomes reported by the guard.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ratelimit::Decision;

/// What to do with a request when the counter store cannot be consulted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Admit the request
    Open,
    /// Reject the request
    #[default]
    Closed,
}

/// One throttler's decision for a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThrottlerDecision {
    pub throttler: String,
    pub limit: u64,
    pub decision: Decision,
}

/// The guard's verdict on a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum Admission {
    /// No applicable throttler is over its limit.
    Allowed { decisions: Vec<ThrottlerDecision> },
    /// The named throttler is over its limit.
    Throttled { throttler: String, decision: Decision },
    /// The store was unavailable; `allowed` follows the failure policy.
    Degraded { allowed: bool, reason: String },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        match self {
            Admission::Allowed { .. } => true,
            Admission::Throttled { .. } => false,
            Admission::Degraded { allowed, .. } => *allowed,
        }
    }

    /// Retry hint for a throttled request.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Admission::Throttled { decision, .. } => decision.retry_after(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_policy_parses_lowercase() {
        let policy: FailurePolicy = serde_yaml::from_str("open").unwrap();
        assert_eq!(policy, FailurePolicy::Open);
        assert_eq!(FailurePolicy::default(), FailurePolicy::Closed);
    }

    #[test]
    fn test_admission_serializes_with_outcome_tag() {
        let admission = Admission::Degraded {
            allowed: true,
            reason: "store unreachable".to_string(),
        };
        let json = serde_json::to_value(&admission).unwrap();
        assert_eq!(json["outcome"], "degraded");
        assert_eq!(json["allowed"], true);
        assert!(admission.is_allowed());
        assert_eq!(admission.retry_after(), None);
    }
}
