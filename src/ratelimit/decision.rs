//! The result of recording one hit.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Outcome of one `check_and_record` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    /// Hits in the trailing window, including this one
    pub total_hits: u64,
    /// `total_hits > limit`
    pub is_blocked: bool,
    /// Milliseconds until the oldest counted hit leaves the window
    pub window_reset_ms: u64,
    /// The configured block duration when blocked, else zero
    pub block_expires_ms: u64,
}

impl Decision {
    /// Hits still allowed before the limit is exceeded.
    pub fn remaining(&self, limit: u64) -> u64 {
        limit.saturating_sub(self.total_hits)
    }

    /// How long a blocked caller should wait before retrying.
    ///
    /// Returns `None` when the hit was allowed.
    pub fn retry_after(&self) -> Option<Duration> {
        if !self.is_blocked {
            return None;
        }
        let wait = if self.block_expires_ms > 0 {
            self.block_expires_ms
        } else {
            self.window_reset_ms
        };
        Some(Duration::from_millis(wait))
    }
}
