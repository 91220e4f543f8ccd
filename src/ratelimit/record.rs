//! Persisted window state and the transform applied on every hit.

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WardenError};

/// How a key's window is stored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Representation {
    /// Exact sliding-window log of hit timestamps.
    #[default]
    Log,
    /// Approximate sliding-window counter over two aligned buckets.
    Counter,
}

impl Representation {
    /// Name used on the wire (Redis script argument, config files).
    pub fn as_str(&self) -> &'static str {
        match self {
            Representation::Log => "log",
            Representation::Counter => "counter",
        }
    }
}

/// Two-bucket counter state.
///
/// `start` is aligned to a multiple of the window length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketCounter {
    /// Start of the current bucket (epoch ms)
    pub start: u64,
    /// Hits counted in the current bucket
    pub current: u64,
    /// Hits counted in the bucket immediately before `start`
    pub previous: u64,
}

/// The stored state for one namespaced key.
///
/// Serialized as a JSON array of timestamps (log) or a JSON object (counter).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WindowRecord {
    Log(VecDeque<u64>),
    Counter(BucketCounter),
}

impl WindowRecord {
    /// Parse a raw stored value.
    pub fn decode(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| WardenError::StoreCorruptState {
            reason: e.to_string(),
        })
    }

    /// Serialize for storage.
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| WardenError::StoreCorruptState {
            reason: e.to_string(),
        })
    }

    pub fn representation(&self) -> Representation {
        match self {
            WindowRecord::Log(_) => Representation::Log,
            WindowRecord::Counter(_) => Representation::Counter,
        }
    }

    /// Hits counted at `now_ms` and the time until that count can next decrease.
    pub fn tally(&self, now_ms: u64, window_ms: u64) -> (u64, u64) {
        match self {
            WindowRecord::Log(hits) => {
                let reset = hits
                    .front()
                    .map(|&oldest| window_ms.saturating_sub(now_ms.saturating_sub(oldest)))
                    .unwrap_or(0);
                (hits.len() as u64, reset)
            }
            WindowRecord::Counter(counter) => {
                let elapsed = now_ms.saturating_sub(counter.start).min(window_ms);
                let weighted = (counter.previous as u128 * (window_ms - elapsed) as u128)
                    / window_ms as u128;
                let reset = counter
                    .start
                    .saturating_add(window_ms)
                    .saturating_sub(now_ms)
                    .min(window_ms);
                (counter.current + weighted as u64, reset)
            }
        }
    }
}

/// The read-modify-write applied to a key for one hit: trim what has aged
/// out of the window, then record `now_ms`.
///
/// Stores that execute transforms natively must reproduce [`apply`](Self::apply).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowTransform {
    pub now_ms: u64,
    pub window_ms: u64,
    pub representation: Representation,
}

/// Result of applying a [`WindowTransform`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformOutcome {
    /// The record to persist
    pub record: WindowRecord,
    /// The previous value could not be parsed and was discarded
    pub recovered_corrupt: bool,
}

impl WindowTransform {
    pub fn new(now_ms: u64, window_ms: u64, representation: Representation) -> Self {
        Self {
            now_ms,
            window_ms,
            representation,
        }
    }

    /// Store-level expiry for the written record.
    ///
    /// The counter keeps its previous bucket alive for weighting, so it
    /// lives for two windows.
    pub fn expiry(&self) -> Duration {
        match self.representation {
            Representation::Log => Duration::from_millis(self.window_ms),
            Representation::Counter => Duration::from_millis(self.window_ms.saturating_mul(2)),
        }
    }

    /// Apply to a raw stored value.
    pub fn apply(&self, current: Option<&str>) -> TransformOutcome {
        let (previous, recovered_corrupt) = match current.map(WindowRecord::decode) {
            None => (None, false),
            Some(Ok(record)) => (Some(record), false),
            Some(Err(_)) => (None, true),
        };

        TransformOutcome {
            record: self.apply_record(previous),
            recovered_corrupt,
        }
    }

    /// Apply to an already-decoded record. A record of the other
    /// representation is dropped.
    pub fn apply_record(&self, previous: Option<WindowRecord>) -> WindowRecord {
        let now = self.now_ms;
        let window = self.window_ms;

        match self.representation {
            Representation::Log => {
                let mut hits = match previous {
                    Some(WindowRecord::Log(hits)) => hits,
                    _ => VecDeque::new(),
                };
                hits.retain(|&t| now.saturating_sub(t) < window);

                // Keep sorted when another process's clock ran ahead of ours.
                let at = hits.partition_point(|&t| t <= now);
                hits.insert(at, now);
                WindowRecord::Log(hits)
            }
            Representation::Counter => {
                let bucket = now - now % window;
                let mut counter = match previous {
                    Some(WindowRecord::Counter(counter)) => counter,
                    _ => BucketCounter {
                        start: bucket,
                        current: 0,
                        previous: 0,
                    },
                };

                if bucket <= counter.start {
                    counter.current += 1;
                } else if bucket == counter.start.saturating_add(window) {
                    counter.previous = counter.current;
                    counter.current = 1;
                    counter.start = bucket;
                } else {
                    counter.previous = 0;
                    counter.current = 1;
                    counter.start = bucket;
                }
                WindowRecord::Counter(counter)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log(hits: &[u64]) -> WindowRecord {
        WindowRecord::Log(hits.iter().copied().collect())
    }

    #[test]
    fn test_decode_log_matches_legacy_layout() {
        let record = WindowRecord::decode("[1700000000000,1700000001000]").unwrap();
        assert_eq!(record, log(&[1_700_000_000_000, 1_700_000_001_000]));
        assert_eq!(record.encode().unwrap(), "[1700000000000,1700000001000]");
    }

    #[test]
    fn test_decode_counter() {
        let record = WindowRecord::decode(r#"{"start":20000,"current":4,"previous":2}"#).unwrap();
        assert_eq!(
            record,
            WindowRecord::Counter(BucketCounter {
                start: 20_000,
                current: 4,
                previous: 2
            })
        );
        assert_eq!(record.representation(), Representation::Counter);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        for raw in ["not json", "[1.5]", "[-3]", "\"text\"", "{\"start\":1}"] {
            assert!(
                matches!(
                    WindowRecord::decode(raw),
                    Err(WardenError::StoreCorruptState { .. })
                ),
                "{raw} should be corrupt"
            );
        }
    }

    #[test]
    fn test_log_trims_aged_hits() {
        let transform = WindowTransform::new(10_000, 10_000, Representation::Log);
        let outcome = transform.apply(Some("[0,4000,8000]"));

        assert!(!outcome.recovered_corrupt);
        assert_eq!(outcome.record, log(&[4_000, 8_000, 10_000]));
        assert_eq!(outcome.record.tally(10_000, 10_000), (3, 4_000));
    }

    #[test]
    fn test_log_inserts_in_order_under_skew() {
        let transform = WindowTransform::new(5_000, 60_000, Representation::Log);
        let record = transform.apply_record(Some(log(&[4_000, 6_000])));
        assert_eq!(record, log(&[4_000, 5_000, 6_000]));
    }

    #[test]
    fn test_corrupt_value_restarts_record() {
        let transform = WindowTransform::new(42, 1_000, Representation::Log);
        let outcome = transform.apply(Some("{{{"));

        assert!(outcome.recovered_corrupt);
        assert_eq!(outcome.record, log(&[42]));
    }

    #[test]
    fn test_representation_switch_is_not_corruption() {
        let transform = WindowTransform::new(25_000, 10_000, Representation::Log);
        let outcome = transform.apply(Some(r#"{"start":20000,"current":9,"previous":0}"#));

        assert!(!outcome.recovered_corrupt);
        assert_eq!(outcome.record, log(&[25_000]));
    }

    #[test]
    fn test_counter_rolls_buckets() {
        let window = 10_000;
        let mut record = None;
        for now in [20_000, 21_000, 22_000, 23_000, 25_000] {
            let transform = WindowTransform::new(now, window, Representation::Counter);
            record = Some(transform.apply_record(record));
        }
        assert_eq!(record.as_ref().unwrap().tally(25_000, window), (5, 5_000));

        // Next bucket: previous is weighted by the unelapsed share of the window.
        let rolled =
            WindowTransform::new(32_000, window, Representation::Counter).apply_record(record);
        assert_eq!(
            rolled,
            WindowRecord::Counter(BucketCounter {
                start: 30_000,
                current: 1,
                previous: 5
            })
        );
        assert_eq!(rolled.tally(32_000, window), (5, 8_000));

        // Skipping a whole bucket forgets the previous one.
        let skipped = WindowTransform::new(55_000, window, Representation::Counter)
            .apply_record(Some(rolled));
        assert_eq!(skipped.tally(55_000, window), (1, 5_000));
    }

    #[test]
    fn test_counter_expiry_covers_two_windows() {
        let log_transform = WindowTransform::new(0, 1_500, Representation::Log);
        let counter_transform = WindowTransform::new(0, 1_500, Representation::Counter);

        assert_eq!(log_transform.expiry(), Duration::from_millis(1_500));
        assert_eq!(counter_transform.expiry(), Duration::from_millis(3_000));
    }
}
