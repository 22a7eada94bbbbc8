//! Engine configuration.

use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Exponential backoff with a bounded number of attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,

    /// Delay before the second attempt (milliseconds)
    pub initial_interval_ms: u64,

    /// Upper bound for a single delay (milliseconds)
    pub max_interval_ms: u64,

    /// Growth factor between delays
    pub multiplier: f64,
}

impl RetryPolicy {
    pub fn initial_interval(&self) -> Duration {
        Duration::from_millis(self.initial_interval_ms)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms)
    }

    /// Tight policy for tests: quick retries, few attempts.
    #[cfg(test)]
    pub fn fast(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_interval_ms: 1,
            max_interval_ms: 5,
            multiplier: 2.0,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_interval_ms: 250,
            max_interval_ms: 8_000,
            multiplier: 2.0,
        }
    }
}

/// Configuration for trader monitors and client mirrors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Pause between two position fetches of one trader (milliseconds)
    pub poll_interval_ms: u64,

    /// Retries for trader and client position fetches
    pub fetch_retry: RetryPolicy,

    /// Retries for corrective orders
    pub order_retry: RetryPolicy,

    /// Deltas buffered per trader before a slow mirror lags and resyncs
    pub event_buffer: usize,

    /// Lot step used when the venue does not report one
    pub default_lot_size: Decimal,
}

impl EngineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[cfg(test)]
    pub fn fast() -> Self {
        Self {
            poll_interval_ms: 5,
            fetch_retry: RetryPolicy::fast(3),
            order_retry: RetryPolicy::fast(3),
            event_buffer: 64,
            default_lot_size: dec!(0.001),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2_000,
            fetch_retry: RetryPolicy::default(),
            order_retry: RetryPolicy {
                max_attempts: 3,
                ..RetryPolicy::default()
            },
            event_buffer: 256,
            default_lot_size: dec!(0.001),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_keeps_defaults() {
        let cfg: EngineConfig =
            serde_json::from_str(r#"{"poll_interval_ms": 500, "order_retry": {"max_attempts": 7}}"#)
                .unwrap();

        assert_eq!(cfg.poll_interval(), Duration::from_millis(500));
        assert_eq!(cfg.order_retry.max_attempts, 7);
        assert_eq!(cfg.order_retry.initial_interval_ms, 250);
        assert_eq!(cfg.fetch_retry, RetryPolicy::default());
        assert_eq!(cfg.default_lot_size, dec!(0.001));
    }
}
