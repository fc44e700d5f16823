//! Throttle policy: how much to delay a dispatch given remaining capacity.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Shape of the delay curve over the utilization overshoot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// Delay grows linearly from `min_delay_ms` to `max_delay_ms`.
    Linear,
    /// Delay grows geometrically from `min_delay_ms` to `max_delay_ms`.
    Exponential,
}

/// Throttle configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottleConfig {
    /// Below this fraction of remaining capacity, apply delay. 0.8 means
    /// "start throttling once less than 20% of the budget is left".
    pub target_utilization: f64,

    /// Floor for any applied delay.
    pub min_delay_ms: u64,

    /// Ceiling for any applied delay.
    pub max_delay_ms: u64,

    pub backoff_strategy: BackoffStrategy,

    /// If true, sleep until reset when capacity is 0; if false, fail fast.
    pub block_on_limit: bool,

    /// Statuses older than this are considered stale and re-fetched.
    pub status_ttl_ms: u64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            target_utilization: 0.8,
            min_delay_ms: 100,
            max_delay_ms: 30_000,
            backoff_strategy: BackoffStrategy::Exponential,
            block_on_limit: true,
            status_ttl_ms: 60_000,
        }
    }
}

impl ThrottleConfig {
    /// Delay for a dispatch given the overall remaining capacity fraction.
    ///
    /// Returns `Duration::ZERO` when remaining capacity is at or above the
    /// throttle threshold `1 - target_utilization`; otherwise a delay within
    /// `[min_delay_ms, max_delay_ms]` scaled by how deep into the reserve the
    /// budget has sunk.
    pub fn delay_for(&self, overall_remaining: f64) -> Duration {
        let threshold = (1.0 - self.target_utilization).clamp(0.0, 1.0);
        if overall_remaining >= threshold || threshold == 0.0 {
            return Duration::ZERO;
        }

        // 0.0 just under the threshold, 1.0 at full exhaustion.
        let overshoot = ((threshold - overall_remaining) / threshold).clamp(0.0, 1.0);

        let min = self.min_delay_ms as f64;
        let max = self.max_delay_ms.max(self.min_delay_ms) as f64;
        let delay_ms = match self.backoff_strategy {
            BackoffStrategy::Linear => min + (max - min) * overshoot,
            BackoffStrategy::Exponential => {
                if min <= 0.0 {
                    max * overshoot
                } else {
                    min * (max / min).powf(overshoot)
                }
            }
        };

        Duration::from_millis(delay_ms.clamp(min, max) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(strategy: BackoffStrategy) -> ThrottleConfig {
        ThrottleConfig {
            target_utilization: 0.8,
            min_delay_ms: 100,
            max_delay_ms: 10_000,
            backoff_strategy: strategy,
            block_on_limit: false,
            status_ttl_ms: 60_000,
        }
    }

    #[test]
    fn test_no_delay_above_threshold() {
        let cfg = config(BackoffStrategy::Linear);
        assert_eq!(cfg.delay_for(0.9), Duration::ZERO);
        assert_eq!(cfg.delay_for(0.2), Duration::ZERO);
    }

    #[test]
    fn test_delay_within_bounds_below_threshold() {
        for strategy in [BackoffStrategy::Linear, BackoffStrategy::Exponential] {
            let cfg = config(strategy);
            for remaining in [0.19, 0.1, 0.05, 0.01, 0.001] {
                let delay = cfg.delay_for(remaining);
                assert!(delay >= Duration::from_millis(cfg.min_delay_ms));
                assert!(delay <= Duration::from_millis(cfg.max_delay_ms));
            }
        }
    }

    #[test]
    fn test_linear_delay_grows_with_overshoot() {
        let cfg = config(BackoffStrategy::Linear);
        let shallow = cfg.delay_for(0.15);
        let deep = cfg.delay_for(0.02);
        assert!(deep > shallow);
    }

    #[test]
    fn test_exponential_reaches_max_at_exhaustion() {
        let cfg = config(BackoffStrategy::Exponential);
        let delay = cfg.delay_for(0.0);
        assert_eq!(delay, Duration::from_millis(cfg.max_delay_ms));
    }

    #[test]
    fn test_full_target_utilization_never_delays() {
        let cfg = ThrottleConfig {
            target_utilization: 1.0,
            ..config(BackoffStrategy::Linear)
        };
        assert_eq!(cfg.delay_for(0.5), Duration::ZERO);
    }
}
