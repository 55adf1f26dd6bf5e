//! Deadline computation for analysis units.

use std::time::Duration;

/// `constant + factor * expected`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeoutPolicy {
    /// Multiplier applied to the expected test time.
    pub factor: f32,
    /// Fixed allowance added on top.
    pub constant: Duration,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            factor: 1.25,
            constant: Duration::from_millis(4000),
        }
    }
}

impl TimeoutPolicy {
    pub fn new(factor: f32, constant_ms: u64) -> Self {
        Self {
            factor,
            constant: Duration::from_millis(constant_ms),
        }
    }

    /// Deadline for tests expected to take `expected_ms` in total.
    pub fn timeout_for(&self, expected_ms: u64) -> Duration {
        let scaled = (expected_ms as f64 * f64::from(self.factor.max(0.0))).round();
        self.constant + Duration::from_millis(scaled as u64)
    }
}
