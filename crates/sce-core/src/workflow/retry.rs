//! Retry schedule for node external calls.
//!
//! Stateless: all logic lives in associated functions that take the policy
//! as a parameter. The durable host drives the loop; this module only
//! answers "retry again?" and "how long to wait first?" deterministically.

use std::time::Duration;

use sce_types::workflow::RetryPolicy;

/// Stateless retry handler for node call failures.
pub struct RetryHandler;

impl RetryHandler {
    /// Determine whether another attempt is allowed.
    ///
    /// `attempt` is 1-based (first execution is attempt 1). A policy with
    /// `max_attempts == 0` is treated as a single attempt.
    pub fn should_retry(policy: &RetryPolicy, attempt: u32) -> bool {
        attempt < policy.max_attempts.max(1)
    }

    /// Delay to wait after failed attempt `attempt` (1-based).
    ///
    /// `min(initial * coefficient^(attempt - 1), max)`.
    pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let coefficient = if policy.backoff_coefficient.is_finite() && policy.backoff_coefficient >= 1.0 {
            policy.backoff_coefficient
        } else {
            1.0
        };
        let raw = policy.initial_interval_ms as f64 * coefficient.powi(exponent);
        let capped = raw.min(policy.max_interval_ms as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// The full sequence of delays between attempts.
    pub fn schedule(policy: &RetryPolicy) -> Vec<Duration> {
        (1..policy.max_attempts.max(1))
            .map(|attempt| Self::backoff_delay(policy, attempt))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
