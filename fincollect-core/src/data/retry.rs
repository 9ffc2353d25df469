//! Exponential backoff for transient fetch failures.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::source::FetchError;

/// How many times to attempt a fetch and how long to wait in between.
///
/// `max_attempts` counts the first try: the default of 3 allows two retries.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Scale each delay by a random factor in `[0.5, 1.0]`.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts. Used by tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay_ms: 0,
            max_delay_ms: 0,
            multiplier: 1.0,
            jitter: false,
        }
    }

    /// Whether another attempt is allowed after `attempt` (1-based) failed with `err`.
    pub fn should_retry(&self, attempt: u32, err: &FetchError) -> bool {
        err.is_transient() && attempt < self.max_attempts
    }

    /// Delay before retry number `retry` (1-based), without jitter.
    pub fn base_delay(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(32) as i32;
        let ms = self.base_delay_ms as f64 * self.multiplier.max(1.0).powi(exp);
        Duration::from_millis(ms.min(self.max_delay_ms as f64) as u64)
    }

    /// Delay before retry number `retry`, honouring a provider's retry-after hint.
    pub fn delay_for(&self, retry: u32, err: &FetchError) -> Duration {
        self.delay_with(retry, err, &mut rand::thread_rng())
    }

    pub fn delay_with<R: Rng + ?Sized>(&self, retry: u32, err: &FetchError, rng: &mut R) -> Duration {
        let mut delay = self.base_delay(retry);
        if self.jitter && !delay.is_zero() {
            delay = delay.mul_f64(rng.gen_range(0.5..=1.0));
        }
        if let FetchError::RateLimited { retry_after_secs } = err {
            let hint = Duration::from_secs(*retry_after_secs);
            delay = delay.max(hint).min(Duration::from_millis(self.max_delay_ms));
        }
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn timeout() -> FetchError {
        FetchError::Timeout("slow".into())
    }

    #[test]
    fn exponential_growth_is_capped() {
        let policy = RetryPolicy {
            max_delay_ms: 1_500,
            jitter: false,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.base_delay(1), Duration::from_millis(500));
        assert_eq!(policy.base_delay(2), Duration::from_millis(1_000));
        assert_eq!(policy.base_delay(3), Duration::from_millis(1_500));
        assert_eq!(policy.base_delay(30), Duration::from_millis(1_500));
    }

    #[test]
    fn only_transient_errors_within_budget_are_retried() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(1, &timeout()));
        assert!(policy.should_retry(2, &timeout()));
        assert!(!policy.should_retry(3, &timeout()));
        assert!(!policy.should_retry(
            1,
            &FetchError::EntityNotFound {
                entity: "NOPE".into()
            }
        ));
    }

    #[test]
    fn jitter_stays_within_half_to_full_delay() {
        let policy = RetryPolicy::default();
        let mut rng = StdRng::seed_from_u64(7);
        for retry in 1..=3 {
            let full = policy.base_delay(retry);
            let d = policy.delay_with(retry, &timeout(), &mut rng);
            assert!(d <= full && d >= full / 2, "{d:?} vs {full:?}");
        }
    }

    #[test]
    fn retry_after_hint_is_honoured_up_to_the_cap() {
        let policy = RetryPolicy {
            jitter: false,
            ..RetryPolicy::default()
        };
        let limited = FetchError::RateLimited { retry_after_secs: 10 };
        assert_eq!(policy.delay_for(1, &limited), Duration::from_secs(10));

        let long = FetchError::RateLimited { retry_after_secs: 600 };
        assert_eq!(policy.delay_for(1, &long), Duration::from_secs(30));
    }

    #[test]
    fn immediate_policy_never_waits() {
        let policy = RetryPolicy::immediate(3);
        assert_eq!(policy.delay_for(2, &timeout()), Duration::ZERO);
    }
}
