//! Retry delay evaluation.
//!
//! A backoff is a pure function from the 1-based number of the attempt that
//! just failed to the delay before the next one. No jitter is applied, so the
//! same attempt number always produces the same delay.

use std::{fmt, time::Duration};

use hooky_core::BackoffPolicy;

/// Maps a failed attempt number to the delay before retrying.
pub trait Backoff: Send + Sync + fmt::Debug {
    /// Delay after attempt `attempt` (1-based) failed.
    fn delay(&self, attempt: u32) -> Duration;
}

impl Backoff for BackoffPolicy {
    fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Self::Constant { delay_ms } => Duration::from_millis(delay_ms),
            Self::Exponential { min_ms, max_ms, factor } => {
                let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
                let scaled = min_ms as f64 * factor.powi(exponent);
                let capped = if scaled.is_finite() { scaled.min(max_ms as f64) } else { max_ms as f64 };
                Duration::from_millis(capped.round() as u64)
            },
        }
    }
}

/// Wraps a plain function so it can serve as the scheduler's default
/// backoff.
///
/// ```
/// use std::time::Duration;
/// use hooky_scheduler::backoff::{Backoff, FnBackoff};
///
/// let linear = FnBackoff::new(|attempt| Duration::from_secs(u64::from(attempt)));
/// assert_eq!(linear.delay(3), Duration::from_secs(3));
/// ```
pub struct FnBackoff<F>(F);

impl<F> FnBackoff<F>
where
    F: Fn(u32) -> Duration + Send + Sync,
{
    /// Creates a backoff from `f`.
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> fmt::Debug for FnBackoff<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnBackoff")
    }
}

impl<F> Backoff for FnBackoff<F>
where
    F: Fn(u32) -> Duration + Send + Sync,
{
    fn delay(&self, attempt: u32) -> Duration {
        (self.0)(attempt)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn exponential() -> BackoffPolicy {
        BackoffPolicy::Exponential { min_ms: 1_000, max_ms: 60_000, factor: 2.0 }
    }

    #[test]
    fn exponential_doubles_until_capped() {
        let policy = exponential();

        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(2), Duration::from_secs(2));
        assert_eq!(policy.delay(3), Duration::from_secs(4));
        assert_eq!(policy.delay(6), Duration::from_secs(32));
        assert_eq!(policy.delay(7), Duration::from_secs(60));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn constant_ignores_attempt_number() {
        let policy = BackoffPolicy::Constant { delay_ms: 250 };

        assert_eq!(policy.delay(1), Duration::from_millis(250));
        assert_eq!(policy.delay(50), Duration::from_millis(250));
    }

    #[test]
    fn attempt_zero_is_treated_as_first() {
        assert_eq!(exponential().delay(0), exponential().delay(1));
    }

    proptest! {
        #[test]
        fn exponential_is_positive_monotonic_and_bounded(
            min_ms in 1u64..10_000,
            spread in 0u64..1_000_000,
            factor in 1.0f64..8.0,
            attempt in 1u32..200,
        ) {
            let max_ms = min_ms + spread;
            let policy = BackoffPolicy::Exponential { min_ms, max_ms, factor };

            let current = policy.delay(attempt);
            let next = policy.delay(attempt + 1);

            prop_assert!(current > Duration::ZERO);
            prop_assert!(next >= current);
            prop_assert!(current <= Duration::from_millis(max_ms));
            prop_assert_eq!(current, policy.delay(attempt));
        }
    }
}
