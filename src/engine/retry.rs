//! Retry policy with exponential backoff and jitter.

use chrono::{DateTime, Utc};
use rand::Rng;
use std::time::Duration;

use crate::config::WorkerSettings;
use crate::store::saturating_add;

/// Exponential backoff: `base * 2^failures`, capped at `max`, then scaled by
/// a random factor in `[1 - jitter, 1 + jitter]`. Jitter above 1 is treated
/// as 1.
#[derive(Debug, Clone)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(300),
            jitter: 0.2,
        }
    }
}

impl Backoff {
    /// Undelayed, unjittered exponential delay for the given failure count.
    pub fn nominal(&self, failures: u32) -> Duration {
        let multiplier = 2u32.saturating_pow(failures.min(30));
        self.base.saturating_mul(multiplier).min(self.max)
    }

    /// Delay before the next attempt after `failures` failed attempts.
    /// Never zero when `base` is positive.
    pub fn delay(&self, failures: u32) -> Duration {
        let nominal = self.nominal(failures);
        // Also rejects NaN.
        if !(self.jitter > 0.0) || nominal.is_zero() {
            return nominal;
        }
        let jitter = self.jitter.min(1.0);
        let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
        Duration::try_from_secs_f64(nominal.as_secs_f64() * factor)
            .unwrap_or(Duration::MAX)
            .max(Duration::from_millis(1))
    }
}

/// Decides between retrying a failed record and failing it for good.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Failed attempts that are retried. A record gets `max_retries + 1`
    /// attempts in total.
    pub max_retries: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Backoff::default(),
        }
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &WorkerSettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            backoff: Backoff {
                base: Duration::from_millis(settings.backoff_base_ms),
                max: Duration::from_millis(settings.backoff_max_ms),
                jitter: settings.backoff_jitter,
            },
        }
    }

    /// `num_failures` is the count before the attempt that just failed.
    pub fn should_retry(&self, num_failures: u32) -> bool {
        num_failures < self.max_retries
    }

    /// When a record that has failed `num_failures` times before this
    /// attempt may be claimed again.
    pub fn next_attempt_at(&self, num_failures: u32) -> DateTime<Utc> {
        saturating_add(Utc::now(), self.backoff.delay(num_failures))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff(jitter: f64) -> Backoff {
        Backoff {
            base: Duration::from_millis(100),
            max: Duration::from_secs(2),
            jitter,
        }
    }

    #[test]
    fn nominal_delay_doubles_until_capped() {
        let b = backoff(0.0);
        assert_eq!(b.delay(0), Duration::from_millis(100));
        assert_eq!(b.delay(1), Duration::from_millis(200));
        assert_eq!(b.delay(3), Duration::from_millis(800));
        assert_eq!(b.delay(5), Duration::from_secs(2));
        assert_eq!(b.delay(u32::MAX), Duration::from_secs(2));
    }

    #[test]
    fn jittered_delay_stays_in_band() {
        let b = backoff(0.25);
        for failures in 0..6 {
            let nominal = b.nominal(failures).as_secs_f64();
            for _ in 0..50 {
                let d = b.delay(failures).as_secs_f64();
                assert!(d >= nominal * 0.75 - 1e-9, "{d} below band of {nominal}");
                assert!(d <= nominal * 1.25 + 1e-9, "{d} above band of {nominal}");
            }
        }
    }

    #[test]
    fn retry_limit_counts_prior_failures() {
        let policy = RetryPolicy {
            max_retries: 2,
            backoff: backoff(0.0),
        };
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(1));
        assert!(!policy.should_retry(2));
    }

    #[test]
    fn oversized_jitter_is_clamped() {
        let b = backoff(5.0);
        for _ in 0..50 {
            let d = b.delay(2);
            assert!(d >= Duration::from_millis(1));
            assert!(d <= Duration::from_millis(800));
        }
        assert_eq!(backoff(f64::NAN).delay(1), Duration::from_millis(200));
    }

    #[test]
    fn huge_backoff_saturates_instead_of_overflowing() {
        let policy = RetryPolicy {
            max_retries: 1,
            backoff: Backoff {
                base: Duration::MAX,
                max: Duration::MAX,
                jitter: 0.5,
            },
        };
        assert_eq!(policy.next_attempt_at(40), DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn next_attempt_is_in_the_future() {
        let policy = RetryPolicy::default();
        assert!(policy.next_attempt_at(0) > Utc::now());
    }
}
