//! Retry, backoff and dead-letter policy.
//!
//! After a failed attempt the job's `attempts` is incremented. If the new count
//! exceeds `max_retries` the job is dead-lettered, otherwise it is rescheduled
//! `backoff_base ^ attempts` seconds into the future (no jitter, no cap beyond
//! what a timestamp can represent).

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::{QueueError, QueueResult};

/// Backoff base used when the setting is absent or unusable.
pub const DEFAULT_BACKOFF_BASE: f64 = 2.0;

/// Largest delay ever produced (~136 years).
const MAX_BACKOFF_SECS: f64 = u32::MAX as f64;

/// Outcome of routing a failed attempt through the policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDecision {
    /// Back to `pending`, eligible again after `delay`.
    Retry { attempts: u32, delay: Duration },
    /// Retry budget exhausted; move to `dead`.
    Dead { attempts: u32 },
}

impl FailureDecision {
    pub fn attempts(&self) -> u32 {
        match self {
            FailureDecision::Retry { attempts, .. } | FailureDecision::Dead { attempts } => *attempts,
        }
    }

    /// `next_run_at` for a retry decided at `now`; `None` for dead jobs.
    pub fn next_run_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            FailureDecision::Retry { delay, .. } => {
                let delay = chrono::Duration::from_std(*delay).unwrap_or(chrono::Duration::MAX);
                Some(now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC))
            }
            FailureDecision::Dead { .. } => None,
        }
    }
}

/// Exponential backoff policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    backoff_base: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_base: DEFAULT_BACKOFF_BASE,
        }
    }
}

impl RetryPolicy {
    /// Build a policy; the base must be a finite positive number.
    pub fn with_base(backoff_base: f64) -> QueueResult<Self> {
        if !backoff_base.is_finite() || backoff_base <= 0.0 {
            return Err(QueueError::config(format!(
                "backoff_base must be a positive number, got {backoff_base}"
            )));
        }
        Ok(Self { backoff_base })
    }

    pub fn backoff_base(&self) -> f64 {
        self.backoff_base
    }

    /// Delay imposed before attempt number `attempts + 1`.
    pub fn backoff_for(&self, attempts: u32) -> Duration {
        let exponent = i32::try_from(attempts).unwrap_or(i32::MAX);
        let secs = self.backoff_base.powi(exponent);
        if !secs.is_finite() || secs >= MAX_BACKOFF_SECS {
            return Duration::from_secs_f64(MAX_BACKOFF_SECS);
        }
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Route a failed attempt given the attempt count *before* this failure.
    pub fn decide(&self, previous_attempts: u32, max_retries: u32) -> FailureDecision {
        let attempts = previous_attempts.saturating_add(1);
        if attempts > max_retries {
            FailureDecision::Dead { attempts }
        } else {
            FailureDecision::Retry {
                attempts,
                delay: self.backoff_for(attempts),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    #[test]
    fn base_two_doubles_per_attempt() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_for(1), Duration::from_secs(2));
        assert_eq!(policy.backoff_for(2), Duration::from_secs(4));
        assert_eq!(policy.backoff_for(3), Duration::from_secs(8));
    }

    #[test]
    fn dead_only_after_exceeding_max_retries() {
        let policy = RetryPolicy::default();
        assert!(matches!(policy.decide(0, 2), FailureDecision::Retry { attempts: 1, .. }));
        assert!(matches!(policy.decide(1, 2), FailureDecision::Retry { attempts: 2, .. }));
        assert_eq!(policy.decide(2, 2), FailureDecision::Dead { attempts: 3 });
    }

    #[test]
    fn zero_max_retries_dies_on_first_failure() {
        assert_eq!(
            RetryPolicy::default().decide(0, 0),
            FailureDecision::Dead { attempts: 1 }
        );
    }

    #[test]
    fn rejects_unusable_bases() {
        assert!(RetryPolicy::with_base(0.0).is_err());
        assert!(RetryPolicy::with_base(-2.0).is_err());
        assert!(RetryPolicy::with_base(f64::NAN).is_err());
        assert!(RetryPolicy::with_base(3.0).is_ok());
    }

    #[test]
    fn huge_attempt_counts_saturate() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_for(10_000), Duration::from_secs(u64::from(u32::MAX)));
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let decision = FailureDecision::Retry {
            attempts: 10_000,
            delay: policy.backoff_for(10_000),
        };
        assert!(decision.next_run_at(now).unwrap() > now);
    }

    #[test]
    fn retry_next_run_at_adds_delay() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let decision = RetryPolicy::default().decide(2, 5);
        assert_eq!(decision.next_run_at(now), Some(now + chrono::Duration::seconds(8)));
        assert_eq!(FailureDecision::Dead { attempts: 6 }.next_run_at(now), None);
    }

    proptest! {
        #[test]
        fn backoff_grows_with_attempts(base in 1.01f64..3.0, attempts in 1u32..15) {
            let policy = RetryPolicy::with_base(base).unwrap();
            prop_assert!(policy.backoff_for(attempts + 1) > policy.backoff_for(attempts));
        }

        #[test]
        fn attempts_always_increment(prev in 0u32..1000, max in 0u32..1000) {
            let decision = RetryPolicy::default().decide(prev, max);
            prop_assert_eq!(decision.attempts(), prev + 1);
            prop_assert_eq!(matches!(decision, FailureDecision::Dead { .. }), prev + 1 > max);
        }
    }
}
