//! Backoff schedule for failed vendor calls

use std::time::{Duration, SystemTime};

use crate::error::AdapterError;

/// How many times a failed command is attempted and how the wait between
/// attempts grows
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of execute attempts (first try included)
    pub max_attempts: u32,
    /// Starting delay; each subsequent attempt doubles it
    pub base_delay: Duration,
    /// Ceiling on any single delay, vendor hints included
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// The wait before retry number `attempt` (zero-based)
    ///
    /// A vendor-provided hint (a 429 Retry-After) takes precedence over
    /// the exponential schedule but is still capped at `max_delay`.
    #[must_use]
    pub fn delay(&self, attempt: u32, vendor_hint: Option<Duration>) -> Duration {
        if let Some(hint) = vendor_hint {
            return hint.min(self.max_delay);
        }
        let scheduled = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay);
        scheduled.mul_f64(1.0 + jitter_fraction()).min(self.max_delay)
    }
}

/// Backoff before retrying a failed adapter call, or `None` when the
/// failure class is not worth retrying
///
/// `Rejected` and `Malformed` never retry; `AuthExpired` is handled out of
/// band by a transparent re-initialize and gets no backoff slot either.
/// `RateLimited` carries the vendor's own wait hint into the schedule.
#[must_use]
pub fn backoff_for(
    policy: &RetryPolicy,
    attempt: u32,
    error: &AdapterError,
) -> Option<Duration> {
    match error {
        AdapterError::DeviceUnreachable => Some(policy.delay(attempt, None)),
        AdapterError::RateLimited { retry_after } => Some(policy.delay(attempt, *retry_after)),
        AdapterError::AuthExpired | AdapterError::Rejected { .. } | AdapterError::Malformed => {
            None
        }
    }
}

// 0..0.25 from the subsecond clock, enough spread to keep a fleet of
// gateways off a vendor's lockstep
fn jitter_fraction() -> f64 {
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    f64::from(nanos % 1_000) / 4_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(base_ms: u64, max_secs: u64) -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_secs(max_secs),
        }
    }

    #[test]
    fn vendor_hint_overrides_the_schedule_up_to_the_cap() {
        let p = policy(500, 5);
        let hinted = backoff_for(
            &p,
            0,
            &AdapterError::RateLimited {
                retry_after: Some(Duration::from_secs(2)),
            },
        );
        assert_eq!(hinted, Some(Duration::from_secs(2)));

        let oversized = backoff_for(
            &p,
            0,
            &AdapterError::RateLimited {
                retry_after: Some(Duration::from_secs(90)),
            },
        );
        assert_eq!(oversized, Some(p.max_delay));
    }

    #[test]
    fn unreachable_follows_the_doubling_schedule() {
        let p = policy(100, 60);
        let unreachable = AdapterError::DeviceUnreachable;

        for (attempt, floor_ms) in [(0, 100), (1, 200), (2, 400)] {
            let d = backoff_for(&p, attempt, &unreachable)
                .unwrap_or_else(|| panic!("attempt {attempt} must back off"));
            assert!(d >= Duration::from_millis(floor_ms), "attempt {attempt}: {d:?}");
            // Jitter adds at most a quarter on top
            assert!(
                d <= Duration::from_millis(floor_ms + floor_ms / 4),
                "attempt {attempt}: {d:?}"
            );
        }
    }

    #[test]
    fn deep_attempts_stay_under_the_ceiling() {
        let p = policy(10_000, 15);
        for attempt in 0..12 {
            let d = p.delay(attempt, None);
            assert!(d <= p.max_delay, "attempt {attempt}: {d:?}");
        }
    }

    #[test]
    fn terminal_failures_get_no_backoff() {
        let p = RetryPolicy::default();
        assert!(backoff_for(&p, 0, &AdapterError::Malformed).is_none());
        assert!(
            backoff_for(
                &p,
                0,
                &AdapterError::Rejected {
                    vendor_reason: "bolt jammed".into()
                }
            )
            .is_none()
        );
        assert!(backoff_for(&p, 0, &AdapterError::AuthExpired).is_none());
    }

    #[test]
    fn rate_limit_without_a_hint_still_backs_off() {
        let p = policy(50, 60);
        let d = backoff_for(&p, 1, &AdapterError::RateLimited { retry_after: None });
        assert!(d.is_some_and(|d| d >= Duration::from_millis(100)));
    }
}
