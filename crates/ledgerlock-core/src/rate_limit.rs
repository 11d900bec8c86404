//! Brute-force gate for unlock attempts.
//!
//! Five failures open a lockout of `min(5 min * 2^(cycle - 1), 1 h)`.
//! `lockout_count` survives a lockout expiring so repeat offenders escalate;
//! only a verified successful unlock clears it. State lives for the process
//! lifetime and is not persisted.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::sync::{Arc, OnceLock};
use tracing::warn;

use crate::clock::{Clock, SystemClock};
use crate::error::{VaultError, VaultResult};

pub const MAX_FAILED_ATTEMPTS: u32 = 5;
pub const BASE_LOCKOUT_SECS: i64 = 5 * 60;
pub const MAX_LOCKOUT_SECS: i64 = 60 * 60;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttemptRecord {
    pub count: u32,
    pub first_attempt_at: Option<DateTime<Utc>>,
    pub locked_until: Option<DateTime<Utc>>,
    pub lockout_count: u32,
}

impl AttemptRecord {
    fn clear_window(&mut self) {
        self.count = 0;
        self.first_attempt_at = None;
        self.locked_until = None;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitStatus {
    pub failed_attempts: u32,
    pub lockout_count: u32,
    pub locked_out_secs: Option<u64>,
}

/// Lockout length for the given (1-based) lockout cycle.
pub fn lockout_duration(cycle: u32) -> Duration {
    let exponent = cycle.saturating_sub(1).min(16);
    let secs = BASE_LOCKOUT_SECS
        .saturating_mul(1i64 << exponent)
        .min(MAX_LOCKOUT_SECS);
    Duration::seconds(secs)
}

fn remaining_secs(until: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    let ms = (until - now).num_milliseconds().max(0) as u64;
    ms.div_ceil(1000).max(1)
}

pub struct UnlockRateLimiter {
    record: Mutex<AttemptRecord>,
    clock: Arc<dyn Clock>,
}

impl UnlockRateLimiter {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            record: Mutex::new(AttemptRecord::default()),
            clock,
        }
    }

    /// The process-wide limiter.
    pub fn global() -> Arc<UnlockRateLimiter> {
        static GLOBAL: OnceLock<Arc<UnlockRateLimiter>> = OnceLock::new();
        GLOBAL
            .get_or_init(|| Arc::new(UnlockRateLimiter::new(Arc::new(SystemClock))))
            .clone()
    }

    /// Fail with `LockedOut` while a lockout window is open. Once the window
    /// has passed the live counters are cleared (but not `lockout_count`).
    pub fn check(&self) -> VaultResult<()> {
        let now = self.clock.now();
        let mut record = self.record.lock();
        if let Some(until) = record.locked_until {
            if now < until {
                return Err(VaultError::LockedOut {
                    remaining_secs: remaining_secs(until, now),
                });
            }
            record.clear_window();
        }
        Ok(())
    }

    /// Count a failed attempt. Returns the lockout length when this attempt
    /// opened a new lockout.
    pub fn record_failure(&self) -> Option<Duration> {
        let now = self.clock.now();
        let mut record = self.record.lock();
        match record.locked_until {
            // an attempt that was already in flight when the lockout began
            Some(until) if now < until => return None,
            Some(_) => record.clear_window(),
            None => {}
        }
        record.count += 1;
        record.first_attempt_at.get_or_insert(now);
        if record.count < MAX_FAILED_ATTEMPTS {
            return None;
        }
        record.lockout_count += 1;
        let duration = lockout_duration(record.lockout_count);
        record.locked_until = Some(now + duration);
        warn!(
            lockout_count = record.lockout_count,
            lockout_secs = duration.num_seconds(),
            "unlock locked out after repeated failures"
        );
        Some(duration)
    }

    /// Clear everything, including the escalation count. Call only after a
    /// cryptographically verified unlock.
    pub fn reset(&self) {
        *self.record.lock() = AttemptRecord::default();
    }

    pub fn status(&self) -> RateLimitStatus {
        let now = self.clock.now();
        let record = self.record.lock();
        let locked_out_secs = record
            .locked_until
            .filter(|until| now < *until)
            .map(|until| remaining_secs(until, now));
        RateLimitStatus {
            failed_attempts: record.count,
            lockout_count: record.lockout_count,
            locked_out_secs,
        }
    }

    pub fn snapshot(&self) -> AttemptRecord {
        self.record.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn limiter() -> (Arc<ManualClock>, UnlockRateLimiter) {
        let clock = Arc::new(ManualClock::default());
        let limiter = UnlockRateLimiter::new(clock.clone());
        (clock, limiter)
    }

    fn fail_times(limiter: &UnlockRateLimiter, n: u32) -> Option<Duration> {
        let mut last = None;
        for _ in 0..n {
            limiter.check().unwrap();
            last = limiter.record_failure();
        }
        last
    }

    #[test]
    fn four_failures_do_not_lock() {
        let (_clock, limiter) = limiter();
        assert_eq!(fail_times(&limiter, 4), None);
        assert!(limiter.check().is_ok());
        assert_eq!(limiter.status().failed_attempts, 4);
    }

    #[test]
    fn fifth_failure_locks_for_five_minutes() {
        let (clock, limiter) = limiter();
        assert_eq!(fail_times(&limiter, 5), Some(Duration::minutes(5)));
        match limiter.check() {
            Err(VaultError::LockedOut { remaining_secs }) => assert_eq!(remaining_secs, 300),
            other => panic!("expected lockout, got {other:?}"),
        }
        clock.advance(Duration::seconds(299));
        assert_eq!(limiter.check().unwrap_err().lockout_remaining(), Some(1));
        clock.advance(Duration::seconds(1));
        assert!(limiter.check().is_ok());
    }

    #[test]
    fn lockouts_escalate_and_cap() {
        let (clock, limiter) = limiter();
        let mut seen = Vec::new();
        for _ in 0..8 {
            let duration = fail_times(&limiter, 5).unwrap();
            seen.push(duration.num_minutes());
            clock.advance(duration);
        }
        assert_eq!(seen, vec![5, 10, 20, 40, 60, 60, 60, 60]);
        assert_eq!(limiter.snapshot().lockout_count, 8);
    }

    #[test]
    fn expiry_clears_counters_but_not_lockout_count() {
        let (clock, limiter) = limiter();
        fail_times(&limiter, 5);
        clock.advance(Duration::minutes(5));
        limiter.check().unwrap();
        let record = limiter.snapshot();
        assert_eq!(record.count, 0);
        assert_eq!(record.locked_until, None);
        assert_eq!(record.first_attempt_at, None);
        assert_eq!(record.lockout_count, 1);
    }

    #[test]
    fn failure_during_lockout_does_not_extend_it() {
        let (_clock, limiter) = limiter();
        fail_times(&limiter, 5);
        let before = limiter.snapshot();
        assert_eq!(limiter.record_failure(), None);
        assert_eq!(limiter.snapshot(), before);
    }

    #[test]
    fn reset_clears_escalation() {
        let (clock, limiter) = limiter();
        fail_times(&limiter, 5);
        clock.advance(Duration::minutes(5));
        limiter.reset();
        assert_eq!(limiter.snapshot(), AttemptRecord::default());
        assert_eq!(fail_times(&limiter, 5), Some(Duration::minutes(5)));
    }

    #[test]
    fn status_reports_countdown() {
        let (clock, limiter) = limiter();
        fail_times(&limiter, 5);
        clock.advance(Duration::seconds(90));
        let status = limiter.status();
        assert_eq!(status.locked_out_secs, Some(210));
        assert_eq!(status.lockout_count, 1);
    }

    #[test]
    fn duration_table() {
        assert_eq!(lockout_duration(1), Duration::minutes(5));
        assert_eq!(lockout_duration(2), Duration::minutes(10));
        assert_eq!(lockout_duration(4), Duration::minutes(40));
        assert_eq!(lockout_duration(5), Duration::hours(1));
        assert_eq!(lockout_duration(u32::MAX), Duration::hours(1));
    }
}
