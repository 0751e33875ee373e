// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Login Attempt Tracker
//!
//! Counts failed logins per `(identifier, origin)` pair. Once the count
//! reaches `max_login_attempts` the pair is locked until
//! `lockout_duration` has elapsed since the last failure. A successful login
//! deletes the entry, so the next failure starts again from one.
//!
//! Expiry is lazy: [`LoginAttemptTracker::is_locked`] clears an entry whose
//! lockout has elapsed. Entries that never reach the threshold are left for
//! the reaper, which keeps them for twice the lockout duration so repeated
//! slow guessing remains visible.

use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

use crate::clock::Clock;
use crate::utils::ceil_secs;

/// Composite key. Identifiers are trimmed and lowercased so
/// `Alice@X.com` and `alice@x.com` share a counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LoginKey {
    pub identifier: String,
    pub origin: String,
}

impl LoginKey {
    pub fn new(identifier: &str, origin: &str) -> Self {
        Self {
            identifier: identifier.trim().to_lowercase(),
            origin: origin.trim().to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoginAttemptEntry {
    pub failure_count: u32,
    pub last_failure_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStatus {
    Unlocked,
    Locked { remaining_secs: u64 },
}

impl LockStatus {
    pub fn is_locked(&self) -> bool {
        matches!(self, LockStatus::Locked { .. })
    }
}

pub struct LoginAttemptTracker {
    entries: DashMap<LoginKey, LoginAttemptEntry>,
    max_attempts: u32,
    lockout: Duration,
    clock: Arc<dyn Clock>,
}

impl LoginAttemptTracker {
    pub fn new(max_attempts: u32, lockout: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            max_attempts,
            lockout,
            clock,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn is_locked(&self, identifier: &str, origin: &str) -> LockStatus {
        let key = LoginKey::new(identifier, origin);
        let now = self.clock.now();

        let Entry::Occupied(occupied) = self.entries.entry(key) else {
            return LockStatus::Unlocked;
        };
        let entry = *occupied.get();
        if entry.failure_count < self.max_attempts {
            return LockStatus::Unlocked;
        }
        let elapsed = now - entry.last_failure_at;
        if elapsed < self.lockout {
            let remaining = self.lockout - elapsed;
            return LockStatus::Locked {
                remaining_secs: ceil_secs(remaining.num_milliseconds()),
            };
        }
        let (key, _) = occupied.remove_entry();
        tracing::info!(
            target: "security::lockout",
            event = "LOCKOUT_EXPIRED",
            identifier = %key.identifier,
            origin = %key.origin,
            "Lockout elapsed, entry cleared"
        );
        LockStatus::Unlocked
    }

    pub fn record_success(&self, identifier: &str, origin: &str) {
        let key = LoginKey::new(identifier, origin);
        self.entries.remove(&key);
    }

    /// Count a failure and return the failure count after incrementing.
    pub fn record_failure(&self, identifier: &str, origin: &str) -> u32 {
        let key = LoginKey::new(identifier, origin);
        let now = self.clock.now();

        let count = {
            let mut entry = self.entries.entry(key.clone()).or_insert(LoginAttemptEntry {
                failure_count: 0,
                last_failure_at: now,
            });
            entry.failure_count = entry.failure_count.saturating_add(1);
            entry.last_failure_at = now;
            entry.failure_count
        };

        if count == self.max_attempts {
            tracing::warn!(
                target: "security::lockout",
                event = "ACCOUNT_LOCKED",
                identifier = %key.identifier,
                origin = %key.origin,
                failures = count,
                lockout_secs = self.lockout.num_seconds(),
                "Login lockout engaged"
            );
        }
        count
    }

    /// `success = true` clears the entry; `false` counts a failure.
    /// Returns the post-increment failure count, or 0 on success.
    pub fn record_outcome(&self, identifier: &str, origin: &str, success: bool) -> u32 {
        if success {
            self.record_success(identifier, origin);
            0
        } else {
            self.record_failure(identifier, origin)
        }
    }

    pub fn entry(&self, identifier: &str, origin: &str) -> Option<LoginAttemptEntry> {
        let key = LoginKey::new(identifier, origin);
        self.entries.get(&key).map(|entry| *entry.value())
    }

    /// Delete entries whose last failure is older than twice the lockout.
    pub fn reap_stale(&self) -> usize {
        let now = self.clock.now();
        let grace = self.lockout.checked_mul(2).unwrap_or(self.lockout);
        let mut removed = 0;
        self.entries.retain(|_, entry| {
            let keep = now - entry.last_failure_at <= grace;
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }

    pub fn tracked(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    const ALICE: &str = "alice@x.com";
    const ORIGIN: &str = "1.2.3.4";

    fn tracker() -> (LoginAttemptTracker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        let tracker = LoginAttemptTracker::new(5, Duration::seconds(900), clock.clone());
        (tracker, clock)
    }

    #[test]
    fn test_lockout_after_max_failures_and_expiry() {
        let (tracker, clock) = tracker();
        for expected in 1..=5 {
            assert_eq!(tracker.record_outcome(ALICE, ORIGIN, false), expected);
        }
        assert_eq!(
            tracker.is_locked(ALICE, ORIGIN),
            LockStatus::Locked { remaining_secs: 900 }
        );

        clock.advance_secs(300);
        assert_eq!(
            tracker.is_locked(ALICE, ORIGIN),
            LockStatus::Locked { remaining_secs: 600 }
        );

        clock.advance_secs(600);
        assert_eq!(tracker.is_locked(ALICE, ORIGIN), LockStatus::Unlocked);
        assert!(tracker.entry(ALICE, ORIGIN).is_none(), "lazy expiry clears entry");
    }

    #[test]
    fn test_below_threshold_is_not_locked() {
        let (tracker, _clock) = tracker();
        for _ in 0..4 {
            tracker.record_failure(ALICE, ORIGIN);
        }
        assert!(!tracker.is_locked(ALICE, ORIGIN).is_locked());
        assert_eq!(tracker.entry(ALICE, ORIGIN).unwrap().failure_count, 4);
    }

    #[test]
    fn test_success_restarts_count() {
        let (tracker, _clock) = tracker();
        for _ in 0..4 {
            tracker.record_failure(ALICE, ORIGIN);
        }
        tracker.record_outcome(ALICE, ORIGIN, true);
        assert_eq!(tracker.record_failure(ALICE, ORIGIN), 1);
        assert!(!tracker.is_locked(ALICE, ORIGIN).is_locked());
    }

    #[test]
    fn test_keys_are_per_origin_and_normalized() {
        let (tracker, _clock) = tracker();
        for _ in 0..5 {
            tracker.record_failure(" Alice@X.com ", ORIGIN);
        }
        assert!(tracker.is_locked(ALICE, ORIGIN).is_locked());
        assert!(!tracker.is_locked(ALICE, "5.6.7.8").is_locked());
    }

    #[test]
    fn test_failure_while_locked_restarts_lockout_clock() {
        let (tracker, clock) = tracker();
        for _ in 0..5 {
            tracker.record_failure(ALICE, ORIGIN);
        }
        clock.advance_secs(600);
        tracker.record_failure(ALICE, ORIGIN);
        assert_eq!(
            tracker.is_locked(ALICE, ORIGIN),
            LockStatus::Locked { remaining_secs: 900 }
        );
    }

    #[test]
    fn test_reap_uses_double_lockout_grace() {
        let (tracker, clock) = tracker();
        tracker.record_failure("old@x.com", ORIGIN);
        clock.advance_secs(1000);
        tracker.record_failure("new@x.com", ORIGIN);

        clock.advance_secs(800);
        // old: 1800s == 2 * lockout, not yet strictly older
        assert_eq!(tracker.reap_stale(), 0);

        clock.advance_secs(1);
        assert_eq!(tracker.reap_stale(), 1);
        assert!(tracker.entry("new@x.com", ORIGIN).is_some());
    }

    #[test]
    fn test_reap_with_huge_lockout_does_not_overflow() {
        let clock = Arc::new(ManualClock::starting_now());
        let tracker = LoginAttemptTracker::new(1, Duration::days(100_000_000), clock.clone());
        tracker.record_failure(ALICE, ORIGIN);
        clock.advance_secs(86_400);
        assert_eq!(tracker.reap_stale(), 0);
        assert!(tracker.is_locked(ALICE, ORIGIN).is_locked());
    }
}
