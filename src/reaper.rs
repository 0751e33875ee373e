// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Background Reapers
//!
//! Two periodic tasks that delete expired entries nobody will look up again:
//!
//! - **rate/lockout reaper**: rate-limit windows that have passed, and login
//!   attempt entries idle for more than twice the lockout duration.
//! - **session reaper**: sessions idle past the timeout that were never
//!   re-validated.
//!
//! Reapers only delete. They lock one shard of a table at a time, so a
//! scan never blocks the request path for the whole table. Both stop when
//! the shutdown signal flips to `true` or its sender is dropped.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::security::{LoginAttemptTracker, RateLimiter, SessionRegistry};

/// What one rate/lockout pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLockoutSweep {
    pub rate_entries: usize,
    pub lockout_entries: usize,
}

/// Run one rate/lockout pass now.
pub fn sweep_rate_and_lockout(limiter: &RateLimiter, lockouts: &LoginAttemptTracker) -> RateLockoutSweep {
    let sweep = RateLockoutSweep {
        rate_entries: limiter.reap_expired(),
        lockout_entries: lockouts.reap_stale(),
    };
    if sweep.rate_entries > 0 || sweep.lockout_entries > 0 {
        tracing::debug!(
            target: "reaper",
            event = "RATE_LOCKOUT_SWEEP",
            rate_entries = sweep.rate_entries,
            lockout_entries = sweep.lockout_entries,
            remaining_rate = limiter.tracked(),
            remaining_lockout = lockouts.tracked(),
            "Reaped expired rate-limit and lockout entries"
        );
    }
    sweep
}

/// Run one session pass now. Returns how many sessions were removed.
pub fn sweep_sessions(sessions: &SessionRegistry) -> usize {
    let removed = sessions.reap_expired();
    if removed > 0 {
        tracing::debug!(
            target: "reaper",
            event = "SESSION_SWEEP",
            removed,
            active = sessions.active_count(),
            "Reaped idle sessions"
        );
    }
    removed
}

/// Tick every `period` until shutdown, skipping the immediate first tick.
async fn run_every<F>(period: Duration, mut shutdown: watch::Receiver<bool>, name: &'static str, mut pass: F)
where
    F: FnMut(),
{
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tracing::debug!(target: "reaper", reaper = name, period_secs = period.as_secs_f64(), "Reaper started");
    loop {
        tokio::select! {
            _ = ticker.tick() => pass(),
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    tracing::debug!(target: "reaper", reaper = name, "Reaper stopped");
}

pub fn spawn_rate_lockout_reaper(
    limiter: Arc<RateLimiter>,
    lockouts: Arc<LoginAttemptTracker>,
    period: Duration,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(run_every(period, shutdown, "rate_lockout", move || {
        sweep_rate_and_lockout(&limiter, &lockouts);
    }))
}

pub fn spawn_session_reaper(
    sessions: Arc<SessionRegistry>,
    period: Duration,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(run_every(period, shutdown, "session", move || {
        sweep_sessions(&sessions);
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditEmitter;
    use crate::clock::ManualClock;

    fn parts() -> (Arc<RateLimiter>, Arc<LoginAttemptTracker>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        let limiter = Arc::new(RateLimiter::new(10, chrono::Duration::seconds(60), clock.clone()));
        let lockouts = Arc::new(LoginAttemptTracker::new(5, chrono::Duration::seconds(900), clock.clone()));
        (limiter, lockouts, clock)
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        let (limiter, lockouts, clock) = parts();
        limiter.check_and_consume("1.1.1.1");
        lockouts.record_failure("alice", "1.1.1.1");
        clock.advance_secs(61);
        limiter.check_and_consume("2.2.2.2");

        assert_eq!(
            sweep_rate_and_lockout(&limiter, &lockouts),
            RateLockoutSweep { rate_entries: 1, lockout_entries: 0 }
        );

        clock.advance_secs(1800);
        assert_eq!(
            sweep_rate_and_lockout(&limiter, &lockouts),
            RateLockoutSweep { rate_entries: 1, lockout_entries: 1 }
        );
        assert_eq!(limiter.tracked(), 0);
        assert_eq!(lockouts.tracked(), 0);
    }

    #[tokio::test]
    async fn test_spawned_reapers_run_and_stop() {
        let (limiter, lockouts, clock) = parts();
        let (audit, _rx) = AuditEmitter::channel(8);
        let sessions = Arc::new(SessionRegistry::new(
            chrono::Duration::seconds(1800),
            true,
            clock.clone(),
            audit,
        ));

        limiter.check_and_consume("1.1.1.1");
        sessions.create("user-1", "1.1.1.1");
        clock.advance_secs(3600);

        let (stop_tx, stop_rx) = watch::channel(false);
        let period = Duration::from_millis(10);
        let rate = spawn_rate_lockout_reaper(limiter.clone(), lockouts.clone(), period, stop_rx.clone());
        let session = spawn_session_reaper(sessions.clone(), period, stop_rx);

        tokio::time::timeout(Duration::from_secs(5), async {
            while limiter.tracked() > 0 || sessions.tracked() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("reapers should clear expired entries");

        stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            rate.await.unwrap();
            session.await.unwrap();
        })
        .await
        .expect("reapers should stop on shutdown");
    }

    #[tokio::test]
    async fn test_dropped_sender_stops_reaper() {
        let (limiter, lockouts, _clock) = parts();
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = spawn_rate_lockout_reaper(limiter, lockouts, Duration::from_secs(3600), stop_rx);
        drop(stop_tx);
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("reaper should stop when the signal is gone")
            .unwrap();
    }
}
