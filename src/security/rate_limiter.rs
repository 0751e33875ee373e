// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Fixed-window rate limiter keyed by caller identifier (normally the
//! network origin).
//!
//! The first request after a window has passed opens a new window of
//! `rate_limit_window` with a count of one. Within a window, requests are
//! allowed until the count reaches `rate_limit_capacity`; denied requests do
//! not increment the count or extend the window.
//!
//! Known limitation: a caller can spend a full window's capacity just before
//! a boundary and another full capacity just after it, up to twice the
//! capacity in a short burst. Fixed windows are kept anyway.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;

use crate::clock::Clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitEntry {
    pub count: u32,
    pub window_reset_at: DateTime<Utc>,
}

impl RateLimitEntry {
    /// An entry whose window has passed counts as absent, reaped or not.
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.window_reset_at
    }
}

pub struct RateLimiter {
    entries: DashMap<String, RateLimitEntry>,
    capacity: u32,
    window: Duration,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(capacity: u32, window: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            capacity,
            window,
            clock,
        }
    }

    /// Count one request for `identifier`; returns whether it is allowed.
    pub fn check_and_consume(&self, identifier: &str) -> bool {
        if self.capacity == 0 {
            return false;
        }
        let now = self.clock.now();

        // The shard stays write-locked while `entry` is alive, so the
        // check and the increment are one step for this identifier.
        let allowed = {
            let mut entry = self
                .entries
                .entry(identifier.to_string())
                .or_insert(RateLimitEntry {
                    count: 0,
                    window_reset_at: now,
                });
            if entry.is_expired(now) {
                *entry = RateLimitEntry {
                    count: 1,
                    window_reset_at: now
                        .checked_add_signed(self.window)
                        .unwrap_or(DateTime::<Utc>::MAX_UTC),
                };
                true
            } else if entry.count < self.capacity {
                entry.count += 1;
                true
            } else {
                false
            }
        };

        if !allowed {
            tracing::debug!(
                target: "security::rate_limiter",
                event = "RATE_LIMITED",
                identifier = %identifier,
                capacity = self.capacity,
                "Request denied by rate limiter"
            );
        }
        allowed
    }

    /// Live entry for `identifier`, ignoring expired windows.
    pub fn entry(&self, identifier: &str) -> Option<RateLimitEntry> {
        let now = self.clock.now();
        self.entries
            .get(identifier)
            .map(|entry| *entry.value())
            .filter(|entry| !entry.is_expired(now))
    }

    /// Delete entries whose window has passed. Returns how many were removed.
    pub fn reap_expired(&self) -> usize {
        let now = self.clock.now();
        let mut removed = 0;
        self.entries.retain(|_, entry| {
            let keep = !entry.is_expired(now);
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }

    /// Number of stored entries, including expired ones not yet reaped.
    pub fn tracked(&self) -> usize {
        self.entries.len()
    }
}
