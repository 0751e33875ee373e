// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Session Registry
//!
//! Active sessions keyed by an unguessable id. A session has exactly two
//! ways to end:
//!
//! - **Active → Expired**: more than `session_timeout` passed since the last
//!   validated access.
//! - **Active → Revoked**: origin mismatch under strict binding, explicit
//!   logout, or revocation of all of a user's sessions.
//!
//! Ending a session removes it from the table. Ids are 256 random bits, so a
//! removed id is never handed out again and a session cannot be revived;
//! there is no renew operation, continued validation keeps it alive.
//!
//! ## Audit
//!
//! | Transition           | Event kind            | Severity |
//! |----------------------|-----------------------|----------|
//! | idle expiry (inline) | `session_expired`     | low      |
//! | origin mismatch      | `suspicious_activity` | high     |

use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::rngs::OsRng;
use rand::RngCore;
use std::sync::Arc;

use crate::audit::{AuditEmitter, EventKind, SecurityEvent, Severity};
use crate::clock::Clock;
use crate::error::{RevocationReason, SecurityError};
use crate::utils::mask_sensitive;

/// Bytes of OS randomness per session id (hex-encoded to 64 chars).
const SESSION_ID_BYTES: usize = 32;

/// Characters of a session id that may appear in logs.
const LOG_PREFIX: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub session_id: String,
    pub user_id: String,
    pub origin_address: String,
    pub last_activity_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Session {
    fn is_idle_expired(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        now - self.last_activity_at > timeout
    }
}

fn generate_session_id() -> String {
    let mut bytes = [0u8; SESSION_ID_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

enum Validation {
    Valid(String),
    Missing,
    Expired(Session),
    OriginMismatch(Session),
}

pub struct SessionRegistry {
    sessions: DashMap<String, Session>,
    timeout: Duration,
    strict_origin_binding: bool,
    clock: Arc<dyn Clock>,
    audit: AuditEmitter,
}

impl SessionRegistry {
    pub fn new(
        timeout: Duration,
        strict_origin_binding: bool,
        clock: Arc<dyn Clock>,
        audit: AuditEmitter,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            timeout,
            strict_origin_binding,
            clock,
            audit,
        }
    }

    /// Create a session bound to `origin` and return its id.
    pub fn create(&self, user_id: &str, origin: &str) -> String {
        let now = self.clock.now();
        let session_id = generate_session_id();
        let session = Session {
            session_id: session_id.clone(),
            user_id: user_id.to_string(),
            origin_address: origin.to_string(),
            last_activity_at: now,
            created_at: now,
        };
        self.sessions.insert(session_id.clone(), session);

        tracing::info!(
            target: "security::session",
            event = "SESSION_CREATED",
            session = %mask_sensitive(&session_id, LOG_PREFIX),
            user = %user_id,
            origin = %origin,
            "Session created"
        );
        session_id
    }

    /// Validate `session_id` presented from `origin`, bumping its activity
    /// on success. Returns the bound user id.
    pub fn validate(&self, session_id: &str, origin: &str) -> Result<String, SecurityError> {
        let now = self.clock.now();

        let outcome = match self.sessions.entry(session_id.to_string()) {
            Entry::Vacant(_) => Validation::Missing,
            Entry::Occupied(mut occupied) => {
                let session = occupied.get();
                if session.is_idle_expired(now, self.timeout) {
                    Validation::Expired(occupied.remove())
                } else if self.strict_origin_binding && session.origin_address != origin {
                    Validation::OriginMismatch(occupied.remove())
                } else {
                    let session = occupied.get_mut();
                    session.last_activity_at = now;
                    Validation::Valid(session.user_id.clone())
                }
            }
        };

        match outcome {
            Validation::Valid(user_id) => Ok(user_id),
            Validation::Missing => Err(SecurityError::SessionNotFound),
            Validation::Expired(session) => {
                let idle = now - session.last_activity_at;
                tracing::info!(
                    target: "security::session",
                    event = "SESSION_EXPIRED",
                    session = %mask_sensitive(session_id, LOG_PREFIX),
                    user = %session.user_id,
                    idle_secs = idle.num_seconds(),
                    "Session expired on validation"
                );
                self.audit.record(
                    SecurityEvent::new(EventKind::SessionExpired, Severity::Low, origin, now)
                        .actor(session.user_id.as_str())
                        .detail("idle_secs", idle.num_seconds())
                        .detail("session_age_secs", (now - session.created_at).num_seconds()),
                );
                Err(SecurityError::SessionExpired)
            }
            Validation::OriginMismatch(session) => {
                tracing::warn!(
                    target: "security::session",
                    event = "SESSION_ORIGIN_MISMATCH",
                    session = %mask_sensitive(session_id, LOG_PREFIX),
                    user = %session.user_id,
                    bound_origin = %session.origin_address,
                    request_origin = %origin,
                    "Session presented from a different origin; revoked"
                );
                self.audit.record(
                    SecurityEvent::new(EventKind::SuspiciousActivity, Severity::High, origin, now)
                        .actor(session.user_id.as_str())
                        .detail("reason", RevocationReason::OriginMismatch.as_str())
                        .detail("bound_origin", session.origin_address.as_str())
                        .detail("request_origin", origin),
                );
                Err(SecurityError::SessionRevoked(RevocationReason::OriginMismatch))
            }
        }
    }

    /// End a session explicitly. Returns false if it did not exist.
    pub fn revoke(&self, session_id: &str, reason: RevocationReason) -> bool {
        match self.sessions.remove(session_id) {
            Some((_, session)) => {
                tracing::info!(
                    target: "security::session",
                    event = "SESSION_REVOKED",
                    session = %mask_sensitive(session_id, LOG_PREFIX),
                    user = %session.user_id,
                    reason = %reason,
                    "Session revoked"
                );
                true
            }
            None => false,
        }
    }

    /// Revoke every session of `user_id`. Returns how many were removed.
    pub fn revoke_user(&self, user_id: &str) -> usize {
        let mut removed = 0;
        self.sessions.retain(|_, session| {
            let keep = session.user_id != user_id;
            if !keep {
                removed += 1;
            }
            keep
        });
        if removed > 0 {
            tracing::info!(
                target: "security::session",
                event = "SESSIONS_REVOKED_FOR_USER",
                user = %user_id,
                count = removed,
                reason = %RevocationReason::AdminRevoked,
                "All sessions for user revoked"
            );
        }
        removed
    }

    /// Snapshot of a session without touching its activity time.
    pub fn get(&self, session_id: &str) -> Option<Session> {
        self.sessions.get(session_id).map(|session| session.value().clone())
    }

    /// Delete sessions idle longer than the timeout that no validation has
    /// caught. Returns how many were removed.
    pub fn reap_expired(&self) -> usize {
        let now = self.clock.now();
        let timeout = self.timeout;
        let mut removed = 0;
        self.sessions.retain(|_, session| {
            let keep = !session.is_idle_expired(now, timeout);
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }

    /// Sessions that are still within their idle timeout.
    pub fn active_count(&self) -> usize {
        let now = self.clock.now();
        let timeout = self.timeout;
        self.sessions
            .iter()
            .filter(|session| !session.value().is_idle_expired(now, timeout))
            .count()
    }

    /// Stored sessions, including idle ones not yet reaped.
    pub fn tracked(&self) -> usize {
        self.sessions.len()
    }
}
