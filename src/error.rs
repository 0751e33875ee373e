// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error taxonomy for the security kernel.
//!
//! Security decisions (rate limit, lockout, session, permission) come back
//! as `Err(SecurityError)` values the caller has to match on. Infrastructure
//! failures from the audit sink or alert channel never reach a caller; they
//! are logged through [`sanitize_error_details`] and swallowed by the audit
//! worker.
//!
//! Every variant has a [`SecurityError::user_message`] that is safe to show
//! to an end user: no key material, no session ids, no other users' data.

use chrono::Utc;
use rand::Rng;
use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::sync::LazyLock;
use thiserror::Error;

/// Why a permission check denied the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    /// The role lacks `resource:action`.
    InsufficientPermissions,
    /// The role has the permission but the instance belongs to someone else.
    ResourceAccessDenied,
    /// The profile lookup reported no such user.
    UserNotFound,
}

impl DenialReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InsufficientPermissions => "insufficient permissions",
            Self::ResourceAccessDenied => "access denied to this resource",
            Self::UserNotFound => "user not found",
        }
    }
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session was destroyed before its idle timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RevocationReason {
    /// The session was presented from a different origin than it was bound to.
    OriginMismatch,
    /// Explicit logout.
    Logout,
    /// All sessions of the user were revoked by the surrounding application.
    AdminRevoked,
}

impl RevocationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OriginMismatch => "origin_mismatch",
            Self::Logout => "logout",
            Self::AdminRevoked => "admin_revoked",
        }
    }
}

impl fmt::Display for RevocationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SecurityError {
    #[error("rate limit exceeded")]
    RateLimitExceeded,

    #[error("account locked for another {remaining_secs}s")]
    AccountLocked { remaining_secs: u64 },

    #[error("session not found")]
    SessionNotFound,

    #[error("session expired")]
    SessionExpired,

    #[error("session revoked: {0}")]
    SessionRevoked(RevocationReason),

    #[error("permission denied: {0}")]
    PermissionDenied(DenialReason),

    #[error("encryption failed")]
    EncryptionError,

    #[error("decryption failed")]
    DecryptionError,

    #[error("profile lookup failed")]
    ProfileLookupFailed,
}

impl SecurityError {
    /// Human-readable message safe to display to the end user.
    pub fn user_message(&self) -> String {
        match self {
            Self::RateLimitExceeded => "Rate limit exceeded, please try again later".to_string(),
            Self::AccountLocked { remaining_secs } => {
                let minutes = remaining_secs.div_ceil(60).max(1);
                format!("Account locked, try again in {} minutes", minutes)
            }
            Self::SessionNotFound | Self::SessionExpired => {
                "Your session has expired. Please sign in again.".to_string()
            }
            Self::SessionRevoked(_) => {
                "Your session has ended. Please sign in again.".to_string()
            }
            Self::PermissionDenied(reason) => {
                let mut msg = reason.as_str().to_string();
                if let Some(first) = msg.get_mut(0..1) {
                    first.make_ascii_uppercase();
                }
                msg
            }
            Self::EncryptionError | Self::DecryptionError => {
                "The protected field could not be processed.".to_string()
            }
            Self::ProfileLookupFailed => {
                "Authorization is temporarily unavailable. Please try again later.".to_string()
            }
        }
    }

    /// True for variants that represent a deliberate security decision
    /// rather than a processing failure.
    pub fn is_denial(&self) -> bool {
        !matches!(self, Self::EncryptionError | Self::DecryptionError)
    }
}

/// Failure reported by an external collaborator (profile store, event sink,
/// alert channel).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PortError {
    #[error("not found")]
    NotFound,

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("deadline of {0}ms exceeded")]
    Timeout(u64),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("encryption key is missing; set GATEKEEPER_ENCRYPTION_KEY or encryption_key")]
    MissingKey,

    #[error("encryption key is invalid: {0}")]
    InvalidKey(String),

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("could not determine home directory")]
    NoHomeDir,
}

/// Generate a unique error reference code for log correlation.
/// Format: ERR-YYYYMMDD-XXXXXX (e.g., ERR-20240115-A3F8K2)
pub fn generate_reference_code() -> String {
    let date = Utc::now().format("%Y%m%d");
    let mut rng = rand::thread_rng();
    let chars: Vec<char> = "ABCDEFGHJKLMNPQRSTUVWXYZ23456789".chars().collect();
    let random: String = (0..6)
        .map(|_| chars[rng.gen_range(0..chars.len())])
        .collect();
    format!("ERR-{}-{}", date, random)
}

/// Patterns stripped from infrastructure error strings before they are logged.
/// JUSTIFICATION for .expect(): static patterns, exercised by the sanitize tests.
static SANITIZE_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    vec![
        (Regex::new(r"[A-Za-z]:\\[^\s]+").expect("Windows path regex"), "[PATH_REDACTED]"),
        (Regex::new(r"/(?:home|usr|var|etc|opt|tmp|root)/[^\s]+").expect("Unix path regex"), "[PATH_REDACTED]"),
        (Regex::new(r"(?i)(?:postgres|mysql|mongodb|redis|sqlite)://[^\s]+").expect("DB URL regex"), "[DB_CONN_REDACTED]"),
        (Regex::new(r"(?i)password=[^\s;]+").expect("Password regex"), "password=[REDACTED]"),
        (Regex::new(r"Bearer [a-zA-Z0-9._~+/-]+=*").expect("Bearer token regex"), "Bearer [TOKEN_REDACTED]"),
        (Regex::new(r"at [^\s]+\.rs:\d+:\d+").expect("Rust location regex"), "[LOCATION_REDACTED]"),
        (Regex::new(r"\b[A-Za-z0-9]{40,}\b").expect("Long secret regex"), "[SECRET_REDACTED]"),
    ]
});

/// Remove paths, connection strings, tokens and code locations from an
/// error string before it is written to the local log.
pub fn sanitize_error_details(error: &str) -> String {
    let mut result = error.to_string();
    for (pattern, replacement) in SANITIZE_PATTERNS.iter() {
        result = pattern.replace_all(&result, *replacement).to_string();
    }
    result
}
