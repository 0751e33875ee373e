// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Security Components
//!
//! The individual controls the kernel composes. Each owns its table (a
//! `DashMap`, so per-key updates hold only that key's shard) and is the only
//! code that mutates it.
//!
//! | Component                | Keyed by                 | Expires                       |
//! |--------------------------|--------------------------|-------------------------------|
//! | [`RateLimiter`]          | origin                   | end of fixed window           |
//! | [`LoginAttemptTracker`]  | (identifier, origin)     | lockout, or 2x lockout idle   |
//! | [`SessionRegistry`]      | session id               | idle timeout                  |
//! | [`AccessController`]     | (stateless)              |                               |
//! | [`CryptoService`]        | (stateless)              |                               |
//!
//! ## Usage
//!
//! ```
//! use gatekeeper::clock::ManualClock;
//! use gatekeeper::security::RateLimiter;
//! use std::sync::Arc;
//!
//! let clock = Arc::new(ManualClock::starting_now());
//! let limiter = RateLimiter::new(2, chrono::Duration::seconds(60), clock.clone());
//!
//! assert!(limiter.check_and_consume("1.2.3.4"));
//! assert!(limiter.check_and_consume("1.2.3.4"));
//! assert!(!limiter.check_and_consume("1.2.3.4"));
//!
//! clock.advance_secs(60);
//! assert!(limiter.check_and_consume("1.2.3.4"));
//! ```

pub mod access;
pub mod crypto;
pub mod lockout;
pub mod locks;
pub mod password;
pub mod rate_limiter;
pub mod session_registry;

pub use access::{AccessController, RolePermissionTable, RolePermissionTableBuilder, SUPER_ROLE};
pub use crypto::{CryptoService, EncryptionKey};
pub use lockout::{LockStatus, LoginAttemptEntry, LoginAttemptTracker, LoginKey};
pub use locks::{resilient_lock, resilient_read, resilient_write};
pub use password::{PasswordPolicy, PasswordViolation};
pub use rate_limiter::{RateLimitEntry, RateLimiter};
pub use session_registry::{Session, SessionRegistry};
