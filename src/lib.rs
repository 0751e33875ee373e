// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! gatekeeper - in-process security kernel
//!
//! Login throttling, account lockout, session lifecycle, role-based
//! authorization, field encryption and security auditing for an application
//! that handles its own pages and records but delegates every security
//! decision here.
//!
//! # Core Modules
//!
//! - [`kernel`] - [`SecurityKernel`], the facade the application calls
//! - [`security`] - rate limiter, lockout tracker, session registry, access
//!   control, crypto
//! - [`audit`] - non-blocking event recording with alert fan-out
//! - [`reaper`] - periodic eviction of expired entries
//! - [`ports`] - traits for the profile store, event sink and alert channel
//! - [`config`] - tunables loaded from `~/.gatekeeper/config.json`
//! - [`clock`] - injectable time source
//! - [`error`] - error taxonomy and safe user messages

pub mod audit;
pub mod clock;
pub mod config;
pub mod error;
pub mod kernel;
pub mod ports;
pub mod reaper;
pub mod security;
pub mod utils;

pub use audit::{AuditEmitter, AuditStats, EventKind, SecurityEvent, Severity};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::SecurityConfig;
pub use error::{ConfigError, DenialReason, PortError, RevocationReason, SecurityError};
pub use kernel::{KernelStats, SecurityKernel, SecurityKernelBuilder};
pub use ports::{AlertChannel, EventSink, Profile, ProfileLookup};
pub use security::{EncryptionKey, PasswordViolation, RolePermissionTable};
