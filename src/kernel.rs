// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Security Kernel
//!
//! The single entry point the surrounding application calls. A kernel owns
//! every security table, the audit worker and both reapers; there is no
//! global state. Build one at startup, share it behind an `Arc`, and call
//! [`SecurityKernel::shutdown`] before exit.
//!
//! ## Usage
//!
//! ```no_run
//! use gatekeeper::config::SecurityConfig;
//! use gatekeeper::kernel::SecurityKernel;
//! use gatekeeper::ports::{Profile, StaticProfileLookup};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let profiles = StaticProfileLookup::new().with_profile("u-1", Profile::new("manager"));
//! let kernel = SecurityKernel::builder(SecurityConfig::with_generated_key())
//!     .profiles(Arc::new(profiles))
//!     .start()?;
//!
//! kernel.admit_login("alice@x.com", "1.2.3.4")?;
//! // ... verify the credentials against the identity store ...
//! let session = kernel.record_login_outcome("alice@x.com", "1.2.3.4", true, Some("u-1"));
//!
//! if let Some(session_id) = session {
//!     let user = kernel.check_session(&session_id, "1.2.3.4")?;
//!     kernel.authorize(&user, "invoice", "read", None).await?;
//! }
//! kernel.shutdown().await;
//! # Ok(())
//! # }
//! ```

use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::audit::{AuditEmitter, AuditStats, AuditWorker, EventKind, SecurityEvent, Severity};
use crate::clock::{Clock, SystemClock};
use crate::config::SecurityConfig;
use crate::error::{generate_reference_code, ConfigError, RevocationReason, SecurityError};
use crate::ports::{AlertChannel, EventSink, NullEventSink, ProfileLookup, StaticProfileLookup, TracingAlertChannel};
use crate::reaper::{spawn_rate_lockout_reaper, spawn_session_reaper};
use crate::security::locks::resilient_lock;
use crate::security::{
    AccessController, CryptoService, LockStatus, LoginAttemptTracker, PasswordPolicy,
    PasswordViolation, RateLimiter, RolePermissionTable, SessionRegistry,
};

/// Origin recorded for checks made without a network origin.
const NO_ORIGIN: &str = "-";

/// Point-in-time table sizes and audit counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct KernelStats {
    pub rate_limit_entries: usize,
    pub lockout_entries: usize,
    pub active_sessions: usize,
    pub audit: AuditStats,
}

struct Background {
    shutdown_tx: watch::Sender<bool>,
    reapers: Vec<JoinHandle<()>>,
    audit_worker: AuditWorker,
}

pub struct SecurityKernel {
    config: Arc<SecurityConfig>,
    clock: Arc<dyn Clock>,
    rate_limiter: Arc<RateLimiter>,
    lockouts: Arc<LoginAttemptTracker>,
    sessions: Arc<SessionRegistry>,
    access: AccessController,
    crypto: CryptoService,
    password_policy: PasswordPolicy,
    audit: AuditEmitter,
    background: Mutex<Option<Background>>,
}

pub struct SecurityKernelBuilder {
    config: SecurityConfig,
    clock: Arc<dyn Clock>,
    profiles: Option<Arc<dyn ProfileLookup>>,
    sink: Arc<dyn EventSink>,
    alerts: Arc<dyn AlertChannel>,
    roles: RolePermissionTable,
    reapers: bool,
}

impl SecurityKernelBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn profiles(mut self, profiles: Arc<dyn ProfileLookup>) -> Self {
        self.profiles = Some(profiles);
        self
    }

    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn alert_channel(mut self, alerts: Arc<dyn AlertChannel>) -> Self {
        self.alerts = alerts;
        self
    }

    pub fn roles(mut self, roles: RolePermissionTable) -> Self {
        self.roles = roles;
        self
    }

    /// Skip spawning the reapers (the sweeps can still be run by hand
    /// through [`crate::reaper`]).
    pub fn without_reapers(mut self) -> Self {
        self.reapers = false;
        self
    }

    /// Validate the config and start the kernel. Spawns the audit worker
    /// and reapers, so this must run inside a tokio runtime.
    pub fn start(self) -> Result<SecurityKernel, ConfigError> {
        self.config.validate()?;
        let key = self.config.encryption_key.as_ref().ok_or(ConfigError::MissingKey)?;
        let crypto = CryptoService::new(key);
        let config = Arc::new(self.config);
        let clock = self.clock;

        let profiles = self.profiles.unwrap_or_else(|| {
            tracing::warn!(
                target: "kernel",
                event = "NO_PROFILE_LOOKUP",
                "No profile lookup configured; every authorization will deny"
            );
            let empty: Arc<dyn ProfileLookup> = Arc::new(StaticProfileLookup::new());
            empty
        });

        let (audit, audit_worker) = AuditEmitter::spawn(
            config.audit_queue_capacity,
            self.sink,
            self.alerts,
            config.external_call_timeout(),
        );

        let rate_limiter = Arc::new(RateLimiter::new(
            config.rate_limit_capacity,
            config.rate_limit_window(),
            clock.clone(),
        ));
        let lockouts = Arc::new(LoginAttemptTracker::new(
            config.max_login_attempts,
            config.lockout_duration(),
            clock.clone(),
        ));
        let sessions = Arc::new(SessionRegistry::new(
            config.session_timeout(),
            config.strict_origin_binding,
            clock.clone(),
            audit.clone(),
        ));
        let access = AccessController::new(
            self.roles,
            profiles,
            audit.clone(),
            clock.clone(),
            config.external_call_timeout(),
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut reapers = Vec::new();
        if self.reapers {
            reapers.push(spawn_rate_lockout_reaper(
                rate_limiter.clone(),
                lockouts.clone(),
                config.rate_reaper_interval(),
                shutdown_rx.clone(),
            ));
            reapers.push(spawn_session_reaper(
                sessions.clone(),
                config.session_reaper_interval(),
                shutdown_rx,
            ));
        }

        tracing::info!(
            target: "kernel",
            event = "KERNEL_STARTED",
            max_login_attempts = config.max_login_attempts,
            session_timeout_secs = config.session_timeout_secs,
            rate_limit = %format!("{}/{}s", config.rate_limit_capacity, config.rate_limit_window_secs),
            strict_origin_binding = config.strict_origin_binding,
            reapers = reapers.len(),
            "Security kernel started"
        );

        Ok(SecurityKernel {
            password_policy: PasswordPolicy::from_config(&config),
            config,
            clock,
            rate_limiter,
            lockouts,
            sessions,
            access,
            crypto,
            audit,
            background: Mutex::new(Some(Background {
                shutdown_tx,
                reapers,
                audit_worker,
            })),
        })
    }
}

impl SecurityKernel {
    pub fn builder(config: SecurityConfig) -> SecurityKernelBuilder {
        SecurityKernelBuilder {
            config,
            clock: Arc::new(SystemClock),
            profiles: None,
            sink: Arc::new(NullEventSink),
            alerts: Arc::new(TracingAlertChannel),
            roles: RolePermissionTable::default(),
            reapers: true,
        }
    }

    pub fn config(&self) -> &SecurityConfig {
        &self.config
    }

    pub fn roles(&self) -> &RolePermissionTable {
        self.access.table()
    }

    /// Gate a login attempt before credentials are checked.
    ///
    /// The rate limit (keyed by origin) is consumed first; a locked
    /// `(identifier, origin)` pair is rejected after that.
    pub fn admit_login(&self, identifier: &str, origin: &str) -> Result<(), SecurityError> {
        if !self.rate_limiter.check_and_consume(origin) {
            self.audit.record(
                SecurityEvent::new(EventKind::LoginAttempt, Severity::Medium, origin, self.clock.now())
                    .actor(identifier)
                    .detail("outcome", "rate_limited"),
            );
            return Err(SecurityError::RateLimitExceeded);
        }

        if let LockStatus::Locked { remaining_secs } = self.lockouts.is_locked(identifier, origin) {
            self.audit.record(
                SecurityEvent::new(EventKind::LoginAttempt, Severity::Medium, origin, self.clock.now())
                    .actor(identifier)
                    .detail("outcome", "account_locked")
                    .detail("remaining_secs", remaining_secs),
            );
            return Err(SecurityError::AccountLocked { remaining_secs });
        }
        Ok(())
    }

    /// Record the result of a credential check.
    ///
    /// On success the pair's failures are forgiven and, when `user_id` is
    /// given, a session bound to `origin` is created and its id returned.
    /// On failure the failure count grows; the audit event is `high` once the
    /// count reaches `max_login_attempts`.
    pub fn record_login_outcome(
        &self,
        identifier: &str,
        origin: &str,
        success: bool,
        user_id: Option<&str>,
    ) -> Option<String> {
        let now = self.clock.now();

        if success {
            self.lockouts.record_success(identifier, origin);
            let session_id = user_id.map(|user| self.sessions.create(user, origin));
            self.audit.record(
                SecurityEvent::new(EventKind::LoginAttempt, Severity::Low, origin, now)
                    .actor(user_id.unwrap_or(identifier))
                    .detail("outcome", "success")
                    .detail("identifier", identifier)
                    .detail("session_created", session_id.is_some()),
            );
            return session_id;
        }

        let failures = self.lockouts.record_failure(identifier, origin);
        let max = self.lockouts.max_attempts();
        let locked = failures >= max;
        let severity = if locked { Severity::High } else { Severity::Medium };
        self.audit.record(
            SecurityEvent::new(EventKind::LoginFailure, severity, origin, now)
                .actor(identifier)
                .detail("failure_count", failures)
                .detail("max_attempts", max)
                .detail("locked", locked),
        );
        None
    }

    /// Validate a session presented from `origin`; returns its user id.
    pub fn check_session(&self, session_id: &str, origin: &str) -> Result<String, SecurityError> {
        self.sessions.validate(session_id, origin)
    }

    pub async fn authorize(
        &self,
        user_id: &str,
        resource: &str,
        action: &str,
        resource_id: Option<&str>,
    ) -> Result<(), SecurityError> {
        self.access
            .authorize(user_id, resource, action, resource_id, NO_ORIGIN)
            .await
    }

    /// [`SecurityKernel::authorize`] with the request origin attached to any
    /// audit event.
    pub async fn authorize_from(
        &self,
        origin: &str,
        user_id: &str,
        resource: &str,
        action: &str,
        resource_id: Option<&str>,
    ) -> Result<(), SecurityError> {
        self.access
            .authorize(user_id, resource, action, resource_id, origin)
            .await
    }

    /// [`SecurityKernel::authorize_from`] with the profile lookup bounded by
    /// `deadline` instead of `external_call_timeout_ms`. Running out of time
    /// denies with [`SecurityError::ProfileLookupFailed`].
    pub async fn authorize_with_deadline(
        &self,
        origin: &str,
        deadline: std::time::Duration,
        user_id: &str,
        resource: &str,
        action: &str,
        resource_id: Option<&str>,
    ) -> Result<(), SecurityError> {
        self.access
            .authorize_with_deadline(user_id, resource, action, resource_id, origin, deadline)
            .await
    }

    pub fn encrypt_field(&self, plaintext: &str) -> Result<String, SecurityError> {
        self.crypto.encrypt_str(plaintext).inspect_err(|e| {
            tracing::error!(
                target: "kernel",
                event = "FIELD_ENCRYPT_FAILED",
                reference = %generate_reference_code(),
                "{}", e
            );
        })
    }

    pub fn decrypt_field(&self, token: &str) -> Result<String, SecurityError> {
        self.crypto.decrypt_str(token).inspect_err(|e| {
            tracing::error!(
                target: "kernel",
                event = "FIELD_DECRYPT_FAILED",
                reference = %generate_reference_code(),
                "{}", e
            );
        })
    }

    /// End a session explicitly. Returns false if it did not exist.
    pub fn logout(&self, session_id: &str) -> bool {
        self.sessions.revoke(session_id, RevocationReason::Logout)
    }

    /// Revoke every session of `user_id`, e.g. after a credential change.
    pub fn revoke_user_sessions(&self, user_id: &str) -> usize {
        self.sessions.revoke_user(user_id)
    }

    pub fn check_password_policy(&self, password: &str) -> Result<(), Vec<PasswordViolation>> {
        self.password_policy.check(password)
    }

    /// Record an event raised by the surrounding application.
    pub fn record_event(&self, event: SecurityEvent) {
        self.audit.record(event);
    }

    pub fn stats(&self) -> KernelStats {
        KernelStats {
            rate_limit_entries: self.rate_limiter.tracked(),
            lockout_entries: self.lockouts.tracked(),
            active_sessions: self.sessions.active_count(),
            audit: self.audit.stats(),
        }
    }

    /// Stop the reapers and drain the audit queue. Later calls return the
    /// current counters without waiting. Events recorded after shutdown are
    /// dropped and counted.
    pub async fn shutdown(&self) -> AuditStats {
        let background = resilient_lock(&self.background).take();
        let Some(background) = background else {
            return self.audit.stats();
        };

        // Receivers are gone only if the reapers already exited.
        let _ = background.shutdown_tx.send(true);
        for reaper in background.reapers {
            if let Err(e) = reaper.await {
                tracing::error!(target: "kernel", event = "REAPER_PANIC", "Reaper ended abnormally: {}", e);
            }
        }
        let stats = background.audit_worker.shutdown().await;
        tracing::info!(
            target: "kernel",
            event = "KERNEL_STOPPED",
            persisted = stats.persisted,
            dropped = stats.dropped,
            "Security kernel stopped"
        );
        stats
    }
}
