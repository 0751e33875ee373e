// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Role-Based Access Control
//!
//! Authorization runs in two stages, always in this order:
//!
//! 1. **Role permission**: the caller's role must grant `resource:action`,
//!    directly or through `resource:*` or `*:*`. The super-role skips every
//!    check.
//! 2. **Instance ownership**: for ownership-checked resources, when a
//!    resource id is given and the role is ownership-scoped, the profile must
//!    own that id.
//!
//! The profile lookup is an external call bounded by a deadline. A timeout
//! or backend failure denies (`ProfileLookupFailed`); a missing user denies
//! with "user not found".
//!
//! ## Default Roles
//!
//! | Role         | Permissions                                                |
//! |--------------|------------------------------------------------------------|
//! | `admin`      | everything (super-role)                                    |
//! | `manager`    | `customer:*` `invoice:*` `report:*` `schedule:*`           |
//! | `technician` | `customer:read` `schedule:read` `schedule:update` `inspection:*` |
//! | `customer`   | `customer:read` `customer:update` `invoice:read` (own record only) |

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

use crate::audit::{AuditEmitter, EventKind, SecurityEvent, Severity};
use crate::clock::Clock;
use crate::error::{DenialReason, PortError, SecurityError};
use crate::ports::ProfileLookup;

pub const SUPER_ROLE: &str = "admin";
const WILDCARD: &str = "*";

/// Static role → permission mapping. Immutable once built.
#[derive(Debug, Clone)]
pub struct RolePermissionTable {
    roles: BTreeMap<String, BTreeSet<String>>,
    super_role: String,
    ownership_scoped_roles: HashSet<String>,
    ownership_resources: HashSet<String>,
}

impl Default for RolePermissionTable {
    fn default() -> Self {
        Self::builder()
            .super_role(SUPER_ROLE)
            .role("manager", ["customer:*", "invoice:*", "report:*", "schedule:*"])
            .role(
                "technician",
                ["customer:read", "schedule:read", "schedule:update", "inspection:*"],
            )
            .role("customer", ["customer:read", "customer:update", "invoice:read"])
            .ownership_scoped("customer")
            .ownership_checked_resource("customer")
            .build()
    }
}

impl RolePermissionTable {
    pub fn builder() -> RolePermissionTableBuilder {
        RolePermissionTableBuilder::default()
    }

    pub fn super_role(&self) -> &str {
        &self.super_role
    }

    pub fn is_super_role(&self, role: &str) -> bool {
        role == self.super_role
    }

    /// Whether `role` grants `resource:action`, directly or by wildcard.
    pub fn grants(&self, role: &str, resource: &str, action: &str) -> bool {
        if self.is_super_role(role) {
            return true;
        }
        let Some(permissions) = self.roles.get(role) else {
            return false;
        };
        let exact = format!("{}:{}", resource, action);
        let resource_wide = format!("{}:{}", resource, WILDCARD);
        let global = format!("{}:{}", WILDCARD, WILDCARD);
        permissions.contains(&exact)
            || permissions.contains(&resource_wide)
            || permissions.contains(&global)
    }

    fn requires_ownership(&self, role: &str, resource: &str) -> bool {
        self.ownership_resources.contains(resource) && self.ownership_scoped_roles.contains(role)
    }

    /// Roles and their permissions in name order.
    pub fn roles(&self) -> impl Iterator<Item = (&str, &BTreeSet<String>)> {
        self.roles.iter().map(|(role, perms)| (role.as_str(), perms))
    }

    pub fn is_ownership_scoped(&self, role: &str) -> bool {
        self.ownership_scoped_roles.contains(role)
    }
}

#[derive(Debug, Default)]
pub struct RolePermissionTableBuilder {
    roles: BTreeMap<String, BTreeSet<String>>,
    super_role: Option<String>,
    ownership_scoped_roles: HashSet<String>,
    ownership_resources: HashSet<String>,
}

impl RolePermissionTableBuilder {
    pub fn role<I, S>(mut self, name: &str, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles
            .entry(name.to_string())
            .or_default()
            .extend(permissions.into_iter().map(Into::into));
        self
    }

    pub fn super_role(mut self, name: &str) -> Self {
        self.super_role = Some(name.to_string());
        self
    }

    /// Holders of `role` may only reach instances they own.
    pub fn ownership_scoped(mut self, role: &str) -> Self {
        self.ownership_scoped_roles.insert(role.to_string());
        self
    }

    pub fn ownership_checked_resource(mut self, resource: &str) -> Self {
        self.ownership_resources.insert(resource.to_string());
        self
    }

    pub fn build(self) -> RolePermissionTable {
        RolePermissionTable {
            roles: self.roles,
            super_role: self.super_role.unwrap_or_else(|| SUPER_ROLE.to_string()),
            ownership_scoped_roles: self.ownership_scoped_roles,
            ownership_resources: self.ownership_resources,
        }
    }
}

pub struct AccessController {
    table: RolePermissionTable,
    profiles: Arc<dyn ProfileLookup>,
    audit: AuditEmitter,
    clock: Arc<dyn Clock>,
    deadline: Duration,
}

impl AccessController {
    pub fn new(
        table: RolePermissionTable,
        profiles: Arc<dyn ProfileLookup>,
        audit: AuditEmitter,
        clock: Arc<dyn Clock>,
        deadline: Duration,
    ) -> Self {
        Self {
            table,
            profiles,
            audit,
            clock,
            deadline,
        }
    }

    pub fn table(&self) -> &RolePermissionTable {
        &self.table
    }

    /// Decide whether `user_id` may perform `action` on `resource`
    /// (optionally a specific instance `resource_id`).
    ///
    /// `origin` is only used to attribute audit events.
    pub async fn authorize(
        &self,
        user_id: &str,
        resource: &str,
        action: &str,
        resource_id: Option<&str>,
        origin: &str,
    ) -> Result<(), SecurityError> {
        self.authorize_with_deadline(user_id, resource, action, resource_id, origin, self.deadline)
            .await
    }

    /// [`AccessController::authorize`] with the profile lookup bounded by
    /// the caller's `deadline` instead of the configured one.
    pub async fn authorize_with_deadline(
        &self,
        user_id: &str,
        resource: &str,
        action: &str,
        resource_id: Option<&str>,
        origin: &str,
        deadline: Duration,
    ) -> Result<(), SecurityError> {
        let lookup = timeout(deadline, self.profiles.get_role_and_ownership(user_id)).await;
        let profile = match lookup {
            Ok(Ok(profile)) => profile,
            Ok(Err(PortError::NotFound)) => {
                tracing::info!(
                    target: "security::access",
                    event = "AUTHZ_UNKNOWN_USER",
                    user = %user_id,
                    "Authorization denied: user not found"
                );
                return Err(SecurityError::PermissionDenied(DenialReason::UserNotFound));
            }
            Ok(Err(e)) => {
                tracing::error!(
                    target: "security::access",
                    event = "PROFILE_LOOKUP_FAILED",
                    user = %user_id,
                    error = %e,
                    "Profile lookup failed, denying"
                );
                return Err(SecurityError::ProfileLookupFailed);
            }
            Err(_) => {
                tracing::error!(
                    target: "security::access",
                    event = "PROFILE_LOOKUP_TIMEOUT",
                    user = %user_id,
                    deadline_ms = deadline.as_millis() as u64,
                    "Profile lookup timed out, denying"
                );
                return Err(SecurityError::ProfileLookupFailed);
            }
        };

        if self.table.is_super_role(&profile.role) {
            return Ok(());
        }

        let now = self.clock.now();
        let required = format!("{}:{}", resource, action);

        if !self.table.grants(&profile.role, resource, action) {
            tracing::warn!(
                target: "security::access",
                event = "AUTHZ_DENIED",
                user = %user_id,
                role = %profile.role,
                required = %required,
                "Insufficient permissions"
            );
            self.audit.record(
                SecurityEvent::new(EventKind::UnauthorizedAccess, Severity::Medium, origin, now)
                    .actor(user_id)
                    .detail("role", profile.role.as_str())
                    .detail("required_permission", required.as_str())
                    .maybe_detail("resource_id", resource_id),
            );
            return Err(SecurityError::PermissionDenied(
                DenialReason::InsufficientPermissions,
            ));
        }

        let Some(resource_id) = resource_id else {
            return Ok(());
        };
        if !self.table.requires_ownership(&profile.role, resource) {
            return Ok(());
        }

        let granted = profile.owns(resource_id);
        self.audit.record(
            SecurityEvent::new(EventKind::DataAccess, Severity::Low, origin, now)
                .actor(user_id)
                .detail("resource", resource)
                .detail("resource_id", resource_id)
                .detail("action", action)
                .detail("granted", granted),
        );
        if granted {
            Ok(())
        } else {
            tracing::warn!(
                target: "security::access",
                event = "OWNERSHIP_DENIED",
                user = %user_id,
                resource = %resource,
                resource_id = %resource_id,
                "Access to resource instance denied"
            );
            Err(SecurityError::PermissionDenied(
                DenialReason::ResourceAccessDenied,
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ports::{Profile, StaticProfileLookup};
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    const ORIGIN: &str = "10.0.0.5";

    struct SlowLookup;

    #[async_trait]
    impl ProfileLookup for SlowLookup {
        async fn get_role_and_ownership(&self, _user_id: &str) -> Result<Profile, PortError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Profile::new(SUPER_ROLE))
        }
    }

    struct BrokenLookup;

    #[async_trait]
    impl ProfileLookup for BrokenLookup {
        async fn get_role_and_ownership(&self, _user_id: &str) -> Result<Profile, PortError> {
            Err(PortError::Unavailable("connection reset".to_string()))
        }
    }

    fn profiles() -> StaticProfileLookup {
        StaticProfileLookup::new()
            .with_profile("root", Profile::new("admin"))
            .with_profile("mgr", Profile::new("manager"))
            .with_profile("tech", Profile::new("technician"))
            .with_profile("cust-a", Profile::new("customer").owning("A"))
            .with_profile("cust-b", Profile::new("customer").owning("B"))
    }

    fn controller(
        lookup: Arc<dyn ProfileLookup>,
        deadline: Duration,
    ) -> (AccessController, mpsc::Receiver<SecurityEvent>) {
        let (audit, rx) = AuditEmitter::channel(64);
        let clock = Arc::new(ManualClock::starting_now());
        let controller =
            AccessController::new(RolePermissionTable::default(), lookup, audit, clock, deadline);
        (controller, rx)
    }

    fn default_controller() -> (AccessController, mpsc::Receiver<SecurityEvent>) {
        controller(Arc::new(profiles()), Duration::from_secs(1))
    }

    #[test]
    fn test_wildcards_grant() {
        let table = RolePermissionTable::builder()
            .role("auditor", ["*:*"])
            .role("billing", ["invoice:*"])
            .build();
        assert!(table.grants("auditor", "anything", "delete"));
        assert!(table.grants("billing", "invoice", "void"));
        assert!(!table.grants("billing", "customer", "read"));
        assert!(!table.grants("nobody", "invoice", "read"));
        assert!(table.grants("admin", "anything", "delete"));
    }

    #[tokio::test]
    async fn test_admin_allowed_everything() {
        let (controller, mut rx) = default_controller();
        for (resource, action) in [("customer", "delete"), ("payroll", "export"), ("x", "y")] {
            assert!(controller
                .authorize("root", resource, action, Some("B"), ORIGIN)
                .await
                .is_ok());
        }
        assert!(rx.try_recv().is_err(), "super-role bypasses audit of checks");
    }

    #[tokio::test]
    async fn test_missing_permission_denied_and_audited() {
        let (controller, mut rx) = default_controller();
        let result = controller.authorize("tech", "invoice", "read", None, ORIGIN).await;
        assert_eq!(
            result,
            Err(SecurityError::PermissionDenied(DenialReason::InsufficientPermissions))
        );
        let event = rx.try_recv().unwrap();
        assert_eq!(event.kind(), EventKind::UnauthorizedAccess);
        assert_eq!(event.severity(), Severity::Medium);
        assert_eq!(event.details()["required_permission"], "invoice:read");
    }

    #[tokio::test]
    async fn test_customer_only_reaches_own_record() {
        let (controller, mut rx) = default_controller();
        assert!(controller
            .authorize("cust-a", "customer", "read", Some("A"), ORIGIN)
            .await
            .is_ok());
        assert_eq!(
            controller
                .authorize("cust-a", "customer", "read", Some("B"), ORIGIN)
                .await,
            Err(SecurityError::PermissionDenied(DenialReason::ResourceAccessDenied))
        );

        let granted = rx.try_recv().unwrap();
        assert_eq!(granted.kind(), EventKind::DataAccess);
        assert_eq!(granted.severity(), Severity::Low);
        assert_eq!(granted.details()["granted"], true);
        let denied = rx.try_recv().unwrap();
        assert_eq!(denied.details()["granted"], false);
    }

    #[tokio::test]
    async fn test_permission_checked_before_ownership() {
        let (controller, mut rx) = default_controller();
        // customer role has no customer:delete, even on its own record
        assert_eq!(
            controller
                .authorize("cust-a", "customer", "delete", Some("A"), ORIGIN)
                .await,
            Err(SecurityError::PermissionDenied(DenialReason::InsufficientPermissions))
        );
        assert_eq!(rx.try_recv().unwrap().kind(), EventKind::UnauthorizedAccess);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_staff_roles_not_ownership_scoped() {
        let (controller, _rx) = default_controller();
        assert!(controller
            .authorize("mgr", "customer", "update", Some("B"), ORIGIN)
            .await
            .is_ok());
        assert!(controller
            .authorize("tech", "customer", "read", Some("A"), ORIGIN)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_unknown_user() {
        let (controller, _rx) = default_controller();
        assert_eq!(
            controller.authorize("ghost", "customer", "read", None, ORIGIN).await,
            Err(SecurityError::PermissionDenied(DenialReason::UserNotFound))
        );
    }

    #[tokio::test]
    async fn test_lookup_timeout_fails_closed() {
        let (controller, _rx) = controller(Arc::new(SlowLookup), Duration::from_millis(50));
        assert_eq!(
            controller.authorize("root", "customer", "read", None, ORIGIN).await,
            Err(SecurityError::ProfileLookupFailed)
        );
    }

    #[tokio::test]
    async fn test_lookup_error_fails_closed() {
        let (controller, _rx) = controller(Arc::new(BrokenLookup), Duration::from_secs(1));
        assert_eq!(
            controller.authorize("root", "customer", "read", None, ORIGIN).await,
            Err(SecurityError::ProfileLookupFailed)
        );
    }

    #[tokio::test]
    async fn test_caller_deadline_overrides_configured_one() {
        let (slow, _slow_rx) = controller(Arc::new(SlowLookup), Duration::from_secs(3600));
        let result = slow
            .authorize_with_deadline("root", "customer", "read", None, ORIGIN, Duration::from_millis(50))
            .await;
        assert_eq!(result, Err(SecurityError::ProfileLookupFailed));

        let (fast, _fast_rx) = controller(Arc::new(profiles()), Duration::ZERO);
        assert!(fast
            .authorize_with_deadline("cust-a", "customer", "read", Some("A"), ORIGIN, Duration::from_secs(5))
            .await
            .is_ok());
    }
}
