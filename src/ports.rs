// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Boundaries to the systems the kernel does not own.
//!
//! The surrounding application supplies a [`ProfileLookup`] (its user store),
//! an [`EventSink`] (durable audit storage) and an [`AlertChannel`] (paging,
//! chat, email). In-memory implementations are provided for embedding and
//! tests.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use crate::audit::SecurityEvent;
use crate::error::PortError;
use crate::security::locks::{resilient_read, resilient_write};

/// Role and owned resource ids for one user.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Profile {
    pub role: String,
    pub owned_resource_ids: HashSet<String>,
}

impl Profile {
    pub fn new(role: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            owned_resource_ids: HashSet::new(),
        }
    }

    pub fn owning(mut self, resource_id: impl Into<String>) -> Self {
        self.owned_resource_ids.insert(resource_id.into());
        self
    }

    pub fn owns(&self, resource_id: &str) -> bool {
        self.owned_resource_ids.contains(resource_id)
    }
}

#[async_trait]
pub trait ProfileLookup: Send + Sync {
    /// `Err(PortError::NotFound)` when the user does not exist.
    async fn get_role_and_ownership(&self, user_id: &str) -> Result<Profile, PortError>;
}

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn persist(&self, event: &SecurityEvent) -> Result<(), PortError>;
}

#[async_trait]
pub trait AlertChannel: Send + Sync {
    async fn notify(&self, title: &str, message: &str, data: &Value) -> Result<(), PortError>;
}

/// Profile store backed by an in-memory map.
#[derive(Debug, Default)]
pub struct StaticProfileLookup {
    profiles: RwLock<HashMap<String, Profile>>,
}

impl StaticProfileLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_profile(self, user_id: impl Into<String>, profile: Profile) -> Self {
        self.insert(user_id, profile);
        self
    }

    pub fn insert(&self, user_id: impl Into<String>, profile: Profile) {
        resilient_write(&self.profiles).insert(user_id.into(), profile);
    }

    pub fn remove(&self, user_id: &str) -> Option<Profile> {
        resilient_write(&self.profiles).remove(user_id)
    }
}

#[async_trait]
impl ProfileLookup for StaticProfileLookup {
    async fn get_role_and_ownership(&self, user_id: &str) -> Result<Profile, PortError> {
        resilient_read(&self.profiles)
            .get(user_id)
            .cloned()
            .ok_or(PortError::NotFound)
    }
}

/// Sink that keeps every persisted event in memory.
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: RwLock<Vec<SecurityEvent>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SecurityEvent> {
        resilient_read(&self.events).clone()
    }

    pub fn len(&self) -> usize {
        resilient_read(&self.events).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EventSink for MemoryEventSink {
    async fn persist(&self, event: &SecurityEvent) -> Result<(), PortError> {
        resilient_write(&self.events).push(event.clone());
        Ok(())
    }
}

/// A single captured alert.
#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub title: String,
    pub message: String,
    pub data: Value,
}

/// Alert channel that records alerts in memory.
#[derive(Debug, Default)]
pub struct MemoryAlertChannel {
    alerts: RwLock<Vec<Alert>>,
}

impl MemoryAlertChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        resilient_read(&self.alerts).clone()
    }
}

#[async_trait]
impl AlertChannel for MemoryAlertChannel {
    async fn notify(&self, title: &str, message: &str, data: &Value) -> Result<(), PortError> {
        resilient_write(&self.alerts).push(Alert {
            title: title.to_string(),
            message: message.to_string(),
            data: data.clone(),
        });
        Ok(())
    }
}

/// Alert channel that writes alerts to the `tracing` log at warn level.
/// Used when the application does not wire a real channel.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlertChannel;

#[async_trait]
impl AlertChannel for TracingAlertChannel {
    async fn notify(&self, title: &str, message: &str, data: &Value) -> Result<(), PortError> {
        tracing::warn!(
            target: "audit::alert",
            event = "SECURITY_ALERT",
            title = %title,
            data = %data,
            "{}",
            message
        );
        Ok(())
    }
}

/// Sink that discards events. Used when the application does not wire
/// durable storage; events still appear in the local log via the worker.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEventSink;

#[async_trait]
impl EventSink for NullEventSink {
    async fn persist(&self, _event: &SecurityEvent) -> Result<(), PortError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{EventKind, Severity};
    use chrono::Utc;

    #[tokio::test]
    async fn test_static_profile_lookup() {
        let lookup = StaticProfileLookup::new()
            .with_profile("u-1", Profile::new("customer").owning("cust-1"));

        let profile = lookup.get_role_and_ownership("u-1").await.unwrap();
        assert_eq!(profile.role, "customer");
        assert!(profile.owns("cust-1"));
        assert!(!profile.owns("cust-2"));

        assert_eq!(
            lookup.get_role_and_ownership("nobody").await,
            Err(PortError::NotFound)
        );
    }

    #[tokio::test]
    async fn test_memory_sink_and_alerts() {
        let sink = MemoryEventSink::new();
        let event = SecurityEvent::new(EventKind::DataAccess, Severity::Low, "1.2.3.4", Utc::now());
        sink.persist(&event).await.unwrap();
        assert_eq!(sink.events(), vec![event]);

        let alerts = MemoryAlertChannel::new();
        alerts
            .notify("t", "m", &serde_json::json!({ "k": 1 }))
            .await
            .unwrap();
        assert_eq!(alerts.alerts()[0].data["k"], 1);
    }
}
