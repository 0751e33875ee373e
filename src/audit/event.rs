// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Security event records.
//!
//! Events are built once, then moved into the audit queue; there are no
//! setters. String detail values are passed through [`redact_secrets`] at
//! insertion so nothing secret reaches the sink or the alert channel.

use chrono::{DateTime, Local, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

/// Redaction patterns for sensitive data in event details.
/// JUSTIFICATION for .expect(): static patterns, validated by the tests below.
static REDACTION_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    vec![
        (Regex::new(r"(?i)password[=:]\s*\S+").expect("Password regex is valid"), "password=[REDACTED]"),
        (Regex::new(r"Bearer [a-zA-Z0-9._~+/-]+=*").expect("Bearer token regex is valid"), "Bearer [REDACTED]"),
        (Regex::new(r"AKIA[0-9A-Z]{16}").expect("AWS key regex is valid"), "[REDACTED_AWS_KEY]"),
        (Regex::new(r"\b[A-Za-z0-9+/]{43}=").expect("Base64 key regex is valid"), "[REDACTED_KEY]"),
        (Regex::new(r"\b[A-Za-z0-9]{32,}\b").expect("Generic key regex is valid"), "[REDACTED_KEY]"),
    ]
});

/// Redact secrets from text before it is recorded.
pub fn redact_secrets(text: &str) -> String {
    let mut result = text.to_string();
    for (pattern, replacement) in REDACTION_PATTERNS.iter() {
        result = pattern.replace_all(&result, *replacement).to_string();
    }
    result
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    LoginAttempt,
    LoginFailure,
    SessionExpired,
    UnauthorizedAccess,
    SuspiciousActivity,
    DataAccess,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LoginAttempt => "login_attempt",
            Self::LoginFailure => "login_failure",
            Self::SessionExpired => "session_expired",
            Self::UnauthorizedAccess => "unauthorized_access",
            Self::SuspiciousActivity => "suspicious_activity",
            Self::DataAccess => "data_access",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// High and critical events are also sent to the alert channel.
    pub fn requires_alert(&self) -> bool {
        *self >= Severity::High
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityEvent {
    kind: EventKind,
    severity: Severity,
    actor_id: Option<String>,
    origin: String,
    details: BTreeMap<String, Value>,
    timestamp: DateTime<Utc>,
}

impl SecurityEvent {
    pub fn new(
        kind: EventKind,
        severity: Severity,
        origin: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            kind,
            severity,
            actor_id: None,
            origin: origin.into(),
            details: BTreeMap::new(),
            timestamp,
        }
    }

    pub fn actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }

    /// Attach a detail. String values are redacted.
    pub fn detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let value = match value.into() {
            Value::String(s) => Value::String(redact_secrets(&s)),
            other => other,
        };
        self.details.insert(key.into(), value);
        self
    }

    pub fn maybe_detail(self, key: impl Into<String>, value: Option<&str>) -> Self {
        match value {
            Some(value) => self.detail(key, value),
            None => self,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn actor_id(&self) -> Option<&str> {
        self.actor_id.as_deref()
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn details(&self) -> &BTreeMap<String, Value> {
        &self.details
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// One-line rendering for local logs and alert bodies.
    pub fn to_log_line(&self) -> String {
        let local_time: DateTime<Local> = self.timestamp.into();
        let details = self
            .details
            .iter()
            .map(|(k, v)| match v {
                Value::String(s) => format!("{}={}", k, s),
                other => format!("{}={}", k, other),
            })
            .collect::<Vec<_>>()
            .join(" ");
        format!(
            "{} | {:>8} | {} | actor={} origin={} {}",
            local_time.format("%Y-%m-%d %H:%M:%S"),
            self.severity.as_str(),
            self.kind.as_str().to_uppercase(),
            self.actor_id.as_deref().unwrap_or("-"),
            self.origin,
            details
        )
        .trim_end()
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering_and_alerting() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High.requires_alert());
        assert!(Severity::Critical.requires_alert());
        assert!(!Severity::Medium.requires_alert());
        assert!(!Severity::Low.requires_alert());
    }

    #[test]
    fn test_serialized_shape() {
        let event = SecurityEvent::new(EventKind::LoginFailure, Severity::High, "1.2.3.4", Utc::now())
            .actor("alice@x.com")
            .detail("failure_count", 5);
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["kind"], "login_failure");
        assert_eq!(json["severity"], "high");
        assert_eq!(json["actor_id"], "alice@x.com");
        assert_eq!(json["origin"], "1.2.3.4");
        assert_eq!(json["details"]["failure_count"], 5);
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn test_string_details_are_redacted() {
        let event = SecurityEvent::new(EventKind::DataAccess, Severity::Low, "10.0.0.1", Utc::now())
            .detail("note", "password=hunter2 via Bearer abc.def.ghi");
        let note = event.details()["note"].as_str().unwrap();
        assert!(!note.contains("hunter2"));
        assert!(!note.contains("abc.def.ghi"));
    }

    #[test]
    fn test_redact_base64_key() {
        let key = "q83vEjRWeJCrze8SNFZ4kKvN7xI0VniQq83vEjRWeJA=";
        assert_eq!(redact_secrets(&format!("key {}", key)), "key [REDACTED_KEY]");
    }

    #[test]
    fn test_redact_preserves_safe_text() {
        let text = "customer:read on record 42";
        assert_eq!(redact_secrets(text), text);
    }

    #[test]
    fn test_log_line() {
        let event = SecurityEvent::new(EventKind::SessionExpired, Severity::Low, "1.2.3.4", Utc::now())
            .actor("u-1")
            .detail("idle_secs", 1900);
        let line = event.to_log_line();
        assert!(line.contains("SESSION_EXPIRED"));
        assert!(line.contains("actor=u-1"));
        assert!(line.contains("idle_secs=1900"));
    }
}
