// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Kernel configuration.
//!
//! Loaded once at process start from `~/.gatekeeper/config.json` (missing
//! file means defaults), then overridden from the environment, validated,
//! and shared read-only as `Arc<SecurityConfig>`.
//!
//! | Variable                            | Field                   |
//! |-------------------------------------|-------------------------|
//! | `GATEKEEPER_ENCRYPTION_KEY`         | `encryption_key`        |
//! | `GATEKEEPER_STRICT_ORIGIN_BINDING`  | `strict_origin_binding` |
//! | `GATEKEEPER_SESSION_TIMEOUT_SECS`   | `session_timeout_secs`  |

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::security::crypto::EncryptionKey;

pub const ENV_ENCRYPTION_KEY: &str = "GATEKEEPER_ENCRYPTION_KEY";
pub const ENV_STRICT_ORIGIN_BINDING: &str = "GATEKEEPER_STRICT_ORIGIN_BINDING";
pub const ENV_SESSION_TIMEOUT_SECS: &str = "GATEKEEPER_SESSION_TIMEOUT_SECS";

/// Upper bound for every configured duration: one year.
pub const MAX_DURATION_SECS: u64 = 365 * 24 * 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Failed logins per (identifier, origin) before the pair is locked.
    pub max_login_attempts: u32,
    pub lockout_duration_secs: u64,
    /// Idle timeout; activity resets it.
    pub session_timeout_secs: u64,
    pub password_min_length: usize,
    pub password_require_complexity: bool,
    /// Requests allowed per origin per fixed window.
    pub rate_limit_capacity: u32,
    pub rate_limit_window_secs: u64,
    pub encryption_key: Option<EncryptionKey>,
    /// Revoke a session presented from an origin other than the one it was
    /// created from.
    pub strict_origin_binding: bool,
    pub rate_reaper_interval_secs: u64,
    pub session_reaper_interval_secs: u64,
    pub audit_queue_capacity: usize,
    /// Deadline for profile lookups, sink writes and alert dispatch.
    pub external_call_timeout_ms: u64,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            max_login_attempts: 5,
            lockout_duration_secs: 900,
            session_timeout_secs: 1800,
            password_min_length: 12,
            password_require_complexity: true,
            rate_limit_capacity: 100,
            rate_limit_window_secs: 60,
            encryption_key: None,
            strict_origin_binding: true,
            rate_reaper_interval_secs: 300,
            session_reaper_interval_secs: 600,
            audit_queue_capacity: 1024,
            external_call_timeout_ms: 2000,
        }
    }
}

impl SecurityConfig {
    /// `~/.gatekeeper`
    pub fn config_dir() -> Result<PathBuf, ConfigError> {
        let home = dirs::home_dir().ok_or(ConfigError::NoHomeDir)?;
        Ok(home.join(".gatekeeper"))
    }

    pub fn default_path() -> Result<PathBuf, ConfigError> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load from the default location, apply environment overrides and
    /// validate.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::default_path()?)
    }

    /// Load from `path` (defaults if it does not exist), apply environment
    /// overrides and validate.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let config = Self::read_from(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Like [`SecurityConfig::load_from`] without validation, for tooling
    /// that inspects or repairs an incomplete config.
    pub fn read_from(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let content = fs::read_to_string(path)?;
            serde_json::from_str(&content)?
        } else {
            tracing::debug!(
                target: "config",
                path = %path.display(),
                "No config file found, using defaults"
            );
            Self::default()
        };
        config.apply_overrides(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Apply overrides from `lookup` (normally the process environment).
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(raw) = lookup(ENV_ENCRYPTION_KEY) {
            self.encryption_key = Some(EncryptionKey::from_base64(raw.trim())?);
        }
        if let Some(raw) = lookup(ENV_STRICT_ORIGIN_BINDING) {
            self.strict_origin_binding = match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                other => {
                    return Err(ConfigError::InvalidValue {
                        field: "strict_origin_binding",
                        reason: format!("expected a boolean, got {:?}", other),
                    })
                }
            };
        }
        if let Some(raw) = lookup(ENV_SESSION_TIMEOUT_SECS) {
            self.session_timeout_secs =
                raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
                    field: "session_timeout_secs",
                    reason: format!("expected whole seconds, got {:?}", raw),
                })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.encryption_key.is_none() {
            return Err(ConfigError::MissingKey);
        }
        let positive: [(&'static str, u64); 7] = [
            ("max_login_attempts", self.max_login_attempts as u64),
            ("lockout_duration_secs", self.lockout_duration_secs),
            ("session_timeout_secs", self.session_timeout_secs),
            ("rate_limit_window_secs", self.rate_limit_window_secs),
            ("rate_reaper_interval_secs", self.rate_reaper_interval_secs),
            ("session_reaper_interval_secs", self.session_reaper_interval_secs),
            ("audit_queue_capacity", self.audit_queue_capacity as u64),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        let bounded: [(&'static str, u64); 6] = [
            ("lockout_duration_secs", self.lockout_duration_secs),
            ("session_timeout_secs", self.session_timeout_secs),
            ("rate_limit_window_secs", self.rate_limit_window_secs),
            ("rate_reaper_interval_secs", self.rate_reaper_interval_secs),
            ("session_reaper_interval_secs", self.session_reaper_interval_secs),
            ("external_call_timeout_ms", self.external_call_timeout_ms / 1000),
        ];
        for (field, value) in bounded {
            if value > MAX_DURATION_SECS {
                return Err(ConfigError::InvalidValue {
                    field,
                    reason: format!("must not exceed {} seconds", MAX_DURATION_SECS),
                });
            }
        }
        if self.rate_limit_capacity == 0 {
            tracing::warn!(
                target: "config",
                event = "RATE_LIMIT_DISABLED_ALL",
                "rate_limit_capacity is 0: every login admission will be denied"
            );
        }
        Ok(())
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Test and embedding helper: defaults plus a freshly generated key.
    pub fn with_generated_key() -> Self {
        Self {
            encryption_key: Some(EncryptionKey::generate()),
            ..Self::default()
        }
    }

    pub fn lockout_duration(&self) -> Duration {
        bounded_seconds(self.lockout_duration_secs)
    }

    pub fn session_timeout(&self) -> Duration {
        bounded_seconds(self.session_timeout_secs)
    }

    pub fn rate_limit_window(&self) -> Duration {
        bounded_seconds(self.rate_limit_window_secs)
    }

    pub fn rate_reaper_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.rate_reaper_interval_secs)
    }

    pub fn session_reaper_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.session_reaper_interval_secs)
    }

    pub fn external_call_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.external_call_timeout_ms)
    }
}

/// Whole seconds as a `chrono::Duration`, capped at [`MAX_DURATION_SECS`]
/// so an unvalidated config can neither wrap negative nor overflow.
fn bounded_seconds(secs: u64) -> Duration {
    let capped = secs.min(MAX_DURATION_SECS) as i64;
    Duration::try_seconds(capped).unwrap_or(Duration::zero())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = SecurityConfig::default();
        assert_eq!(config.max_login_attempts, 5);
        assert_eq!(config.lockout_duration(), Duration::minutes(15));
        assert_eq!(config.rate_limit_capacity, 100);
        assert_eq!(config.rate_limit_window(), Duration::seconds(60));
        assert!(config.strict_origin_binding);
    }

    #[test]
    fn test_validate_requires_key() {
        let config = SecurityConfig::default();
        assert!(matches!(config.validate(), Err(ConfigError::MissingKey)));
        assert!(SecurityConfig::with_generated_key().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_lockout() {
        let config = SecurityConfig {
            lockout_duration_secs: 0,
            ..SecurityConfig::with_generated_key()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { field: "lockout_duration_secs", .. })
        ));
    }

    #[test]
    fn test_env_overrides() {
        let key = EncryptionKey::generate().to_base64();
        let env: HashMap<&str, String> = HashMap::from([
            (ENV_ENCRYPTION_KEY, key),
            (ENV_STRICT_ORIGIN_BINDING, "off".to_string()),
            (ENV_SESSION_TIMEOUT_SECS, "120".to_string()),
        ]);
        let mut config = SecurityConfig::default();
        config.apply_overrides(|name| env.get(name).cloned()).unwrap();

        assert!(config.encryption_key.is_some());
        assert!(!config.strict_origin_binding);
        assert_eq!(config.session_timeout_secs, 120);
    }

    #[test]
    fn test_env_override_rejects_garbage() {
        let mut config = SecurityConfig::default();
        let result = config.apply_overrides(|name| {
            (name == ENV_SESSION_TIMEOUT_SECS).then(|| "soon".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut config = SecurityConfig::with_generated_key();
        config.max_login_attempts = 3;
        config.save_to(&path).unwrap();

        let loaded = SecurityConfig::load_from(&path).unwrap();
        assert_eq!(loaded.max_login_attempts, 3);
        assert_eq!(
            loaded.encryption_key.as_ref().map(|k| k.to_base64()),
            config.encryption_key.as_ref().map(|k| k.to_base64())
        );
    }

    #[test]
    fn test_debug_never_prints_key() {
        let config = SecurityConfig::with_generated_key();
        let key = config.encryption_key.as_ref().unwrap().to_base64();
        let debug = format!("{:?}", config);
        assert!(!debug.contains(&key));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn test_validate_rejects_durations_beyond_a_year() {
        for config in [
            SecurityConfig {
                lockout_duration_secs: u64::MAX,
                ..SecurityConfig::with_generated_key()
            },
            SecurityConfig {
                rate_limit_window_secs: 10_000_000_000_000_000,
                ..SecurityConfig::with_generated_key()
            },
            SecurityConfig {
                session_timeout_secs: MAX_DURATION_SECS + 1,
                ..SecurityConfig::with_generated_key()
            },
        ] {
            assert!(matches!(config.validate(), Err(ConfigError::InvalidValue { .. })));
        }

        let at_limit = SecurityConfig {
            lockout_duration_secs: MAX_DURATION_SECS,
            ..SecurityConfig::with_generated_key()
        };
        assert!(at_limit.validate().is_ok());
    }

    #[test]
    fn test_duration_accessors_never_wrap_or_panic() {
        let config = SecurityConfig {
            lockout_duration_secs: u64::MAX,
            session_timeout_secs: u64::MAX,
            rate_limit_window_secs: 10_000_000_000_000_000,
            ..SecurityConfig::default()
        };
        let cap = Duration::seconds(MAX_DURATION_SECS as i64);
        assert_eq!(config.lockout_duration(), cap);
        assert_eq!(config.session_timeout(), cap);
        assert_eq!(config.rate_limit_window(), cap);
    }

    #[test]
    fn test_huge_session_timeout_from_env_is_rejected() {
        let mut config = SecurityConfig::with_generated_key();
        config
            .apply_overrides(|name| {
                (name == ENV_SESSION_TIMEOUT_SECS).then(|| u64::MAX.to_string())
            })
            .unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { field: "session_timeout_secs", .. })
        ));
    }
}
