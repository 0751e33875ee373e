// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Password strength policy.
//!
//! Only checks the shape of a new password; verifying credentials belongs to
//! the identity store.

use serde::Serialize;
use std::fmt;

use crate::config::SecurityConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PasswordViolation {
    TooShort { min_length: usize },
    MissingUppercase,
    MissingLowercase,
    MissingDigit,
    MissingSymbol,
}

impl fmt::Display for PasswordViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooShort { min_length } => {
                write!(f, "must be at least {} characters", min_length)
            }
            Self::MissingUppercase => f.write_str("must contain an uppercase letter"),
            Self::MissingLowercase => f.write_str("must contain a lowercase letter"),
            Self::MissingDigit => f.write_str("must contain a digit"),
            Self::MissingSymbol => f.write_str("must contain a symbol"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PasswordPolicy {
    pub min_length: usize,
    pub require_complexity: bool,
}

impl PasswordPolicy {
    pub fn from_config(config: &SecurityConfig) -> Self {
        Self {
            min_length: config.password_min_length,
            require_complexity: config.password_require_complexity,
        }
    }

    /// Every rule `password` breaks, or `Ok` if none. Length counts chars,
    /// not bytes.
    pub fn check(&self, password: &str) -> Result<(), Vec<PasswordViolation>> {
        let mut violations = Vec::new();

        if password.chars().count() < self.min_length {
            violations.push(PasswordViolation::TooShort {
                min_length: self.min_length,
            });
        }

        if self.require_complexity {
            if !password.chars().any(char::is_uppercase) {
                violations.push(PasswordViolation::MissingUppercase);
            }
            if !password.chars().any(char::is_lowercase) {
                violations.push(PasswordViolation::MissingLowercase);
            }
            if !password.chars().any(|c| c.is_ascii_digit()) {
                violations.push(PasswordViolation::MissingDigit);
            }
            if !password
                .chars()
                .any(|c| !c.is_alphanumeric() && !c.is_whitespace())
            {
                violations.push(PasswordViolation::MissingSymbol);
            }
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations)
        }
    }
}
