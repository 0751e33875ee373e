// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Small helpers shared across the kernel.

/// Mask a sensitive string (session ids, tokens) for logging.
///
/// Shows only the first `visible_prefix` characters and replaces the rest
/// with "...", so a session id in a log line cannot be replayed. A value no
/// longer than the prefix is masked entirely.
///
/// # Examples
///
/// ```
/// use gatekeeper::utils::mask_sensitive;
///
/// let session_id = "9f3c2a1b7e5d4c3b2a19f8e7d6c5b4a3";
/// assert_eq!(mask_sensitive(session_id, 8), "9f3c2a1b...");
/// ```
pub fn mask_sensitive(input: &str, visible_prefix: usize) -> String {
    if input.chars().count() <= visible_prefix {
        return "...".to_string();
    }

    let prefix: String = input.chars().take(visible_prefix).collect();
    format!("{}...", prefix)
}

/// Ceiling division of a millisecond span into whole seconds.
pub(crate) fn ceil_secs(millis: i64) -> u64 {
    if millis <= 0 {
        0
    } else {
        ((millis + 999) / 1000) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_sensitive() {
        assert_eq!(mask_sensitive("abcdef0123456789", 8), "abcdef01...");
        assert_eq!(mask_sensitive("", 8), "...");
    }

    #[test]
    fn test_mask_sensitive_hides_short_values_entirely() {
        assert_eq!(mask_sensitive("short", 8), "...");
        assert_eq!(mask_sensitive("exactly8", 8), "...");
        assert_eq!(mask_sensitive("ninechars", 8), "ninechar...");
    }

    #[test]
    fn test_ceil_secs() {
        assert_eq!(ceil_secs(0), 0);
        assert_eq!(ceil_secs(-5), 0);
        assert_eq!(ceil_secs(1), 1);
        assert_eq!(ceil_secs(1000), 1);
        assert_eq!(ceil_secs(1001), 2);
        assert_eq!(ceil_secs(900_000), 900);
    }
}
