//! General utilities shared across the engine.

use std::time::{SystemTime, UNIX_EPOCH};

// ─────────────────────────────────────────────────────────────────────────────
// Time Utilities
// ─────────────────────────────────────────────────────────────────────────────

/// Returns the current Unix timestamp in milliseconds.
///
/// Returns 0 if the system clock is before the Unix epoch (shouldn't happen in practice).
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ─────────────────────────────────────────────────────────────────────────────
// File Name Sanitization
// ─────────────────────────────────────────────────────────────────────────────

/// Replaces every byte outside `[A-Za-z0-9._-]` with `_`.
///
/// Track names arrive from peers and end up as part of on-disk staging file
/// names, so anything shell- or path-significant must be neutralized.
#[must_use]
pub fn safe_file_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_millis_is_nonzero() {
        assert!(now_millis() > 0);
    }

    #[test]
    fn safe_file_name_keeps_allowed_bytes() {
        assert_eq!(safe_file_name("track-01_final.wav"), "track-01_final.wav");
    }

    #[test]
    fn safe_file_name_replaces_everything_else() {
        assert_eq!(safe_file_name("my song (live)/v2"), "my_song__live__v2");
        assert_eq!(safe_file_name("naïve.flac"), "na_ve.flac");
        assert_eq!(safe_file_name("../etc/passwd"), ".._etc_passwd");
    }
}
