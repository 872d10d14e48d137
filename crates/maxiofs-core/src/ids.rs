//! Id and timestamp helpers.
//!
//! Object versions need ids that sort lexicographically from newest to
//! oldest so that the first row under an `object:{bucket}:{key}:` prefix is
//! always the current version. [`new_version_id`] inverts a microsecond
//! timestamp and appends random hex to break ties within one microsecond.

use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngExt;

/// The version id presented for writes to non-versioned buckets.
pub const NULL_VERSION_ID: &str = "null";

/// Current Unix time in whole seconds.
#[must_use]
pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Current Unix time in microseconds.
#[must_use]
pub fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_micros()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Generate a version id that sorts lexicographically before every id
/// generated earlier.
///
/// Layout: 16 hex digits of `u64::MAX - now_micros`, then 4 random hex
/// digits. Later timestamps produce smaller inverted values, so ascending
/// string order is newest-first.
#[must_use]
pub fn new_version_id() -> String {
    let inverted = u64::MAX - now_micros();
    let salt: u16 = rand::rng().random();
    format!("{inverted:016x}{salt:04x}")
}

/// Generate a random hex token with `bytes` bytes of entropy.
///
/// Used for the cluster `node_token` (32 bytes = 256 bits) and management
/// session tokens.
#[must_use]
pub fn random_token(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::rng().fill(buf.as_mut_slice());
    hex::encode(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_generate_reverse_sorting_version_ids() {
        let first = new_version_id();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = new_version_id();
        // The later write must sort before the earlier one.
        assert!(second < first, "{second} should sort before {first}");
    }

    #[test]
    fn test_should_generate_fixed_width_version_ids() {
        let id = new_version_id();
        assert_eq!(id.len(), 20);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_should_generate_tokens_with_requested_entropy() {
        let token = random_token(32);
        assert_eq!(token.len(), 64);
        assert_ne!(token, random_token(32));
    }

    #[test]
    fn test_should_report_monotonic_now() {
        let a = now_micros();
        let b = now_micros();
        assert!(b >= a);
        assert!(now_secs() > 1_700_000_000);
    }
}
