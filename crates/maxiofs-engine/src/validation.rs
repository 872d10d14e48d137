//! Input validation for bucket names, object keys, and user metadata.
//!
//! Bucket naming follows the AWS rules: 3-63 characters, lowercase letters,
//! digits, hyphens and dots, starting and ending alphanumeric, no adjacent
//! dots, and not formatted like an IPv4 address.

use maxiofs_core::{Error, Result};

/// Maximum object key length in bytes.
pub const MAX_KEY_LEN: usize = 1024;

/// Maximum total size of user metadata in bytes, per AWS.
pub const MAX_USER_METADATA_LEN: usize = 2048;

/// Validate a bucket name.
pub fn validate_bucket_name(name: &str) -> Result<()> {
    let fail = |reason: &str| {
        Err(Error::InvalidBucketName {
            name: name.to_owned(),
            reason: reason.to_owned(),
        })
    };

    if name.len() < 3 || name.len() > 63 {
        return fail("length must be 3-63 characters");
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'.')
    {
        return fail("only lowercase letters, digits, hyphens, and dots are allowed");
    }
    let first = name.as_bytes()[0];
    let last = name.as_bytes()[name.len() - 1];
    if !first.is_ascii_alphanumeric() || !last.is_ascii_alphanumeric() {
        return fail("must start and end with a letter or digit");
    }
    if name.contains("..") || name.contains(".-") || name.contains("-.") {
        return fail("dots must not be adjacent to dots or hyphens");
    }
    if looks_like_ipv4(name) {
        return fail("must not be formatted like an IP address");
    }
    if name.starts_with("xn--") {
        return fail("must not start with the reserved prefix xn--");
    }
    Ok(())
}

/// Validate an object key. NUL is rejected because it doubles as the
/// MetaStore component separator; control characters are rejected because
/// they cannot appear in XML listings.
pub fn validate_object_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::invalid_argument("object key must not be empty"));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(Error::invalid_argument(format!(
            "object key exceeds {MAX_KEY_LEN} bytes"
        )));
    }
    if key.chars().any(|c| c.is_control()) {
        return Err(Error::invalid_argument(
            "object key must not contain control characters",
        ));
    }
    Ok(())
}

/// Validate the combined user-metadata size.
pub fn validate_user_metadata(
    metadata: &std::collections::HashMap<String, String>,
) -> Result<()> {
    let total: usize = metadata.iter().map(|(k, v)| k.len() + v.len()).sum();
    if total > MAX_USER_METADATA_LEN {
        return Err(Error::invalid_argument(format!(
            "user metadata exceeds {MAX_USER_METADATA_LEN} bytes"
        )));
    }
    Ok(())
}

fn looks_like_ipv4(name: &str) -> bool {
    let octets: Vec<&str> = name.split('.').collect();
    octets.len() == 4 && octets.iter().all(|o| o.parse::<u8>().is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_accept_valid_bucket_names() {
        for name in ["abc", "my-bucket", "my.bucket.2024", "a1b2c3", "0start"] {
            assert!(validate_bucket_name(name).is_ok(), "{name} should be valid");
        }
    }

    #[test]
    fn test_should_reject_invalid_bucket_names() {
        let cases = [
            ("ab", "too short"),
            (&"a".repeat(64), "too long"),
            ("UPPER", "uppercase"),
            ("under_score", "underscore"),
            ("-lead", "leading hyphen"),
            ("trail-", "trailing hyphen"),
            ("two..dots", "adjacent dots"),
            ("dot.-hyphen", "dot next to hyphen"),
            ("192.168.1.1", "IPv4 shaped"),
            ("xn--punycode", "reserved prefix"),
        ];
        for (name, why) in cases {
            assert!(
                matches!(
                    validate_bucket_name(name),
                    Err(Error::InvalidBucketName { .. })
                ),
                "{name} ({why}) should be rejected"
            );
        }
    }

    #[test]
    fn test_should_accept_normal_object_keys() {
        for key in ["file.txt", "dir/sub/file", "unicode-é", "a b c", "k:v"] {
            assert!(validate_object_key(key).is_ok(), "{key} should be valid");
        }
    }

    #[test]
    fn test_should_reject_bad_object_keys() {
        assert!(validate_object_key("").is_err());
        assert!(validate_object_key(&"x".repeat(MAX_KEY_LEN + 1)).is_err());
        assert!(validate_object_key("nul\0byte").is_err());
        assert!(validate_object_key("tab\tchar").is_err());
    }

    #[test]
    fn test_should_enforce_metadata_size_ceiling() {
        let mut small = std::collections::HashMap::new();
        small.insert("k".to_owned(), "v".to_owned());
        assert!(validate_user_metadata(&small).is_ok());

        let mut big = std::collections::HashMap::new();
        big.insert("k".to_owned(), "v".repeat(MAX_USER_METADATA_LEN));
        assert!(validate_user_metadata(&big).is_err());
    }
}
