//! Request/response header plumbing for the S3 surface.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use http::HeaderMap;
use percent_encoding::percent_decode_str;

use maxiofs_core::types::{ObjectRecord, Retention, RetentionMode};
use maxiofs_core::{Error, Result};
use maxiofs_engine::object::RangeSpec;

/// Tenant of the already-authenticated caller on forwarded requests.
pub const FORWARDED_TENANT_HEADER: &str = "x-maxiofs-tenant";

/// Header value as a string, if present and valid UTF-8.
#[must_use]
pub fn value<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Parse a `Range` header (`bytes=a-b`, `bytes=a-`, `bytes=-n`).
pub fn parse_range(headers: &HeaderMap) -> Result<Option<RangeSpec>> {
    let Some(raw) = value(headers, "range") else {
        return Ok(None);
    };
    let spec = raw
        .strip_prefix("bytes=")
        .ok_or(Error::InvalidRange)?
        .trim();

    let (start, end) = spec.split_once('-').ok_or(Error::InvalidRange)?;
    let parsed = match (start.is_empty(), end.is_empty()) {
        (true, false) => RangeSpec::Suffix(end.parse().map_err(|_| Error::InvalidRange)?),
        (false, true) => RangeSpec::From(start.parse().map_err(|_| Error::InvalidRange)?),
        (false, false) => RangeSpec::FromTo(
            start.parse().map_err(|_| Error::InvalidRange)?,
            end.parse().map_err(|_| Error::InvalidRange)?,
        ),
        (true, true) => return Err(Error::InvalidRange),
    };
    Ok(Some(parsed))
}

/// Collect `x-amz-meta-*` headers into user metadata.
#[must_use]
pub fn user_metadata(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, header_value)| {
            let key = name.as_str().strip_prefix("x-amz-meta-")?;
            let text = header_value.to_str().ok()?;
            Some((key.to_owned(), text.to_owned()))
        })
        .collect()
}

/// Parse the Object Lock headers on a PUT, if any.
pub fn object_lock_headers(headers: &HeaderMap) -> Result<(Option<Retention>, bool)> {
    let legal_hold = value(headers, "x-amz-object-lock-legal-hold") == Some("ON");

    let mode = value(headers, "x-amz-object-lock-mode");
    let until = value(headers, "x-amz-object-lock-retain-until-date");
    let retention = match (mode, until) {
        (Some(mode), Some(until)) => {
            let mode: RetentionMode = mode.parse()?;
            let until = DateTime::parse_from_rfc3339(until)
                .map_err(|_| {
                    Error::invalid_argument("invalid x-amz-object-lock-retain-until-date")
                })?
                .timestamp();
            Some(Retention { mode, until })
        }
        (None, None) => None,
        _ => {
            return Err(Error::invalid_argument(
                "object-lock mode and retain-until-date must be set together",
            ));
        }
    };
    Ok((retention, legal_hold))
}

/// Whether the caller passed the governance-bypass header.
#[must_use]
pub fn bypass_governance(headers: &HeaderMap) -> bool {
    value(headers, "x-amz-bypass-governance-retention")
        .is_some_and(|v| v.eq_ignore_ascii_case("true"))
}

/// Parse `x-amz-copy-source` into `(bucket, key, version_id)`.
pub fn copy_source(headers: &HeaderMap) -> Result<(String, String, Option<String>)> {
    let raw = value(headers, "x-amz-copy-source")
        .ok_or_else(|| Error::invalid_argument("missing x-amz-copy-source"))?;
    let decoded = percent_decode_str(raw).decode_utf8_lossy().into_owned();

    let (path, version) = match decoded.split_once("?versionId=") {
        Some((path, version)) => (path.to_owned(), Some(version.to_owned())),
        None => (decoded, None),
    };
    let trimmed = path.strip_prefix('/').unwrap_or(&path);
    let (bucket, key) = trimmed
        .split_once('/')
        .filter(|(b, k)| !b.is_empty() && !k.is_empty())
        .ok_or_else(|| Error::invalid_argument("invalid x-amz-copy-source"))?;
    Ok((bucket.to_owned(), key.to_owned(), version))
}

/// Whether the copy replaces metadata (`x-amz-metadata-directive: REPLACE`).
#[must_use]
pub fn metadata_directive_is_replace(headers: &HeaderMap) -> bool {
    value(headers, "x-amz-metadata-directive").is_some_and(|v| v.eq_ignore_ascii_case("REPLACE"))
}

/// Format an epoch timestamp as an HTTP date.
#[must_use]
pub fn http_date(epoch_secs: i64) -> String {
    DateTime::<Utc>::from_timestamp(epoch_secs, 0)
        .unwrap_or_default()
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

/// Apply the standard object headers to a response builder.
#[must_use]
pub fn apply_object_headers(
    mut builder: http::response::Builder,
    record: &ObjectRecord,
) -> http::response::Builder {
    builder = builder
        .header(http::header::ETAG, &record.etag)
        .header(http::header::LAST_MODIFIED, http_date(record.created_at))
        .header(http::header::CONTENT_TYPE, &record.content_type)
        .header("accept-ranges", "bytes");

    if let Some(version_id) = record.wire_version_id() {
        builder = builder.header("x-amz-version-id", version_id);
    }
    if let Some(retention) = record.retention {
        builder = builder
            .header("x-amz-object-lock-mode", retention.mode.as_str())
            .header(
                "x-amz-object-lock-retain-until-date",
                DateTime::<Utc>::from_timestamp(retention.until, 0)
                    .unwrap_or_default()
                    .to_rfc3339(),
            );
    }
    if record.legal_hold {
        builder = builder.header("x-amz-object-lock-legal-hold", "ON");
    }
    for (name, meta_value) in &record.user_metadata {
        if let Ok(header_value) = http::HeaderValue::from_str(meta_value) {
            builder = builder.header(format!("x-amz-meta-{name}"), header_value);
        }
    }
    builder
}
