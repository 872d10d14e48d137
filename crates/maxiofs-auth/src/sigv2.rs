//! AWS Signature Version 2 verification.
//!
//! V2 signs with HMAC-SHA1 over a simpler string:
//!
//! ```text
//! VERB \n Content-MD5 \n Content-Type \n Date \n
//! CanonicalizedAmzHeaders CanonicalizedResource
//! ```
//!
//! The `Authorization` header is `AWS <akid>:<base64 signature>`. The header
//! set covered here is the AWS CLI/SDK common case; when `x-amz-date` is
//! present the `Date` slot in the string to sign is empty.

use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::DateTime;
use hmac::{Hmac, KeyInit, Mac};
use sha1::Sha1;
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::credentials::CredentialStore;
use crate::error::AuthError;
use crate::sigv4::{VerifiedCaller, check_skew, parse_amz_date};

type HmacSha1 = Hmac<Sha1>;

/// Sub-resources included in the V2 canonicalized resource, per the classic
/// S3 signing rules.
const SUB_RESOURCES: &[&str] = &[
    "acl",
    "cors",
    "delete",
    "legal-hold",
    "lifecycle",
    "location",
    "logging",
    "notification",
    "object-lock",
    "partNumber",
    "policy",
    "requestPayment",
    "response-cache-control",
    "response-content-disposition",
    "response-content-encoding",
    "response-content-language",
    "response-content-type",
    "response-expires",
    "restore",
    "retention",
    "tagging",
    "torrent",
    "uploadId",
    "uploads",
    "versionId",
    "versioning",
    "versions",
    "website",
];

/// Whether an `Authorization` header value is V2-shaped.
#[must_use]
pub fn is_sigv2(auth_header: &str) -> bool {
    auth_header.starts_with("AWS ") && !auth_header.starts_with("AWS4-")
}

/// Verify a V2-signed request.
///
/// # Errors
///
/// Any [`AuthError`]: malformed header, unknown key, missing date,
/// excessive clock skew, or signature mismatch.
pub fn verify_sigv2(
    parts: &http::request::Parts,
    credentials: &dyn CredentialStore,
    now: i64,
) -> Result<VerifiedCaller, AuthError> {
    let header = parts
        .headers
        .get(http::header::AUTHORIZATION)
        .ok_or(AuthError::MissingAuthHeader)?
        .to_str()
        .map_err(|_| AuthError::MalformedAuthHeader)?;

    let (access_key_id, provided) = parse_v2_header(header)?;
    let secret = credentials.secret_for(&access_key_id)?;

    check_skew(request_epoch(parts)?, now)?;

    let sts = string_to_sign_v2(parts);
    debug!(access_key_id = %access_key_id, "verifying SigV2 request");

    let expected = sign_v2(&secret, &sts);
    if bool::from(provided.as_bytes().ct_eq(expected.as_bytes())) {
        Ok(VerifiedCaller {
            access_key_id,
            region: String::new(),
        })
    } else {
        debug!(access_key_id = %access_key_id, "SigV2 signature mismatch");
        Err(AuthError::SignatureMismatch)
    }
}

fn parse_v2_header(header: &str) -> Result<(String, String), AuthError> {
    let rest = header
        .strip_prefix("AWS ")
        .ok_or(AuthError::MalformedAuthHeader)?;
    let (akid, sig) = rest.split_once(':').ok_or(AuthError::MalformedAuthHeader)?;
    if akid.is_empty() || sig.is_empty() {
        return Err(AuthError::MalformedAuthHeader);
    }
    Ok((akid.to_owned(), sig.to_owned()))
}

/// The request time for skew checking: `x-amz-date` when present, the
/// `Date` header otherwise. Both use the HTTP date format in V2; some SDKs
/// send the ISO basic form in `x-amz-date`, so both are accepted there.
fn request_epoch(parts: &http::request::Parts) -> Result<i64, AuthError> {
    let raw = parts
        .headers
        .get("x-amz-date")
        .or_else(|| parts.headers.get(http::header::DATE))
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AuthError::MissingHeader("date".to_owned()))?;

    DateTime::parse_from_rfc2822(raw)
        .map(|dt| dt.timestamp())
        .or_else(|_| parse_amz_date(raw))
}

fn string_to_sign_v2(parts: &http::request::Parts) -> String {
    let method = parts.method.as_str();
    let content_md5 = header_or_empty(parts, "content-md5");
    let content_type = header_or_empty(parts, "content-type");
    // With x-amz-date present the Date slot is empty; the timestamp rides in
    // the canonicalized amz headers instead.
    let date = if parts.headers.contains_key("x-amz-date") {
        String::new()
    } else {
        header_or_empty(parts, "date")
    };

    let amz_headers = canonicalized_amz_headers(parts);
    let resource = canonicalized_resource(parts);
    format!("{method}\n{content_md5}\n{content_type}\n{date}\n{amz_headers}{resource}")
}

fn canonicalized_amz_headers(parts: &http::request::Parts) -> String {
    let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in &parts.headers {
        let name = name.as_str();
        if name.starts_with("x-amz-") {
            grouped
                .entry(name.to_owned())
                .or_default()
                .push(value.to_str().unwrap_or("").trim().to_owned());
        }
    }

    let mut out = String::new();
    for (name, values) in &grouped {
        out.push_str(name);
        out.push(':');
        out.push_str(&values.join(","));
        out.push('\n');
    }
    out
}

fn canonicalized_resource(parts: &http::request::Parts) -> String {
    let path = parts.uri.path();
    let query = parts.uri.query().unwrap_or("");

    let mut sub: Vec<(String, Option<String>)> = Vec::new();
    for param in query.split('&').filter(|s| !s.is_empty()) {
        let (key, value) = param.split_once('=').map_or((param, None), |(k, v)| {
            let decoded = percent_encoding::percent_decode_str(v)
                .decode_utf8_lossy()
                .into_owned();
            (k, (!decoded.is_empty()).then_some(decoded))
        });
        if SUB_RESOURCES.contains(&key) {
            sub.push((key.to_owned(), value));
        }
    }
    sub.sort_by(|a, b| a.0.cmp(&b.0));

    if sub.is_empty() {
        path.to_owned()
    } else {
        let rendered: Vec<String> = sub
            .iter()
            .map(|(k, v)| match v {
                Some(v) => format!("{k}={v}"),
                None => k.clone(),
            })
            .collect();
        format!("{path}?{}", rendered.join("&"))
    }
}

fn sign_v2(secret: &str, string_to_sign: &str) -> String {
    let mut mac =
        HmacSha1::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(string_to_sign.as_bytes());
    BASE64.encode(mac.finalize().into_bytes())
}

fn header_or_empty(parts: &http::request::Parts, name: &str) -> String {
    parts
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::InMemoryCredentials;

    const AKID: &str = "maxioadmin";
    const SECRET: &str = "maxioadmin-secret";

    fn credentials() -> InMemoryCredentials {
        InMemoryCredentials::new(vec![(AKID.to_owned(), SECRET.to_owned())])
    }

    #[test]
    fn test_should_detect_v2_header_shape() {
        assert!(is_sigv2("AWS AKID:c2ln"));
        assert!(!is_sigv2("AWS4-HMAC-SHA256 Credential=..."));
        assert!(!is_sigv2("Bearer token"));
    }

    #[test]
    fn test_should_verify_v2_roundtrip() {
        let date = "Fri, 24 May 2013 00:00:00 GMT";
        let now = 1_369_353_600;

        let sts = format!("GET\n\n\n{date}\n/bucket/key.txt");
        let signature = sign_v2(SECRET, &sts);
        let auth = format!("AWS {AKID}:{signature}");

        let (parts, ()) = http::Request::builder()
            .method("GET")
            .uri("http://node:8080/bucket/key.txt")
            .header("host", "node:8080")
            .header("date", date)
            .header(http::header::AUTHORIZATION, &auth)
            .body(())
            .unwrap()
            .into_parts();

        let caller = verify_sigv2(&parts, &credentials(), now)
            .unwrap_or_else(|e| panic!("verification failed: {e}"));
        assert_eq!(caller.access_key_id, AKID);
    }

    #[test]
    fn test_should_include_subresources_in_resource() {
        let (parts, ()) = http::Request::builder()
            .method("GET")
            .uri("http://node/bucket?versioning&prefix=a")
            .body(())
            .unwrap()
            .into_parts();
        // `prefix` is not a sub-resource; `versioning` is.
        assert_eq!(canonicalized_resource(&parts), "/bucket?versioning");
    }

    #[test]
    fn test_should_sort_and_group_amz_headers() {
        let (parts, ()) = http::Request::builder()
            .method("PUT")
            .uri("http://node/b/k")
            .header("x-amz-meta-b", "2")
            .header("x-amz-meta-a", "1")
            .body(())
            .unwrap()
            .into_parts();
        assert_eq!(
            canonicalized_amz_headers(&parts),
            "x-amz-meta-a:1\nx-amz-meta-b:2\n"
        );
    }

    #[test]
    fn test_should_reject_v2_with_bad_signature() {
        let date = "Fri, 24 May 2013 00:00:00 GMT";
        let (parts, ()) = http::Request::builder()
            .method("GET")
            .uri("http://node/bucket/key.txt")
            .header("date", date)
            .header(http::header::AUTHORIZATION, format!("AWS {AKID}:bogus"))
            .body(())
            .unwrap()
            .into_parts();

        let result = verify_sigv2(&parts, &credentials(), 1_369_353_600);
        assert!(matches!(result, Err(AuthError::SignatureMismatch)));
    }

    #[test]
    fn test_should_reject_v2_with_stale_date() {
        let date = "Fri, 24 May 2013 00:00:00 GMT";
        let sts = format!("GET\n\n\n{date}\n/b/k");
        let auth = format!("AWS {AKID}:{}", sign_v2(SECRET, &sts));
        let (parts, ()) = http::Request::builder()
            .method("GET")
            .uri("http://node/b/k")
            .header("date", date)
            .header(http::header::AUTHORIZATION, &auth)
            .body(())
            .unwrap()
            .into_parts();

        // An hour after the signed date.
        let result = verify_sigv2(&parts, &credentials(), 1_369_353_600 + 3600);
        assert!(matches!(result, Err(AuthError::ClockSkew)));
    }

    #[test]
    fn test_should_reject_malformed_v2_headers() {
        assert!(parse_v2_header("AWS :sig").is_err());
        assert!(parse_v2_header("AWS akid:").is_err());
        assert!(parse_v2_header("AWS nocolon").is_err());
        assert!(parse_v2_header("Bearer x").is_err());
    }
}
