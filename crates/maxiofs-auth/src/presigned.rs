//! Presigned URLs: generation and verification (SigV4 query auth).
//!
//! A presigned URL carries the credential scope, timestamp, validity window,
//! and signature in `X-Amz-*` query parameters; the payload hash is the
//! literal `UNSIGNED-PAYLOAD`. MaxIOFS generates URLs that sign only the
//! `host` header, which is what the AWS SDKs do by default, and verifies
//! whatever header set the URL declares.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::canonical::{canonical_headers, canonical_query, canonical_uri, uri_encode};
use crate::credentials::CredentialStore;
use crate::error::AuthError;
use crate::sigv4::{SIGV4_ALGORITHM, VerifiedCaller, derive_signing_key, sign, string_to_sign};

/// Payload hash for every presigned request.
const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";

/// AWS caps presigned validity at seven days.
const MAX_EXPIRES_SECS: u64 = 7 * 24 * 3600;

// ---------------------------------------------------------------------------
// Generation
// ---------------------------------------------------------------------------

/// Build a presigned URL authorizing exactly one `method` request against
/// `/{bucket}/{key}` until `now + expires_secs`.
///
/// # Errors
///
/// [`AuthError::MissingQueryParam`] when `expires_secs` is zero or exceeds
/// the seven-day ceiling, or when `base_url` has no host part.
#[allow(clippy::too_many_arguments)]
pub fn presign_url(
    method: &str,
    base_url: &str,
    bucket: &str,
    key: &str,
    access_key_id: &str,
    secret_key: &str,
    region: &str,
    expires_secs: u64,
    now: i64,
) -> Result<String, AuthError> {
    if expires_secs == 0 || expires_secs > MAX_EXPIRES_SECS {
        return Err(AuthError::MissingQueryParam(
            "X-Amz-Expires out of range".to_owned(),
        ));
    }

    let host = host_of(base_url)
        .ok_or_else(|| AuthError::MissingQueryParam("invalid base URL".to_owned()))?;

    let when = DateTime::<Utc>::from_timestamp(now, 0)
        .ok_or_else(|| AuthError::MissingQueryParam("invalid timestamp".to_owned()))?;
    let timestamp = when.format("%Y%m%dT%H%M%SZ").to_string();
    let date = when.format("%Y%m%d").to_string();

    let scope = format!("{date}/{region}/s3/aws4_request");
    let credential = format!("{access_key_id}/{scope}");

    let path = format!(
        "/{bucket}/{}",
        key.split('/').map(uri_encode).collect::<Vec<_>>().join("/")
    );

    // Alphabetical already; kept sorted so the string doubles as the
    // canonical query.
    let query = format!(
        "X-Amz-Algorithm={SIGV4_ALGORITHM}\
         &X-Amz-Credential={}\
         &X-Amz-Date={timestamp}\
         &X-Amz-Expires={expires_secs}\
         &X-Amz-SignedHeaders=host",
        uri_encode(&credential)
    );

    let canonical = format!(
        "{method}\n{}\n{query}\nhost:{host}\n\nhost\n{UNSIGNED_PAYLOAD}",
        canonical_uri(&path)
    );
    let canonical_hash = hex::encode(Sha256::digest(canonical.as_bytes()));
    let sts = string_to_sign(&timestamp, &scope, &canonical_hash);
    let key_material = derive_signing_key(secret_key, &date, region, "s3");
    let signature = sign(&key_material, &sts);

    Ok(format!(
        "{base_url}{path}?{query}&X-Amz-Signature={signature}"
    ))
}

// ---------------------------------------------------------------------------
// Verification
// ---------------------------------------------------------------------------

/// Parsed presigned query parameters.
#[derive(Debug)]
struct PresignedParams {
    access_key_id: String,
    date: String,
    region: String,
    service: String,
    timestamp: String,
    expires: u64,
    signed_headers: Vec<String>,
    signature: String,
}

fn parse_params(query: &str) -> Result<PresignedParams, AuthError> {
    let params: HashMap<String, String> = query
        .split('&')
        .filter(|s| !s.is_empty())
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            Some((
                k.to_owned(),
                percent_encoding::percent_decode_str(v)
                    .decode_utf8_lossy()
                    .into_owned(),
            ))
        })
        .collect();

    let required = |name: &str| -> Result<String, AuthError> {
        params
            .get(name)
            .cloned()
            .ok_or_else(|| AuthError::MissingQueryParam(name.to_owned()))
    };

    let algorithm = required("X-Amz-Algorithm")?;
    if algorithm != SIGV4_ALGORITHM {
        return Err(AuthError::UnsupportedAlgorithm(algorithm));
    }

    let credential = required("X-Amz-Credential")?;
    let scope: Vec<&str> = credential.splitn(5, '/').collect();
    if scope.len() != 5 || scope[4] != "aws4_request" {
        return Err(AuthError::MalformedCredential);
    }

    let expires: u64 = required("X-Amz-Expires")?
        .parse()
        .map_err(|_| AuthError::MissingQueryParam("X-Amz-Expires".to_owned()))?;

    Ok(PresignedParams {
        access_key_id: scope[0].to_owned(),
        date: scope[1].to_owned(),
        region: scope[2].to_owned(),
        service: scope[3].to_owned(),
        timestamp: required("X-Amz-Date")?,
        expires,
        signed_headers: required("X-Amz-SignedHeaders")?
            .split(';')
            .map(ToOwned::to_owned)
            .collect(),
        signature: required("X-Amz-Signature")?,
    })
}

/// Verify a presigned request.
///
/// # Errors
///
/// [`AuthError::Expired`] once `now` passes the validity window; otherwise
/// the usual signature failures.
pub fn verify_presigned(
    parts: &http::request::Parts,
    credentials: &dyn CredentialStore,
    now: i64,
) -> Result<VerifiedCaller, AuthError> {
    let query = parts.uri.query().unwrap_or("");
    let parsed = parse_params(query)?;

    debug!(
        access_key_id = %parsed.access_key_id,
        expires = parsed.expires,
        "verifying presigned URL"
    );

    let signed_at = crate::sigv4::parse_amz_date(&parsed.timestamp)
        .map_err(|_| AuthError::MissingQueryParam("X-Amz-Date".to_owned()))?;
    let expires = i64::try_from(parsed.expires.min(MAX_EXPIRES_SECS)).unwrap_or(i64::MAX);
    if now > signed_at + expires {
        return Err(AuthError::Expired);
    }

    let secret = credentials.secret_for(&parsed.access_key_id)?;

    // The signature parameter itself is excluded from the signed query.
    let unsigned_query: String = query
        .split('&')
        .filter(|p| !p.starts_with("X-Amz-Signature="))
        .collect::<Vec<_>>()
        .join("&");

    let signed_refs: Vec<&str> = parsed.signed_headers.iter().map(String::as_str).collect();
    let mut header_pairs = Vec::with_capacity(signed_refs.len());
    for &name in &signed_refs {
        let value = parts
            .headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AuthError::MissingHeader(name.to_owned()))?;
        header_pairs.push((name, value));
    }

    let canonical = format!(
        "{}\n{}\n{}\n{}\n\n{}\n{UNSIGNED_PAYLOAD}",
        parts.method.as_str(),
        canonical_uri(parts.uri.path()),
        canonical_query(&unsigned_query),
        canonical_headers(&header_pairs, &signed_refs),
        crate::canonical::signed_header_list(&signed_refs),
    );
    let canonical_hash = hex::encode(Sha256::digest(canonical.as_bytes()));

    let scope = format!(
        "{}/{}/{}/aws4_request",
        parsed.date, parsed.region, parsed.service
    );
    let sts = string_to_sign(&parsed.timestamp, &scope, &canonical_hash);
    let key = derive_signing_key(&secret, &parsed.date, &parsed.region, &parsed.service);
    let expected = sign(&key, &sts);

    if bool::from(parsed.signature.as_bytes().ct_eq(expected.as_bytes())) {
        Ok(VerifiedCaller {
            access_key_id: parsed.access_key_id,
            region: parsed.region,
        })
    } else {
        Err(AuthError::SignatureMismatch)
    }
}

/// Whether a query string looks like a presigned request.
#[must_use]
pub fn has_presigned_params(query: &str) -> bool {
    query.contains("X-Amz-Signature=")
}

fn host_of(base_url: &str) -> Option<String> {
    let rest = base_url
        .strip_prefix("https://")
        .or_else(|| base_url.strip_prefix("http://"))?;
    let host = rest.split('/').next()?;
    (!host.is_empty()).then(|| host.to_owned())
}
