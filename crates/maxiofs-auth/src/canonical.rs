//! Canonical request construction for SigV4.
//!
//! The canonical request is the newline-joined form AWS defines:
//!
//! ```text
//! METHOD \n URI \n QUERY \n HEADERS \n\n SIGNED-HEADER-LIST \n PAYLOAD-HASH
//! ```
//!
//! Each component is normalized so that server and client compute the same
//! bytes regardless of incidental formatting differences.

use std::collections::BTreeMap;

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};

/// Characters percent-encoded in URI path segments: everything except the
/// RFC 3986 unreserved set. Slashes separate segments and stay literal.
const SEGMENT_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Assemble the full canonical request string.
#[must_use]
pub fn canonical_request(
    method: &str,
    path: &str,
    query: &str,
    headers: &[(&str, &str)],
    signed_headers: &[&str],
    payload_hash: &str,
) -> String {
    let uri = canonical_uri(path);
    let query = canonical_query(query);
    let headers = canonical_headers(headers, signed_headers);
    let signed = signed_header_list(signed_headers);
    format!("{method}\n{uri}\n{query}\n{headers}\n\n{signed}\n{payload_hash}")
}

/// Canonicalize the URI path: decode each segment, then re-encode it with
/// the SigV4 rules. Decoding first keeps already-encoded and raw paths in
/// agreement, so clients that sign either form verify.
#[must_use]
pub fn canonical_uri(path: &str) -> String {
    if path.is_empty() || path == "/" {
        return "/".to_owned();
    }
    path.split('/')
        .map(|segment| {
            let decoded = percent_decode_str(segment).decode_utf8_lossy();
            utf8_percent_encode(&decoded, SEGMENT_ENCODE_SET).to_string()
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Canonicalize the query string: sort parameters by key then value,
/// preserving the exact encoding the client sent. Clients differ in which
/// characters they escape when signing, and the server must mirror whatever
/// encoding appears on the wire.
#[must_use]
pub fn canonical_query(query: &str) -> String {
    if query.is_empty() {
        return String::new();
    }

    let mut params: Vec<(&str, &str)> = query
        .split('&')
        .filter(|s| !s.is_empty())
        .map(|pair| pair.split_once('=').unwrap_or((pair, "")))
        .collect();
    params.sort_unstable();

    params
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

/// Canonicalize the signed headers: lowercase names, trimmed values with
/// internal whitespace collapsed, sorted by name, duplicates joined with
/// commas. No trailing newline; the request format supplies it.
#[must_use]
pub fn canonical_headers(headers: &[(&str, &str)], signed_headers: &[&str]) -> String {
    let mut merged: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let name = name.to_lowercase();
        let value = collapse_spaces(value.trim());
        merged
            .entry(name)
            .and_modify(|existing| {
                existing.push(',');
                existing.push_str(&value);
            })
            .or_insert(value);
    }

    let mut names: Vec<&str> = signed_headers.to_vec();
    names.sort_unstable();
    names
        .iter()
        .filter_map(|name| merged.get(*name).map(|value| format!("{name}:{value}")))
        .collect::<Vec<_>>()
        .join("\n")
}

/// The `SignedHeaders` component: sorted, semicolon-joined, lowercase names.
#[must_use]
pub fn signed_header_list(signed_headers: &[&str]) -> String {
    let mut names: Vec<&str> = signed_headers.to_vec();
    names.sort_unstable();
    names.join(";")
}

/// Percent-encode a value for a query string we generate ourselves
/// (presigned URLs), using the SigV4 segment rules.
#[must_use]
pub fn uri_encode(value: &str) -> String {
    utf8_percent_encode(value, SEGMENT_ENCODE_SET).to_string()
}

fn collapse_spaces(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_gap = false;
    for ch in s.chars() {
        if ch.is_whitespace() {
            if !in_gap {
                out.push(' ');
                in_gap = true;
            }
        } else {
            out.push(ch);
            in_gap = false;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_normalize_empty_path_to_slash() {
        assert_eq!(canonical_uri(""), "/");
        assert_eq!(canonical_uri("/"), "/");
        assert_eq!(canonical_uri("/photo.jpg"), "/photo.jpg");
    }

    #[test]
    fn test_should_encode_path_segments_without_double_encoding() {
        assert_eq!(canonical_uri("/a b"), "/a%20b");
        assert_eq!(canonical_uri("/a%20b"), "/a%20b");
        assert_eq!(canonical_uri("/ok/sub dir/f.txt"), "/ok/sub%20dir/f.txt");
    }

    #[test]
    fn test_should_sort_query_parameters() {
        assert_eq!(canonical_query("b=2&a=1&c=3"), "a=1&b=2&c=3");
        assert_eq!(canonical_query(""), "");
        // Duplicate keys sort by value.
        assert_eq!(canonical_query("k=z&k=a"), "k=a&k=z");
    }

    #[test]
    fn test_should_preserve_client_encoding_in_query() {
        assert_eq!(
            canonical_query("events=s3%3AObjectCreated%3A%2A"),
            "events=s3%3AObjectCreated%3A%2A"
        );
        assert_eq!(
            canonical_query("events=s3:ObjectCreated:*"),
            "events=s3:ObjectCreated:*"
        );
    }

    #[test]
    fn test_should_build_sorted_lowercase_headers() {
        let headers = [("Host", "  node-1.example  "), ("X-Custom", "a   b")];
        let signed = ["host", "x-custom"];
        let result = canonical_headers(
            &headers.iter().map(|(k, v)| (*k, *v)).collect::<Vec<_>>(),
            &signed,
        );
        assert_eq!(result, "host:node-1.example\nx-custom:a b");
    }

    #[test]
    fn test_should_join_signed_header_list_sorted() {
        assert_eq!(
            signed_header_list(&["x-amz-date", "host", "range"]),
            "host;range;x-amz-date"
        );
    }

    #[test]
    fn test_should_match_aws_canonical_request_vector() {
        use sha2::{Digest, Sha256};

        let headers = vec![
            ("host", "examplebucket.s3.amazonaws.com"),
            ("range", "bytes=0-9"),
            (
                "x-amz-content-sha256",
                "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855",
            ),
            ("x-amz-date", "20130524T000000Z"),
        ];
        let signed = vec!["host", "range", "x-amz-content-sha256", "x-amz-date"];

        let canonical = canonical_request(
            "GET",
            "/test.txt",
            "",
            &headers,
            &signed,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855",
        );

        let hash = hex::encode(Sha256::digest(canonical.as_bytes()));
        assert_eq!(
            hash,
            "7344ae5b7ee6c3e7e6b0fe0640412a37625d1fbfff95c48bbb2dc43964946972"
        );
    }
}
