//! S3 request routing: addressing style and operation identification.
//!
//! The bucket comes from the `Host` header for virtual-host-style requests
//! (`{bucket}.{domain}`) or from the first path segment otherwise; the rest
//! of the path is the key. The operation falls out of the method, the
//! path shape, the query sub-resource selectors (`?uploads`, `?retention`,
//! `?versioning`, ...), and a few headers (`x-amz-copy-source`).

use http::Method;
use percent_encoding::percent_decode_str;

use maxiofs_core::{Error, Result};

use super::operations::S3Operation;

/// Routing configuration.
#[derive(Debug, Clone)]
pub struct S3Router {
    /// Domain suffix for virtual-host addressing (e.g. `s3.localhost`).
    pub domain: String,
}

/// The routing result for one request.
#[derive(Debug, Clone)]
pub struct RoutingContext {
    /// Resolved bucket, if the request addresses one.
    pub bucket: Option<String>,
    /// Resolved key, if the request addresses an object.
    pub key: Option<String>,
    /// The identified operation.
    pub operation: S3Operation,
    /// Decoded query parameters.
    pub query: Vec<(String, String)>,
}

impl RoutingContext {
    /// Value of a query parameter.
    #[must_use]
    pub fn query_value(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

impl S3Router {
    /// Build a router for the given virtual-host domain.
    #[must_use]
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
        }
    }

    /// Resolve a request into bucket, key, and operation.
    pub fn resolve<B>(&self, req: &http::Request<B>) -> Result<RoutingContext> {
        self.resolve_parts(req.method(), req.uri(), req.headers())
    }

    /// Resolve from the request components directly.
    pub fn resolve_parts(
        &self,
        method: &Method,
        uri: &http::Uri,
        headers: &http::HeaderMap,
    ) -> Result<RoutingContext> {
        let query = parse_query(uri.query().unwrap_or(""));
        let path = uri.path();

        let (bucket, key) = match self.virtual_host_bucket(headers) {
            Some(vhost_bucket) => {
                let key = path.strip_prefix('/').filter(|k| !k.is_empty());
                (Some(vhost_bucket), key.map(decode))
            }
            None => split_path(path),
        };

        let operation = identify(method, bucket.as_deref(), key.as_deref(), &query, headers)?;

        Ok(RoutingContext {
            bucket,
            key,
            operation,
            query,
        })
    }

    fn virtual_host_bucket(&self, headers: &http::HeaderMap) -> Option<String> {
        let host = headers
            .get(http::header::HOST)
            .and_then(|v| v.to_str().ok())?;
        let host = host.split(':').next().unwrap_or(host);
        let suffix = format!(".{}", self.domain);
        let bucket = host.strip_suffix(&suffix)?;
        (!bucket.is_empty()).then(|| bucket.to_owned())
    }
}

fn decode(component: &str) -> String {
    percent_decode_str(component).decode_utf8_lossy().into_owned()
}

/// Split `/{bucket}/{key...}` into its parts.
fn split_path(path: &str) -> (Option<String>, Option<String>) {
    let trimmed = path.strip_prefix('/').unwrap_or(path);
    if trimmed.is_empty() {
        return (None, None);
    }
    match trimmed.split_once('/') {
        Some((bucket, key)) if !key.is_empty() => (Some(decode(bucket)), Some(decode(key))),
        Some((bucket, _)) => (Some(decode(bucket)), None),
        None => (Some(decode(trimmed)), None),
    }
}

fn parse_query(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|s| !s.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (decode(k), decode(v)),
            None => (decode(pair), String::new()),
        })
        .collect()
}

fn has(query: &[(String, String)], name: &str) -> bool {
    query.iter().any(|(k, _)| k == name)
}

fn value<'q>(query: &'q [(String, String)], name: &str) -> Option<&'q str> {
    query
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_str())
}

fn identify(
    method: &Method,
    bucket: Option<&str>,
    key: Option<&str>,
    query: &[(String, String)],
    headers: &http::HeaderMap,
) -> Result<S3Operation> {
    match (bucket, key) {
        (None, None) => match *method {
            Method::GET => Ok(S3Operation::ListBuckets),
            _ => Err(Error::invalid_argument(
                "only GET is supported at the service level",
            )),
        },
        (Some(_), None) => identify_bucket_op(method, query),
        (Some(_), Some(_)) => identify_object_op(method, query, headers),
        (None, Some(_)) => Err(Error::invalid_argument("key without bucket")),
    }
}

fn identify_bucket_op(method: &Method, query: &[(String, String)]) -> Result<S3Operation> {
    match *method {
        Method::GET => Ok(if value(query, "list-type") == Some("2") {
            S3Operation::ListObjectsV2
        } else if has(query, "location") {
            S3Operation::GetBucketLocation
        } else if has(query, "versioning") {
            S3Operation::GetBucketVersioning
        } else if has(query, "cors") {
            S3Operation::GetBucketCors
        } else if has(query, "policy") {
            S3Operation::GetBucketPolicy
        } else if has(query, "notification") {
            S3Operation::GetBucketNotification
        } else if has(query, "object-lock") {
            S3Operation::GetObjectLockConfig
        } else if has(query, "uploads") {
            S3Operation::ListMultipartUploads
        } else if has(query, "versions") {
            S3Operation::ListObjectVersions
        } else {
            S3Operation::ListObjects
        }),
        Method::PUT => Ok(if has(query, "versioning") {
            S3Operation::PutBucketVersioning
        } else if has(query, "cors") {
            S3Operation::PutBucketCors
        } else if has(query, "policy") {
            S3Operation::PutBucketPolicy
        } else if has(query, "notification") {
            S3Operation::PutBucketNotification
        } else if has(query, "object-lock") {
            S3Operation::PutObjectLockConfig
        } else {
            S3Operation::CreateBucket
        }),
        Method::DELETE => Ok(if has(query, "cors") {
            S3Operation::DeleteBucketCors
        } else if has(query, "policy") {
            S3Operation::DeleteBucketPolicy
        } else {
            S3Operation::DeleteBucket
        }),
        Method::HEAD => Ok(S3Operation::HeadBucket),
        Method::POST if has(query, "delete") => Ok(S3Operation::DeleteObjects),
        _ => Err(Error::invalid_argument("unsupported bucket operation")),
    }
}

fn identify_object_op(
    method: &Method,
    query: &[(String, String)],
    headers: &http::HeaderMap,
) -> Result<S3Operation> {
    match *method {
        Method::GET => Ok(if has(query, "tagging") {
            S3Operation::GetObjectTagging
        } else if has(query, "retention") {
            S3Operation::GetObjectRetention
        } else if has(query, "legal-hold") {
            S3Operation::GetObjectLegalHold
        } else if has(query, "acl") {
            S3Operation::GetObjectAcl
        } else if has(query, "uploadId") {
            S3Operation::ListParts
        } else {
            S3Operation::GetObject
        }),
        Method::PUT => Ok(if has(query, "tagging") {
            S3Operation::PutObjectTagging
        } else if has(query, "retention") {
            S3Operation::PutObjectRetention
        } else if has(query, "legal-hold") {
            S3Operation::PutObjectLegalHold
        } else if has(query, "uploadId") && has(query, "partNumber") {
            S3Operation::UploadPart
        } else if headers.contains_key("x-amz-copy-source") {
            S3Operation::CopyObject
        } else {
            S3Operation::PutObject
        }),
        Method::DELETE => Ok(if has(query, "tagging") {
            S3Operation::DeleteObjectTagging
        } else if has(query, "uploadId") {
            S3Operation::AbortMultipartUpload
        } else {
            S3Operation::DeleteObject
        }),
        Method::HEAD => Ok(S3Operation::HeadObject),
        Method::POST => {
            if has(query, "uploads") {
                Ok(S3Operation::CreateMultipartUpload)
            } else if has(query, "uploadId") {
                Ok(S3Operation::CompleteMultipartUpload)
            } else {
                Err(Error::invalid_argument("unsupported object POST"))
            }
        }
        _ => Err(Error::invalid_argument("unsupported object operation")),
    }
}
