//! The MaxIOFS domain error type.
//!
//! [`Error`] covers every failure the storage plane can surface. Each variant
//! maps to an S3 error code (rendered as an XML body by the S3 frontend) and
//! an HTTP status code. The management API reuses the same variants and maps
//! them to JSON.
//!
//! # Usage
//!
//! ```
//! use maxiofs_core::error::Error;
//!
//! let err = Error::NoSuchBucket { bucket: "photos".to_owned() };
//! assert_eq!(err.s3_code(), "NoSuchBucket");
//! assert_eq!(err.http_status(), 404);
//! ```

/// Domain error for all MaxIOFS operations.
///
/// Transient conditions (peer timeouts, storage contention) are represented
/// by [`Error::Conflict`] and [`Error::ServiceUnavailable`]; callers decide
/// whether to retry. Everything else is terminal for the request.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // -----------------------------------------------------------------------
    // Bucket errors
    // -----------------------------------------------------------------------
    /// The specified bucket does not exist.
    #[error("The specified bucket does not exist: {bucket}")]
    NoSuchBucket {
        /// The bucket name that was not found.
        bucket: String,
    },

    /// The requested bucket name is taken (bucket names are global).
    #[error("The requested bucket name is not available: {bucket}")]
    BucketAlreadyExists {
        /// The bucket name that already exists.
        bucket: String,
    },

    /// The bucket still contains objects and cannot be deleted.
    #[error("The bucket you tried to delete is not empty: {bucket}")]
    BucketNotEmpty {
        /// The bucket name that is not empty.
        bucket: String,
    },

    /// The bucket holds versions under active retention.
    #[error("The bucket contains objects under retention: {bucket}")]
    BucketLocked {
        /// The bucket name.
        bucket: String,
    },

    /// The bucket name violates the S3 naming rules.
    #[error("Invalid bucket name: {name}: {reason}")]
    InvalidBucketName {
        /// The invalid bucket name.
        name: String,
        /// Why the name was rejected.
        reason: String,
    },

    // -----------------------------------------------------------------------
    // Object / key errors
    // -----------------------------------------------------------------------
    /// The specified key does not exist.
    #[error("The specified key does not exist: {key}")]
    NoSuchKey {
        /// The key that was not found.
        key: String,
    },

    /// The specified version does not exist.
    #[error("The specified version does not exist: key={key}, version_id={version_id}")]
    NoSuchVersion {
        /// The key for the version.
        key: String,
        /// The version id that was not found.
        version_id: String,
    },

    /// The requested range is not satisfiable.
    #[error("The requested range is not satisfiable")]
    InvalidRange,

    // -----------------------------------------------------------------------
    // Multipart errors
    // -----------------------------------------------------------------------
    /// The specified multipart upload does not exist.
    #[error("The specified upload does not exist: {upload_id}")]
    NoSuchUpload {
        /// The upload id that was not found.
        upload_id: String,
    },

    /// One or more of the specified parts could not be found or the ETag
    /// did not match.
    #[error("One or more of the specified parts could not be found")]
    InvalidPart,

    /// The list of parts was not in ascending order.
    #[error("The list of parts was not in ascending order")]
    InvalidPartOrder,

    /// A non-last part is smaller than the minimum allowed size.
    #[error("Your proposed upload is smaller than the minimum allowed size")]
    EntityTooSmall,

    /// The payload exceeds the maximum allowed size.
    #[error("Your proposed upload exceeds the maximum allowed size")]
    EntityTooLarge,

    // -----------------------------------------------------------------------
    // Auth / access errors
    // -----------------------------------------------------------------------
    /// Access denied (Object Lock, policy, or tenant boundary).
    #[error("Access Denied")]
    AccessDenied,

    /// The access key id does not exist.
    #[error("The AWS access key Id you provided does not exist in our records")]
    InvalidAccessKeyId,

    /// The computed signature did not match the provided one, or the
    /// request clock skew exceeded the tolerance.
    #[error("The request signature we calculated does not match the signature you provided")]
    SignatureDoesNotMatch,

    /// The management session is missing or expired.
    #[error("Authentication required")]
    Unauthorized,

    // -----------------------------------------------------------------------
    // Quota / policy errors
    // -----------------------------------------------------------------------
    /// The tenant exceeded a configured quota.
    #[error("Tenant quota exceeded: {what}")]
    QuotaExceeded {
        /// Which counter was exhausted (bytes, buckets, keys).
        what: String,
    },

    /// The object version is protected by Object Lock.
    #[error("Object is protected by Object Lock")]
    ObjectLocked,

    // -----------------------------------------------------------------------
    // Conditional / concurrency errors
    // -----------------------------------------------------------------------
    /// A precondition specified in the request did not hold.
    #[error("At least one of the preconditions you specified did not hold")]
    PreconditionFailed,

    /// The entity has not been modified (conditional GET).
    #[error("Not modified")]
    NotModified,

    /// A concurrent transaction modified the same record. Retryable.
    #[error("Concurrent modification conflict: {key}")]
    Conflict {
        /// The record key that conflicted.
        key: String,
    },

    // -----------------------------------------------------------------------
    // Validation errors
    // -----------------------------------------------------------------------
    /// A request argument is invalid.
    #[error("Invalid argument: {message}")]
    InvalidArgument {
        /// Description of the invalid argument.
        message: String,
    },

    /// The XML body is malformed.
    #[error("The XML you provided was not well-formed")]
    MalformedXml,

    // -----------------------------------------------------------------------
    // Availability
    // -----------------------------------------------------------------------
    /// The owning node is unreachable and no replica can serve the request,
    /// or the server is in maintenance mode.
    #[error("Service unavailable: {message}")]
    ServiceUnavailable {
        /// Operator-facing detail.
        message: String,
    },

    // -----------------------------------------------------------------------
    // Internal / catch-all
    // -----------------------------------------------------------------------
    /// Irrecoverable internal failure.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl Error {
    /// The S3 error code string for the XML `<Code>` element.
    #[must_use]
    pub fn s3_code(&self) -> &'static str {
        match self {
            Self::NoSuchBucket { .. } => "NoSuchBucket",
            Self::BucketAlreadyExists { .. } => "BucketAlreadyExists",
            Self::BucketNotEmpty { .. } => "BucketNotEmpty",
            Self::BucketLocked { .. } => "BucketLocked",
            Self::InvalidBucketName { .. } => "InvalidBucketName",
            Self::NoSuchKey { .. } => "NoSuchKey",
            Self::NoSuchVersion { .. } => "NoSuchVersion",
            Self::InvalidRange => "InvalidRange",
            Self::NoSuchUpload { .. } => "NoSuchUpload",
            Self::InvalidPart => "InvalidPart",
            Self::InvalidPartOrder => "InvalidPartOrder",
            Self::EntityTooSmall => "EntityTooSmall",
            Self::EntityTooLarge => "EntityTooLarge",
            Self::AccessDenied | Self::ObjectLocked => "AccessDenied",
            Self::InvalidAccessKeyId => "InvalidAccessKeyId",
            Self::SignatureDoesNotMatch => "SignatureDoesNotMatch",
            Self::Unauthorized => "AccessDenied",
            Self::QuotaExceeded { .. } => "QuotaExceeded",
            Self::PreconditionFailed => "PreconditionFailed",
            Self::NotModified => "NotModified",
            Self::Conflict { .. } => "OperationAborted",
            Self::InvalidArgument { .. } => "InvalidArgument",
            Self::MalformedXml => "MalformedXML",
            Self::ServiceUnavailable { .. } => "ServiceUnavailable",
            Self::Internal(_) => "InternalError",
        }
    }

    /// The HTTP status code for this error.
    #[must_use]
    pub fn http_status(&self) -> u16 {
        match self {
            Self::NoSuchBucket { .. }
            | Self::NoSuchKey { .. }
            | Self::NoSuchVersion { .. }
            | Self::NoSuchUpload { .. } => 404,
            Self::BucketAlreadyExists { .. }
            | Self::BucketNotEmpty { .. }
            | Self::BucketLocked { .. }
            | Self::Conflict { .. } => 409,
            Self::InvalidBucketName { .. }
            | Self::InvalidPart
            | Self::InvalidPartOrder
            | Self::EntityTooSmall
            | Self::EntityTooLarge
            | Self::InvalidArgument { .. }
            | Self::MalformedXml => 400,
            Self::AccessDenied
            | Self::ObjectLocked
            | Self::InvalidAccessKeyId
            | Self::SignatureDoesNotMatch
            | Self::QuotaExceeded { .. } => 403,
            Self::Unauthorized => 401,
            Self::PreconditionFailed => 412,
            Self::NotModified => 304,
            Self::InvalidRange => 416,
            Self::ServiceUnavailable { .. } => 503,
            Self::Internal(_) => 500,
        }
    }

    /// Whether a caller may retry the failed operation.
    ///
    /// Only storage contention and availability failures qualify; client
    /// errors never do.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Conflict { .. } | Self::ServiceUnavailable { .. }
        )
    }

    /// Shorthand for an [`Error::InvalidArgument`].
    #[must_use]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Shorthand for an [`Error::ServiceUnavailable`].
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::ServiceUnavailable {
            message: message.into(),
        }
    }
}

/// Convenience result type for MaxIOFS operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_map_not_found_errors_to_404() {
        let cases = [
            Error::NoSuchBucket {
                bucket: "b".to_owned(),
            },
            Error::NoSuchKey { key: "k".to_owned() },
            Error::NoSuchUpload {
                upload_id: "u".to_owned(),
            },
        ];
        for err in cases {
            assert_eq!(err.http_status(), 404, "{err}");
        }
    }

    #[test]
    fn test_should_map_quota_and_lock_errors_to_403() {
        assert_eq!(
            Error::QuotaExceeded {
                what: "bytes".to_owned()
            }
            .http_status(),
            403
        );
        assert_eq!(Error::ObjectLocked.http_status(), 403);
        assert_eq!(Error::ObjectLocked.s3_code(), "AccessDenied");
    }

    #[test]
    fn test_should_expose_s3_codes() {
        assert_eq!(
            Error::BucketAlreadyExists {
                bucket: "b".to_owned()
            }
            .s3_code(),
            "BucketAlreadyExists"
        );
        assert_eq!(Error::SignatureDoesNotMatch.s3_code(), "SignatureDoesNotMatch");
        assert_eq!(Error::PreconditionFailed.http_status(), 412);
    }

    #[test]
    fn test_should_classify_transient_errors() {
        assert!(Error::Conflict { key: "k".to_owned() }.is_transient());
        assert!(Error::unavailable("peer down").is_transient());
        assert!(!Error::AccessDenied.is_transient());
    }

    #[test]
    fn test_should_wrap_internal_errors() {
        let err = Error::Internal(anyhow::anyhow!("disk gone"));
        assert_eq!(err.http_status(), 500);
        assert_eq!(err.s3_code(), "InternalError");
    }
}
