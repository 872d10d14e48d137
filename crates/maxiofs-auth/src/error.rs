//! Authentication failure modes.

use maxiofs_core::Error;

/// Why signature verification failed.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// No `Authorization` header and no presigned query parameters.
    #[error("missing Authorization header")]
    MissingAuthHeader,

    /// The `Authorization` header could not be parsed.
    #[error("malformed Authorization header")]
    MalformedAuthHeader,

    /// The signing algorithm is not supported.
    #[error("unsupported signing algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// The credential scope is not `AKID/date/region/service/aws4_request`.
    #[error("malformed credential scope")]
    MalformedCredential,

    /// The access key id is not registered.
    #[error("unknown access key id: {0}")]
    UnknownAccessKey(String),

    /// A header named in `SignedHeaders` is absent from the request.
    #[error("missing signed header: {0}")]
    MissingHeader(String),

    /// A required presigned query parameter is absent or malformed.
    #[error("missing or invalid query parameter: {0}")]
    MissingQueryParam(String),

    /// The computed signature differs from the provided one.
    #[error("signature mismatch")]
    SignatureMismatch,

    /// The request timestamp is outside the tolerated skew window.
    #[error("request timestamp too far from server time")]
    ClockSkew,

    /// The presigned URL validity window has passed.
    #[error("presigned URL expired")]
    Expired,
}

impl From<AuthError> for Error {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::UnknownAccessKey(_) => Error::InvalidAccessKeyId,
            AuthError::Expired => Error::AccessDenied,
            _ => Error::SignatureDoesNotMatch,
        }
    }
}
