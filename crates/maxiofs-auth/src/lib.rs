//! Request authentication for the MaxIOFS S3 API.
//!
//! Supports both AWS signature generations:
//!
//! - **SigV4** (`AWS4-HMAC-SHA256 ...` header or `X-Amz-*` query parameters
//!   for presigned URLs), including the 15-minute clock-skew window.
//! - **SigV2** (`AWS <akid>:<sig>` header), covering the common AWS CLI/SDK
//!   header set.
//!
//! Secret keys are resolved through the [`CredentialStore`] trait so the
//! frontend can back verification with the metadata store. All signature
//! comparisons are constant-time.

pub mod canonical;
pub mod credentials;
pub mod error;
pub mod presigned;
pub mod sigv2;
pub mod sigv4;

pub use credentials::{CredentialStore, InMemoryCredentials};
pub use error::AuthError;
pub use presigned::{presign_url, verify_presigned};
pub use sigv2::{is_sigv2, verify_sigv2};
pub use sigv4::{VerifiedCaller, hash_payload, verify_sigv4};

/// Maximum tolerated difference between the request timestamp and server
/// time, in seconds.
pub const MAX_CLOCK_SKEW_SECS: i64 = 15 * 60;
