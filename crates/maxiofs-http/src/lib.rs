//! HTTP surfaces of MaxIOFS.
//!
//! Three listener-facing layers share this crate:
//!
//! - [`s3`]: the S3-compatible data plane: request routing (path and
//!   virtual-host style), SigV2/V4 authentication, operation dispatch into
//!   the engine or across the cluster, and S3 XML response/error bodies.
//! - [`mgmt`]: the session-authenticated management REST API (tenants,
//!   users, access keys, buckets, cluster, replication) with audit records.
//! - [`internal`]: the HMAC-signed `/_internal` peer endpoints used by
//!   replication, tenant sync, federated bucket resolution, and snapshot
//!   reconciliation.

pub mod body;
pub mod identity;
pub mod internal;
pub mod metrics;
pub mod mgmt;
pub mod s3;
pub mod state;

pub use state::AppState;
