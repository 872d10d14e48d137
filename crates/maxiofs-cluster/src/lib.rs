//! Clustering for MaxIOFS.
//!
//! A MaxIOFS cluster is a set of peers that each own their buckets
//! outright. There is no consensus layer: nodes register each other, share
//! one HMAC secret (the node token), probe each other's health, route S3
//! requests to the owning node, and replicate bucket contents
//! asynchronously through a durable queue.
//!
//! - [`manager`]: local node identity and the peer registry
//! - [`cache`]: the TTL'd bucket-to-owner location cache
//! - [`health`]: the background health-probe loop
//! - [`rpc`]: HMAC-signed inter-node requests and inbound verification
//! - [`router`]: per-request owner resolution and failover decisions
//! - [`replication`]: queue workers, backoff, and per-rule statistics
//! - [`reconcile`]: stale-node snapshot merge with tombstone suppression

pub mod cache;
pub mod health;
pub mod manager;
pub mod reconcile;
pub mod replication;
pub mod router;
pub mod rpc;

pub use cache::LocationCache;
pub use health::HealthChecker;
pub use manager::{ClusterManager, LocalNodeConfig};
pub use reconcile::{Reconciler, StateSnapshot};
pub use replication::ReplicationEngine;
pub use router::{RequestRouter, RouteDecision};
pub use rpc::{RpcClient, SIGNED_HEADER_NODE, SIGNED_HEADER_NONCE, SIGNED_HEADER_SIGNATURE, SIGNED_HEADER_TIMESTAMP};
