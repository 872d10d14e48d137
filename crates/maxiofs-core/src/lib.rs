//! Core building blocks shared by every MaxIOFS crate.
//!
//! This crate carries no I/O of its own. It defines:
//!
//! - [`config`]: static server configuration and runtime-mutable settings
//! - [`error`]: the domain error enum with S3 error-code and HTTP status
//!   mappings
//! - [`types`]: every persisted record (tenants, users, buckets, object
//!   versions, cluster nodes, replication rules, queue entries, tombstones)
//! - [`ids`]: id and timestamp helpers, including the reverse-sorting
//!   version-id scheme

pub mod config;
pub mod error;
pub mod ids;
pub mod types;

pub use config::{Config, DynamicSettings};
pub use error::{Error, Result};
