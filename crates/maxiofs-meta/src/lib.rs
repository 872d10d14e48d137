//! Durable metadata store for MaxIOFS.
//!
//! [`MetaStore`] is a transactional, ordered key-value store backed by a
//! single [`redb`] database file. Buckets, object versions, tenants, users,
//! access keys, cluster nodes, replication rules, queue entries, and
//! tombstones all live here under the prefixes defined in [`keys`].
//!
//! redb serializes write transactions, which gives every multi-key mutation
//! all-or-nothing semantics and makes compare-and-swap trivially atomic.
//! Read transactions see a consistent snapshot.

pub mod keys;
mod store;

pub use store::{MetaStore, MetaTxn};
