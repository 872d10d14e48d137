//! The MaxIOFS object engine.
//!
//! [`ObjectEngine`] composes the metadata store, the blob store, streaming
//! encryption, and quota accounting into S3 semantics: bucket and object
//! lifecycle, versioning, Object Lock enforcement, conditional requests,
//! listings, and multipart uploads.
//!
//! Every mutation commits through a single MetaStore write transaction, so a
//! request either leaves a fully committed new state (version row, current
//! pointer, quota counters, replication queue entries, tombstones) or
//! nothing. Blobs are finalized before the metadata commit; a blob whose
//! transaction failed is deleted on the error path and can at worst end up
//! orphaned, never visible.

pub mod bucket;
pub mod etag;
pub mod list;
pub mod lock;
pub mod multipart;
pub mod object;
pub mod quota;
pub mod refs;
pub mod validation;

use std::sync::Arc;

use uuid::Uuid;

use maxiofs_blob::BlobStore;
use maxiofs_core::types::Bucket;
use maxiofs_core::{Error, Result};
use maxiofs_crypto::MasterKey;
use maxiofs_meta::{MetaStore, keys};

pub use object::{GetOutcome, GetObjectInput, PutObjectInput, PutObjectOutput};
pub use quota::QuotaTracker;

/// Where a mutation originated. Inbound replication writes must not enqueue
/// further replication events, or two mutually replicating nodes would relay
/// the same object back and forth forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOrigin {
    /// A client request on this node.
    Client,
    /// A replicated write pushed by a peer.
    Replication,
}

/// The object engine. Cheap to clone via `Arc` fields; construct once at
/// startup.
#[derive(Debug, Clone)]
pub struct ObjectEngine {
    meta: Arc<MetaStore>,
    blobs: Arc<BlobStore>,
    master_key: Option<MasterKey>,
    encryption_enabled: bool,
    local_node_id: Uuid,
    replication_max_attempts: u32,
}

impl ObjectEngine {
    /// Build an engine over the given stores.
    ///
    /// `encryption_enabled` is the server-level toggle; objects written
    /// while it was on stay readable after it is switched off because
    /// decryption is keyed off the per-version record.
    #[must_use]
    pub fn new(
        meta: Arc<MetaStore>,
        blobs: Arc<BlobStore>,
        master_key: Option<MasterKey>,
        encryption_enabled: bool,
        local_node_id: Uuid,
        replication_max_attempts: u32,
    ) -> Self {
        Self {
            meta,
            blobs,
            master_key,
            encryption_enabled,
            local_node_id,
            replication_max_attempts,
        }
    }

    /// The metadata store backing this engine.
    #[must_use]
    pub fn meta(&self) -> &Arc<MetaStore> {
        &self.meta
    }

    /// The blob store backing this engine.
    #[must_use]
    pub fn blobs(&self) -> &Arc<BlobStore> {
        &self.blobs
    }

    /// The id of the node this engine runs on.
    #[must_use]
    pub fn local_node_id(&self) -> Uuid {
        self.local_node_id
    }

    /// Load a bucket record or fail with `NoSuchBucket`.
    pub fn require_bucket(&self, name: &str) -> Result<Bucket> {
        self.meta
            .get::<Bucket>(&keys::bucket(name))?
            .ok_or_else(|| Error::NoSuchBucket {
                bucket: name.to_owned(),
            })
    }

    /// Whether a write into `bucket` gets encrypted, and with what key.
    ///
    /// Requires the bucket flag, the server toggle, and a loaded key.
    pub(crate) fn encryption_for(&self, bucket: &Bucket) -> Option<&MasterKey> {
        if bucket.encryption_enabled && self.encryption_enabled {
            self.master_key.as_ref()
        } else {
            None
        }
    }

    /// The key used to decrypt already-written objects. Independent of the
    /// server toggle.
    pub(crate) fn decryption_key(&self) -> Result<&MasterKey> {
        self.master_key.as_ref().ok_or_else(|| {
            Error::Internal(anyhow::anyhow!(
                "encrypted object present but no master key is loaded"
            ))
        })
    }

    /// Attempt ceiling stamped onto new replication queue entries.
    pub(crate) fn replication_max_attempts(&self) -> u32 {
        self.replication_max_attempts
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    //! Shared fixtures for engine tests.

    use std::collections::HashMap;
    use std::sync::Arc;

    use uuid::Uuid;

    use maxiofs_blob::BlobStore;
    use maxiofs_core::ids;
    use maxiofs_core::types::Tenant;
    use maxiofs_crypto::MasterKey;
    use maxiofs_meta::{MetaStore, keys};

    use super::ObjectEngine;
    use crate::object::PutObjectInput;

    /// An engine over fresh temp stores plus one tenant.
    pub struct TestEnv {
        pub engine: ObjectEngine,
        pub tenant_id: Uuid,
        pub user_id: Uuid,
        _dir: tempfile::TempDir,
    }

    /// Build a test environment with the given tenant byte quota
    /// (0 = unlimited) and optional encryption.
    pub fn env_with(max_bytes: u64, encrypted: bool) -> TestEnv {
        let dir = tempfile::TempDir::new().unwrap_or_else(|e| panic!("tempdir failed: {e}"));
        let meta = Arc::new(
            MetaStore::open(dir.path().join("meta.redb"))
                .unwrap_or_else(|e| panic!("meta open failed: {e}")),
        );
        let blobs = Arc::new(
            BlobStore::open(dir.path().join("objects"))
                .unwrap_or_else(|e| panic!("blob open failed: {e}")),
        );

        let tenant_id = Uuid::new_v4();
        let tenant = Tenant {
            id: tenant_id,
            name: "test-tenant".to_owned(),
            display_name: "Test".to_owned(),
            max_bytes,
            used_bytes: 0,
            max_buckets: 0,
            used_buckets: 0,
            max_keys: 0,
            used_keys: 0,
            updated_at: ids::now_secs(),
        };
        meta.put(&keys::tenant(tenant_id), &tenant)
            .unwrap_or_else(|e| panic!("tenant put failed: {e}"));

        let key = encrypted.then(MasterKey::generate);
        let engine = ObjectEngine::new(meta, blobs, key, encrypted, Uuid::new_v4(), 3);

        TestEnv {
            engine,
            tenant_id,
            user_id: Uuid::new_v4(),
            _dir: dir,
        }
    }

    /// Plain environment: unlimited quota, no encryption.
    pub fn env() -> TestEnv {
        env_with(0, false)
    }

    /// A minimal PUT input for `(bucket, key)`.
    pub fn put_input(bucket: &str, key: &str) -> PutObjectInput {
        PutObjectInput {
            bucket: bucket.to_owned(),
            key: key.to_owned(),
            content_type: None,
            user_metadata: HashMap::new(),
            tags: Vec::new(),
            retention: None,
            legal_hold: false,
            if_match: None,
            if_none_match: None,
            bypass_governance: false,
        }
    }
}
