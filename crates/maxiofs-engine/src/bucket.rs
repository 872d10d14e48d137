//! Bucket lifecycle and bucket-level configuration.
//!
//! Bucket names are globally unique across tenants: creation races resolve
//! inside the write transaction, where the name row is checked and inserted
//! atomically. Deletion requires the bucket to be empty of versions and
//! in-progress uploads; a bucket whose remaining versions are under active
//! retention reports `BucketLocked` instead of `BucketNotEmpty`.

use tracing::{debug, warn};
use uuid::Uuid;

use maxiofs_core::ids;
use maxiofs_core::types::{
    Bucket, DefaultRetention, MultipartUpload, ObjectRecord, VersioningState,
};
use maxiofs_core::{Error, Result};
use maxiofs_meta::keys;

use crate::object::write_tombstone;
use crate::quota::{QuotaDelta, QuotaTracker};
use crate::{ObjectEngine, refs, validation};

/// Inputs to `create_bucket`.
#[derive(Debug, Clone)]
pub struct CreateBucketInput {
    /// Globally unique bucket name.
    pub name: String,
    /// Owning tenant.
    pub tenant_id: Uuid,
    /// Creating user.
    pub owner_user_id: Uuid,
    /// Initial versioning state. Object Lock forces `Enabled`.
    pub versioning: VersioningState,
    /// Whether Object Lock is available; immutable afterwards.
    pub object_lock_enabled: bool,
    /// Default retention for new versions; requires Object Lock.
    pub default_retention: Option<DefaultRetention>,
    /// Whether payloads are encrypted at rest.
    pub encryption_enabled: bool,
}

/// Aggregate usage numbers for one bucket.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct BucketStats {
    /// Live (current, non-marker) objects.
    pub object_count: u64,
    /// Stored versions including markers.
    pub version_count: u64,
    /// Total bytes across stored versions.
    pub total_bytes: u64,
    /// In-progress multipart uploads.
    pub multipart_uploads: u64,
}

impl ObjectEngine {
    /// Create a bucket.
    pub fn create_bucket(&self, input: CreateBucketInput) -> Result<Bucket> {
        validation::validate_bucket_name(&input.name)?;
        if input.default_retention.is_some() && !input.object_lock_enabled {
            return Err(Error::invalid_argument(
                "default retention requires Object Lock",
            ));
        }

        // Object Lock depends on versioned storage.
        let versioning = if input.object_lock_enabled {
            VersioningState::Enabled
        } else {
            input.versioning
        };

        let now = ids::now_secs();
        let bucket = Bucket {
            name: input.name.clone(),
            tenant_id: input.tenant_id,
            owner_user_id: input.owner_user_id,
            node_id: self.local_node_id(),
            created_at: now,
            versioning,
            object_lock_enabled: input.object_lock_enabled,
            default_retention: input.default_retention,
            cors: None,
            policy: None,
            notifications: None,
            encryption_enabled: input.encryption_enabled,
            updated_at: now,
        };

        self.meta().update(|txn| {
            if txn.exists(&keys::bucket(&input.name))? {
                return Err(Error::BucketAlreadyExists {
                    bucket: input.name.clone(),
                });
            }
            QuotaTracker::check_and_reserve(txn, input.tenant_id, QuotaDelta::buckets(1))?;
            txn.put(&keys::bucket(&input.name), &bucket)
        })?;

        debug!(bucket = %input.name, tenant = %input.tenant_id, "bucket created");
        Ok(bucket)
    }

    /// Delete an empty bucket.
    pub async fn delete_bucket(&self, name: &str) -> Result<()> {
        let now = ids::now_secs();
        let tenant_id = self.meta().update(|txn| {
            let bucket: Bucket =
                txn.get(&keys::bucket(name))?
                    .ok_or_else(|| Error::NoSuchBucket {
                        bucket: name.to_owned(),
                    })?;

            // Any stored version blocks deletion; protected versions get
            // the more specific error.
            let versions: Vec<ObjectRecord> =
                txn.scan_values(&keys::object_versions_bucket_prefix(name, ""))?;
            if !versions.is_empty() {
                if versions.iter().any(|v| v.is_protected(now)) {
                    return Err(Error::BucketLocked {
                        bucket: name.to_owned(),
                    });
                }
                return Err(Error::BucketNotEmpty {
                    bucket: name.to_owned(),
                });
            }

            let uploads: Vec<MultipartUpload> = txn.scan_values(&keys::multipart_prefix())?;
            if uploads.iter().any(|u| u.bucket == name) {
                return Err(Error::BucketNotEmpty {
                    bucket: name.to_owned(),
                });
            }

            // Clear any stray current pointers (markers whose versions were
            // individually purged leave none, but be thorough).
            let pointers =
                txn.scan_prefix(&keys::object_current_prefix(name, ""), None, usize::MAX)?;
            for (row_key, _) in &pointers {
                txn.delete(row_key)?;
            }

            txn.delete(&keys::bucket(name))?;
            QuotaTracker::release(txn, bucket.tenant_id, QuotaDelta::buckets(1))?;
            write_tombstone(txn, "bucket", name, Some(bucket.tenant_id))?;
            Ok(bucket.tenant_id)
        })?;

        // Blob teardown is best-effort; the metadata commit is the source
        // of truth.
        let dir = refs::bucket_dir(tenant_id, name);
        if let Err(e) = self.blobs().delete_prefix(&dir).await {
            warn!(bucket = name, error = %e, "failed to remove bucket blobs");
        }

        debug!(bucket = name, "bucket deleted");
        Ok(())
    }

    /// Every bucket owned by `tenant_id`, or all buckets when `None`.
    pub fn list_buckets(&self, tenant_id: Option<Uuid>) -> Result<Vec<Bucket>> {
        let buckets: Vec<Bucket> = self.meta().scan_values(&keys::bucket_prefix())?;
        Ok(buckets
            .into_iter()
            .filter(|b| tenant_id.is_none_or(|t| b.tenant_id == t))
            .collect())
    }

    /// Set the versioning state. Object Lock buckets cannot leave `Enabled`.
    pub fn set_bucket_versioning(&self, name: &str, state: VersioningState) -> Result<()> {
        self.mutate_bucket(name, |bucket| {
            if bucket.object_lock_enabled && state != VersioningState::Enabled {
                return Err(Error::invalid_argument(
                    "versioning cannot be suspended while Object Lock is enabled",
                ));
            }
            if bucket.versioning == VersioningState::Off && state == VersioningState::Off {
                return Ok(());
            }
            // Once versioning has been enabled it can only be suspended,
            // never switched back off.
            if state == VersioningState::Off {
                return Err(Error::invalid_argument(
                    "versioning cannot be disabled once enabled",
                ));
            }
            bucket.versioning = state;
            Ok(())
        })
    }

    /// Store the raw CORS document (`None` deletes it).
    pub fn set_bucket_cors(&self, name: &str, cors: Option<String>) -> Result<()> {
        self.mutate_bucket(name, |bucket| {
            bucket.cors = cors.clone();
            Ok(())
        })
    }

    /// Store the raw policy document (`None` deletes it).
    pub fn set_bucket_policy(&self, name: &str, policy: Option<String>) -> Result<()> {
        self.mutate_bucket(name, |bucket| {
            bucket.policy = policy.clone();
            Ok(())
        })
    }

    /// Store the raw notification configuration.
    pub fn set_bucket_notifications(&self, name: &str, config: Option<String>) -> Result<()> {
        self.mutate_bucket(name, |bucket| {
            bucket.notifications = config.clone();
            Ok(())
        })
    }

    /// Replace the bucket's default Object Lock retention.
    pub fn set_object_lock_config(
        &self,
        name: &str,
        default_retention: Option<DefaultRetention>,
    ) -> Result<()> {
        self.mutate_bucket(name, |bucket| {
            if !bucket.object_lock_enabled {
                return Err(Error::invalid_argument(
                    "Object Lock is not enabled for this bucket",
                ));
            }
            bucket.default_retention = default_retention;
            Ok(())
        })
    }

    /// Usage statistics for one bucket.
    pub fn bucket_stats(&self, name: &str) -> Result<BucketStats> {
        self.require_bucket(name)?;

        let mut stats = BucketStats::default();
        let versions: Vec<ObjectRecord> = self
            .meta()
            .scan_values(&keys::object_versions_bucket_prefix(name, ""))?;
        for version in &versions {
            stats.version_count += 1;
            stats.total_bytes += version.size;
        }

        let pointers = self
            .meta()
            .scan_prefix(&keys::object_current_prefix(name, ""), None, usize::MAX)?;
        for (row_key, bytes) in &pointers {
            let record: ObjectRecord = serde_json::from_slice(bytes).map_err(|e| {
                Error::Internal(anyhow::anyhow!("corrupt record at {row_key}: {e}"))
            })?;
            if !record.is_delete_marker {
                stats.object_count += 1;
            }
        }

        stats.multipart_uploads = self
            .meta()
            .scan_values::<MultipartUpload>(&keys::multipart_prefix())?
            .iter()
            .filter(|u| u.bucket == name)
            .count() as u64;

        Ok(stats)
    }

    fn mutate_bucket(&self, name: &str, mutate: impl Fn(&mut Bucket) -> Result<()>) -> Result<()> {
        self.meta().update(|txn| {
            let mut bucket: Bucket =
                txn.get(&keys::bucket(name))?
                    .ok_or_else(|| Error::NoSuchBucket {
                        bucket: name.to_owned(),
                    })?;
            mutate(&mut bucket)?;
            bucket.updated_at = ids::now_secs();
            txn.put(&keys::bucket(name), &bucket)
        })
    }
}
