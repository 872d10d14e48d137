//! Object CRUD: PUT, GET, HEAD, DELETE, COPY, and tagging.
//!
//! Version bookkeeping uses two row families. Every version is a row under
//! `object:{bucket}\0{key}\0{sort_key}` whose scan order is newest-first;
//! the current version is mirrored into a pointer row at
//! `objcur:{bucket}\0{key}`. All metadata changes for one request commit in
//! a single write transaction, so concurrent writers serialize on the store
//! and conditional checks are race-free.

use std::collections::HashMap;

use bytes::Bytes;
use tokio::io::AsyncRead;
use tracing::{debug, warn};
use uuid::Uuid;

use maxiofs_core::ids::{self, NULL_VERSION_ID};
use maxiofs_core::types::{
    Bucket, ObjectRecord, ReplicationOp, ReplicationQueueEntry, ReplicationRule, Retention,
    RetentionMode, Tombstone, VersioningState,
};
use maxiofs_core::{Error, Result};
use maxiofs_crypto::CtrStream;
use maxiofs_meta::{MetaTxn, keys};

use crate::quota::{QuotaDelta, QuotaTracker};
use crate::{ObjectEngine, WriteOrigin, etag, refs, validation};

// ---------------------------------------------------------------------------
// Inputs / outputs
// ---------------------------------------------------------------------------

/// Inputs to a PUT.
#[derive(Debug, Clone)]
pub struct PutObjectInput {
    /// Destination bucket.
    pub bucket: String,
    /// Destination key.
    pub key: String,
    /// Content type; defaults to `application/octet-stream`.
    pub content_type: Option<String>,
    /// `x-amz-meta-*` metadata.
    pub user_metadata: HashMap<String, String>,
    /// Object tags.
    pub tags: Vec<(String, String)>,
    /// Explicit per-version retention from request headers.
    pub retention: Option<Retention>,
    /// Legal hold flag from request headers.
    pub legal_hold: bool,
    /// `If-Match` condition.
    pub if_match: Option<String>,
    /// `If-None-Match` condition.
    pub if_none_match: Option<String>,
    /// Whether a permitted caller passed the governance-bypass header.
    pub bypass_governance: bool,
}

/// Result of a committed PUT.
#[derive(Debug, Clone)]
pub struct PutObjectOutput {
    /// Quoted ETag of the new version.
    pub etag: String,
    /// Version id for `x-amz-version-id`; absent for `null` versions.
    pub version_id: Option<String>,
    /// Plaintext size.
    pub size: u64,
}

/// A byte range request, as parsed from the `Range` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeSpec {
    /// `bytes=start-end`, both inclusive.
    FromTo(u64, u64),
    /// `bytes=start-`.
    From(u64),
    /// `bytes=-suffix_len`.
    Suffix(u64),
}

impl RangeSpec {
    /// Resolve against an object size into `(offset, length)`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidRange`] when the range selects no bytes.
    pub fn resolve(self, size: u64) -> Result<(u64, u64)> {
        match self {
            Self::FromTo(start, end) => {
                if start > end || start >= size {
                    return Err(Error::InvalidRange);
                }
                let end = end.min(size - 1);
                Ok((start, end - start + 1))
            }
            Self::From(start) => {
                if start >= size {
                    return Err(Error::InvalidRange);
                }
                Ok((start, size - start))
            }
            Self::Suffix(len) => {
                if len == 0 || size == 0 {
                    return Err(Error::InvalidRange);
                }
                let len = len.min(size);
                Ok((size - len, len))
            }
        }
    }
}

/// Inputs to a GET or HEAD.
#[derive(Debug, Clone, Default)]
pub struct GetObjectInput {
    /// Bucket name.
    pub bucket: String,
    /// Object key.
    pub key: String,
    /// Specific version, or the current one.
    pub version_id: Option<String>,
    /// Byte range.
    pub range: Option<RangeSpec>,
    /// `If-Match` condition.
    pub if_match: Option<String>,
    /// `If-None-Match` condition (a match yields `304`).
    pub if_none_match: Option<String>,
}

/// A successfully resolved object with an open payload stream.
pub struct FoundObject {
    /// The version record.
    pub record: ObjectRecord,
    /// Decrypted payload stream (range-restricted when requested).
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    /// Bytes the reader will yield.
    pub content_length: u64,
    /// `(start, end, total)` when this is a range response.
    pub content_range: Option<(u64, u64, u64)>,
}

impl std::fmt::Debug for FoundObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FoundObject")
            .field("record", &self.record)
            .field("content_length", &self.content_length)
            .field("content_range", &self.content_range)
            .finish_non_exhaustive()
    }
}

/// Outcome of a GET: either the object, or the knowledge that the current
/// version is a delete marker (404 with the marker's version id).
#[derive(Debug)]
pub enum GetOutcome {
    /// The object was found.
    Found(Box<FoundObject>),
    /// The current version is a delete marker.
    DeleteMarker {
        /// The marker's version id.
        version_id: String,
    },
}

/// Result of a DELETE.
#[derive(Debug, Clone)]
pub struct DeleteOutcome {
    /// Whether a delete marker was written (versioned buckets).
    pub delete_marker: bool,
    /// Version id of the marker or the removed version.
    pub version_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Engine operations
// ---------------------------------------------------------------------------

impl ObjectEngine {
    /// Store a new object version.
    pub async fn put_object(
        &self,
        origin: WriteOrigin,
        input: PutObjectInput,
        body: Bytes,
    ) -> Result<PutObjectOutput> {
        validation::validate_object_key(&input.key)?;
        validation::validate_user_metadata(&input.user_metadata)?;

        let bucket = self.require_bucket(&input.bucket)?;
        let now = ids::now_secs();
        let size = body.len() as u64;
        let md5 = etag::md5_hex(&body);

        // Version identity: versioned buckets surface the generated id;
        // off/suspended buckets surface "null" but still need a sort key.
        let sort_key = ids::new_version_id();
        let version_id = if bucket.versioning == VersioningState::Enabled {
            sort_key.clone()
        } else {
            NULL_VERSION_ID.to_owned()
        };

        let retention = input.retention.or_else(|| default_retention(&bucket, now));
        if retention.is_some() && !bucket.object_lock_enabled {
            return Err(Error::invalid_argument(
                "bucket does not have Object Lock enabled",
            ));
        }

        let encryption = self.encryption_for(&bucket);
        let iv = encryption.map(|_| maxiofs_crypto::random_iv());
        let blob_ref = refs::object_blob(bucket.tenant_id, &input.bucket, &input.key, &sort_key);

        // Blob first: stream to the final ref before the metadata commit. A
        // failed commit deletes it again; a crash in between leaves an
        // orphan that is never referenced.
        let written = match (encryption, iv) {
            (Some(key), Some(iv)) => {
                let reader = CtrStream::new(key, &iv, body.as_ref());
                self.blobs.write(&blob_ref, reader).await?
            }
            _ => self.blobs.write(&blob_ref, body.as_ref()).await?,
        };
        debug_assert_eq!(written, size);

        let record = ObjectRecord {
            bucket: input.bucket.clone(),
            key: input.key.clone(),
            version_id: version_id.clone(),
            sort_key: sort_key.clone(),
            size,
            etag: format!("\"{md5}\""),
            content_type: input
                .content_type
                .unwrap_or_else(|| "application/octet-stream".to_owned()),
            user_metadata: input.user_metadata,
            tags: input.tags,
            created_at: now,
            encrypted: encryption.is_some(),
            iv_hex: iv.map(hex::encode),
            retention,
            legal_hold: input.legal_hold,
            is_delete_marker: false,
            blob_ref: Some(blob_ref.clone()),
        };

        let max_attempts = self.replication_max_attempts();
        let versioned = bucket.versioning == VersioningState::Enabled;
        let commit = self.meta().update(|txn| {
            // Re-check the bucket inside the transaction; it may have been
            // deleted since the pre-read.
            let bucket: Bucket = txn.get(&keys::bucket(&input.bucket))?.ok_or_else(|| {
                Error::NoSuchBucket {
                    bucket: input.bucket.clone(),
                }
            })?;

            let current: Option<ObjectRecord> =
                txn.get(&keys::object_current(&input.bucket, &input.key))?;
            check_write_conditions(
                current.as_ref(),
                input.if_match.as_deref(),
                input.if_none_match.as_deref(),
            )?;

            // Overwriting the only copy of a protected version is a delete
            // in disguise; versioned buckets keep the old version instead.
            // Suspended buckets replace only the previous null version and
            // retain real versions.
            let mut replaced: Option<ObjectRecord> = None;
            if !versioned {
                if let Some(old) = current
                    .filter(|r| !r.is_delete_marker && r.version_id == NULL_VERSION_ID)
                {
                    ensure_unprotected(&old, now, input.bypass_governance)?;
                    replaced = Some(old);
                }
            }

            let byte_delta = size as i64 - replaced.as_ref().map_or(0, |r| r.size as i64);
            QuotaTracker::check_and_reserve(
                txn,
                bucket.tenant_id,
                QuotaDelta::bytes(byte_delta),
            )?;

            if let Some(old) = &replaced {
                txn.delete(&keys::object_version(&input.bucket, &input.key, &old.sort_key))?;
            }
            txn.put(
                &keys::object_version(&input.bucket, &input.key, &sort_key),
                &record,
            )?;
            txn.put(&keys::object_current(&input.bucket, &input.key), &record)?;

            if origin == WriteOrigin::Client {
                enqueue_replication(txn, &input.bucket, &input.key, ReplicationOp::Put, max_attempts)?;
            }
            Ok(replaced.and_then(|r| r.blob_ref))
        });

        match commit {
            Ok(replaced_blob) => {
                if let Some(old_ref) = replaced_blob {
                    if let Err(e) = self.blobs.delete(&old_ref).await {
                        warn!(blob_ref = %old_ref, error = %e, "failed to remove replaced blob");
                    }
                }
                debug!(
                    bucket = %input.bucket,
                    key = %input.key,
                    version_id = %version_id,
                    size,
                    "put_object committed"
                );
                Ok(PutObjectOutput {
                    etag: record.etag,
                    version_id: (version_id != NULL_VERSION_ID).then_some(version_id),
                    size,
                })
            }
            Err(err) => {
                // Unwind the blob so a failed request leaves nothing behind.
                if let Err(e) = self.blobs.delete(&blob_ref).await {
                    warn!(blob_ref = %blob_ref, error = %e, "failed to unwind blob");
                }
                Err(err)
            }
        }
    }

    /// Resolve an object version and open its payload.
    pub async fn get_object(&self, input: GetObjectInput) -> Result<GetOutcome> {
        let record = match self.head_object(&input)? {
            GetOutcome::Found(found) => found.record,
            marker @ GetOutcome::DeleteMarker { .. } => return Ok(marker),
        };

        let blob_ref = record.blob_ref.clone().ok_or_else(|| Error::NoSuchKey {
            key: input.key.clone(),
        })?;

        let (offset, length, content_range) = match input.range {
            Some(spec) => {
                let (offset, length) = spec.resolve(record.size)?;
                (
                    offset,
                    length,
                    Some((offset, offset + length - 1, record.size)),
                )
            }
            None => (0, record.size, None),
        };

        // A full read passes no range so empty objects open cleanly.
        let blob_range = content_range.map(|_| (offset, length));
        let raw = self.blobs().open_reader(&blob_ref, blob_range).await?;
        let reader: Box<dyn AsyncRead + Send + Unpin> = if record.encrypted {
            let iv_hex = record.iv_hex.as_deref().ok_or_else(|| {
                Error::Internal(anyhow::anyhow!("encrypted record missing IV"))
            })?;
            let iv = maxiofs_crypto::parse_iv(iv_hex)?;
            Box::new(CtrStream::with_offset(
                self.decryption_key()?,
                &iv,
                raw,
                offset,
            ))
        } else {
            Box::new(raw)
        };

        Ok(GetOutcome::Found(Box::new(FoundObject {
            record,
            reader,
            content_length: length,
            content_range,
        })))
    }

    /// Resolve an object version without opening the payload.
    pub fn head_object(&self, input: &GetObjectInput) -> Result<GetOutcome> {
        self.require_bucket(&input.bucket)?;

        let record = match &input.version_id {
            Some(version) => self.find_version(&input.bucket, &input.key, version)?,
            None => self
                .meta()
                .get::<ObjectRecord>(&keys::object_current(&input.bucket, &input.key))?
                .ok_or_else(|| Error::NoSuchKey {
                    key: input.key.clone(),
                })?,
        };

        if record.is_delete_marker {
            return Ok(GetOutcome::DeleteMarker {
                version_id: record.version_id,
            });
        }

        // Read conditionals: If-None-Match hits produce 304, If-Match
        // misses produce 412.
        if let Some(if_match) = input.if_match.as_deref() {
            if if_match != "*" && etag::unquote(if_match) != etag::unquote(&record.etag) {
                return Err(Error::PreconditionFailed);
            }
        }
        if let Some(if_none_match) = input.if_none_match.as_deref() {
            if if_none_match == "*" || etag::unquote(if_none_match) == etag::unquote(&record.etag)
            {
                return Err(Error::NotModified);
            }
        }

        let content_length = record.size;
        Ok(GetOutcome::Found(Box::new(FoundObject {
            record,
            reader: Box::new(tokio::io::empty()),
            content_length,
            content_range: None,
        })))
    }

    /// Delete an object (or one version of it).
    ///
    /// Unversioned buckets purge the current version and release its bytes.
    /// Versioned buckets write a delete marker unless a specific version is
    /// addressed. Object Lock is enforced before anything changes. Deleting
    /// a missing key succeeds (deletes are idempotent).
    pub async fn delete_object(
        &self,
        origin: WriteOrigin,
        bucket_name: &str,
        key: &str,
        version_id: Option<&str>,
        bypass_governance: bool,
    ) -> Result<DeleteOutcome> {
        let bucket = self.require_bucket(bucket_name)?;
        let now = ids::now_secs();
        let max_attempts = self.replication_max_attempts();
        let versioned = bucket.versioning != VersioningState::Off;

        let (outcome, doomed_blobs) = self.meta().update(|txn| {
            let current_key = keys::object_current(bucket_name, key);
            let current: Option<ObjectRecord> = txn.get(&current_key)?;

            if let Some(version) = version_id {
                // Version-addressed delete: purge exactly that version.
                let Some(target) = find_version_in_txn(txn, bucket_name, key, version)? else {
                    // Idempotent.
                    return Ok((
                        DeleteOutcome {
                            delete_marker: false,
                            version_id: Some(version.to_owned()),
                        },
                        Vec::new(),
                    ));
                };
                ensure_unprotected(&target, now, bypass_governance)?;

                txn.delete(&keys::object_version(bucket_name, key, &target.sort_key))?;
                if !target.is_delete_marker {
                    QuotaTracker::release(
                        txn,
                        bucket.tenant_id,
                        QuotaDelta::bytes(target.size as i64),
                    )?;
                }

                // If the purged version was current, promote the next one.
                let was_current = current
                    .as_ref()
                    .is_some_and(|c| c.sort_key == target.sort_key);
                if was_current {
                    let remaining = txn.scan_prefix(
                        &keys::object_versions_prefix(bucket_name, key),
                        None,
                        1,
                    )?;
                    match remaining.first() {
                        Some((row_key, bytes)) => {
                            let next: ObjectRecord = serde_json::from_slice(bytes).map_err(|e| {
                                Error::Internal(anyhow::anyhow!("corrupt record at {row_key}: {e}"))
                            })?;
                            txn.put(&current_key, &next)?;
                        }
                        None => txn.delete(&current_key)?,
                    }
                }

                write_tombstone(txn, "object", &format!("{bucket_name}/{key}"), Some(bucket.tenant_id))?;
                if origin == WriteOrigin::Client {
                    enqueue_delete_replication(txn, bucket_name, key, max_attempts)?;
                }

                Ok((
                    DeleteOutcome {
                        delete_marker: target.is_delete_marker,
                        version_id: Some(target.version_id),
                    },
                    target.blob_ref.into_iter().collect(),
                ))
            } else if versioned {
                // Plain delete on a versioned bucket: hide with a marker.
                if let Some(cur) = current.as_ref().filter(|r| !r.is_delete_marker) {
                    ensure_unprotected(cur, now, bypass_governance)?;
                }

                let marker_sort = ids::new_version_id();
                let marker = ObjectRecord {
                    bucket: bucket_name.to_owned(),
                    key: key.to_owned(),
                    version_id: marker_sort.clone(),
                    sort_key: marker_sort.clone(),
                    size: 0,
                    etag: String::new(),
                    content_type: String::new(),
                    user_metadata: HashMap::new(),
                    tags: Vec::new(),
                    created_at: now,
                    encrypted: false,
                    iv_hex: None,
                    retention: None,
                    legal_hold: false,
                    is_delete_marker: true,
                    blob_ref: None,
                };
                txn.put(
                    &keys::object_version(bucket_name, key, &marker_sort),
                    &marker,
                )?;
                txn.put(&current_key, &marker)?;

                write_tombstone(txn, "object", &format!("{bucket_name}/{key}"), Some(bucket.tenant_id))?;
                if origin == WriteOrigin::Client {
                    enqueue_delete_replication(txn, bucket_name, key, max_attempts)?;
                }
                Ok((
                    DeleteOutcome {
                        delete_marker: true,
                        version_id: Some(marker_sort),
                    },
                    Vec::new(),
                ))
            } else {
                // Unversioned: purge the current version outright.
                let Some(cur) = current else {
                    // Idempotent.
                    return Ok((
                        DeleteOutcome {
                            delete_marker: false,
                            version_id: None,
                        },
                        Vec::new(),
                    ));
                };
                ensure_unprotected(&cur, now, bypass_governance)?;

                txn.delete(&keys::object_version(bucket_name, key, &cur.sort_key))?;
                txn.delete(&current_key)?;
                QuotaTracker::release(txn, bucket.tenant_id, QuotaDelta::bytes(cur.size as i64))?;

                write_tombstone(txn, "object", &format!("{bucket_name}/{key}"), Some(bucket.tenant_id))?;
                if origin == WriteOrigin::Client {
                    enqueue_delete_replication(txn, bucket_name, key, max_attempts)?;
                }
                Ok((
                    DeleteOutcome {
                        delete_marker: false,
                        version_id: None,
                    },
                    cur.blob_ref.into_iter().collect(),
                ))
            }
        })?;

        for blob_ref in doomed_blobs {
            if let Err(e) = self.blobs().delete(&blob_ref).await {
                warn!(blob_ref = %blob_ref, error = %e, "failed to remove deleted blob");
            }
        }

        debug!(bucket = %bucket_name, key, ?version_id, "delete_object committed");
        Ok(outcome)
    }

    /// Server-side copy. Metadata is copied from the source unless
    /// `replace_metadata` carries a replacement set.
    pub async fn copy_object(
        &self,
        src_bucket: &str,
        src_key: &str,
        src_version: Option<&str>,
        mut dst: PutObjectInput,
        replace_metadata: bool,
    ) -> Result<PutObjectOutput> {
        let source = self
            .get_object(GetObjectInput {
                bucket: src_bucket.to_owned(),
                key: src_key.to_owned(),
                version_id: src_version.map(ToOwned::to_owned),
                ..GetObjectInput::default()
            })
            .await?;

        let found = match source {
            GetOutcome::Found(found) => found,
            GetOutcome::DeleteMarker { .. } => {
                return Err(Error::NoSuchKey {
                    key: src_key.to_owned(),
                });
            }
        };

        if !replace_metadata {
            dst.user_metadata = found.record.user_metadata.clone();
            dst.content_type = Some(found.record.content_type.clone());
            dst.tags = found.record.tags.clone();
        }

        let mut reader = found.reader;
        let mut body = Vec::with_capacity(usize::try_from(found.content_length).unwrap_or(0));
        tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut body)
            .await
            .map_err(|e| Error::Internal(anyhow::anyhow!("read copy source: {e}")))?;

        self.put_object(WriteOrigin::Client, dst, Bytes::from(body))
            .await
    }

    /// Replace the tag set of the current version (or a specific one).
    pub fn put_object_tagging(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
        tags: Vec<(String, String)>,
    ) -> Result<()> {
        self.mutate_record(bucket, key, version_id, |record| {
            record.tags = tags.clone();
            Ok(())
        })
    }

    /// Read the tag set.
    pub fn get_object_tagging(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
    ) -> Result<Vec<(String, String)>> {
        let input = GetObjectInput {
            bucket: bucket.to_owned(),
            key: key.to_owned(),
            version_id: version_id.map(ToOwned::to_owned),
            ..GetObjectInput::default()
        };
        match self.head_object(&input)? {
            GetOutcome::Found(found) => Ok(found.record.tags),
            GetOutcome::DeleteMarker { .. } => Err(Error::NoSuchKey {
                key: key.to_owned(),
            }),
        }
    }

    /// Clear the tag set.
    pub fn delete_object_tagging(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
    ) -> Result<()> {
        self.put_object_tagging(bucket, key, version_id, Vec::new())
    }

    /// Load a version by wire version id (outside a transaction).
    pub(crate) fn find_version(
        &self,
        bucket: &str,
        key: &str,
        version_id: &str,
    ) -> Result<ObjectRecord> {
        if version_id == NULL_VERSION_ID {
            let rows = self
                .meta()
                .scan_prefix(&keys::object_versions_prefix(bucket, key), None, usize::MAX)?;
            for (row_key, bytes) in &rows {
                let record: ObjectRecord = serde_json::from_slice(bytes).map_err(|e| {
                    Error::Internal(anyhow::anyhow!("corrupt record at {row_key}: {e}"))
                })?;
                if record.version_id == NULL_VERSION_ID {
                    return Ok(record);
                }
            }
            Err(Error::NoSuchVersion {
                key: key.to_owned(),
                version_id: version_id.to_owned(),
            })
        } else {
            self.meta()
                .get::<ObjectRecord>(&keys::object_version(bucket, key, version_id))?
                .ok_or_else(|| Error::NoSuchVersion {
                    key: key.to_owned(),
                    version_id: version_id.to_owned(),
                })
        }
    }

    /// Apply an in-place mutation to a version record (both the version row
    /// and, when it is current, the pointer row).
    pub(crate) fn mutate_record(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
        mutate: impl Fn(&mut ObjectRecord) -> Result<()>,
    ) -> Result<()> {
        self.require_bucket(bucket)?;
        self.meta().update(|txn| {
            let current_key = keys::object_current(bucket, key);
            let current: Option<ObjectRecord> = txn.get(&current_key)?;

            let mut record = match version_id {
                Some(version) => find_version_in_txn(txn, bucket, key, version)?.ok_or_else(|| {
                    Error::NoSuchVersion {
                        key: key.to_owned(),
                        version_id: version.to_owned(),
                    }
                })?,
                None => current.clone().ok_or_else(|| Error::NoSuchKey {
                    key: key.to_owned(),
                })?,
            };
            if record.is_delete_marker {
                return Err(Error::NoSuchKey {
                    key: key.to_owned(),
                });
            }

            mutate(&mut record)?;

            txn.put(&keys::object_version(bucket, key, &record.sort_key), &record)?;
            if current.is_some_and(|c| c.sort_key == record.sort_key) {
                txn.put(&current_key, &record)?;
            }
            Ok(())
        })
    }
}

// ---------------------------------------------------------------------------
// Shared helpers (also used by multipart and bucket ops)
// ---------------------------------------------------------------------------

/// The bucket default retention materialized for a new version.
pub(crate) fn default_retention(bucket: &Bucket, now: i64) -> Option<Retention> {
    if !bucket.object_lock_enabled {
        return None;
    }
    bucket.default_retention.map(|d| Retention {
        mode: d.mode,
        until: now + i64::try_from(d.period_secs).unwrap_or(i64::MAX),
    })
}

/// Enforce Object Lock before a destructive operation on `record`.
pub(crate) fn ensure_unprotected(
    record: &ObjectRecord,
    now: i64,
    bypass_governance: bool,
) -> Result<()> {
    if record.legal_hold {
        return Err(Error::ObjectLocked);
    }
    match record.retention {
        Some(retention) if retention.is_active(now) => match retention.mode {
            RetentionMode::Compliance => Err(Error::ObjectLocked),
            RetentionMode::Governance if !bypass_governance => Err(Error::ObjectLocked),
            RetentionMode::Governance => Ok(()),
        },
        _ => Ok(()),
    }
}

/// Write-side conditional header checks against the current version.
/// A delete marker counts as "does not exist".
pub(crate) fn check_write_conditions(
    current: Option<&ObjectRecord>,
    if_match: Option<&str>,
    if_none_match: Option<&str>,
) -> Result<()> {
    let existing = current.filter(|r| !r.is_delete_marker);

    if let Some(condition) = if_match {
        let holds = existing.is_some_and(|r| {
            condition == "*" || etag::unquote(condition) == etag::unquote(&r.etag)
        });
        if !holds {
            return Err(Error::PreconditionFailed);
        }
    }
    if let Some(condition) = if_none_match {
        let collides = existing.is_some_and(|r| {
            condition == "*" || etag::unquote(condition) == etag::unquote(&r.etag)
        });
        if collides {
            return Err(Error::PreconditionFailed);
        }
    }
    Ok(())
}

/// Fan a committed mutation out to every matching replication rule.
pub(crate) fn enqueue_replication(
    txn: &mut MetaTxn<'_>,
    bucket: &str,
    key: &str,
    op: ReplicationOp,
    max_attempts: u32,
) -> Result<()> {
    let rules: Vec<ReplicationRule> = txn.scan_values(&keys::replication_rule_prefix())?;
    let now = ids::now_secs();
    let now_micros = ids::now_micros();

    for rule in rules.iter().filter(|r| r.matches(bucket, key)) {
        if op == ReplicationOp::Delete && !rule.replicate_deletes {
            continue;
        }
        let entry = ReplicationQueueEntry {
            id: Uuid::new_v4(),
            rule_id: rule.id,
            bucket: bucket.to_owned(),
            key: key.to_owned(),
            op,
            status: maxiofs_core::types::QueueStatus::Pending,
            attempts: 0,
            max_attempts,
            next_attempt_at: now,
            last_error: None,
            enqueued_at: now,
        };
        txn.put(
            &keys::replication_queue(rule.priority, now_micros, entry.id),
            &entry,
        )?;
    }
    Ok(())
}

pub(crate) fn enqueue_delete_replication(
    txn: &mut MetaTxn<'_>,
    bucket: &str,
    key: &str,
    max_attempts: u32,
) -> Result<()> {
    enqueue_replication(txn, bucket, key, ReplicationOp::Delete, max_attempts)
}

/// Append a deletion-log row.
pub(crate) fn write_tombstone(
    txn: &mut MetaTxn<'_>,
    kind: &str,
    entity_id: &str,
    tenant_id: Option<Uuid>,
) -> Result<()> {
    let deleted_at = ids::now_secs();
    let tombstone = Tombstone {
        entity_kind: kind.to_owned(),
        entity_id: entity_id.to_owned(),
        deleted_at,
        tenant_id,
    };
    txn.put(&keys::tombstone(kind, deleted_at, entity_id), &tombstone)
}

/// Transaction-scoped version lookup by wire version id.
pub(crate) fn find_version_in_txn(
    txn: &MetaTxn<'_>,
    bucket: &str,
    key: &str,
    version_id: &str,
) -> Result<Option<ObjectRecord>> {
    if version_id == NULL_VERSION_ID {
        let rows = txn.scan_prefix(&keys::object_versions_prefix(bucket, key), None, usize::MAX)?;
        for (row_key, bytes) in &rows {
            let record: ObjectRecord = serde_json::from_slice(bytes).map_err(|e| {
                Error::Internal(anyhow::anyhow!("corrupt record at {row_key}: {e}"))
            })?;
            if record.version_id == NULL_VERSION_ID {
                return Ok(Some(record));
            }
        }
        Ok(None)
    } else {
        txn.get(&keys::object_version(bucket, key, version_id))
    }
}
