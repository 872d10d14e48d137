//! Multipart uploads.
//!
//! An upload is a record at `mpu:{upload_id}` plus one row per part at
//! `mpupart:{upload_id}:{n:05}`. Part payloads are separate blobs;
//! completion streams them into one final object blob (re-encrypting under
//! a fresh IV when the bucket encrypts), commits the assembled version, and
//! removes the upload state in the same transaction. Parts never count
//! toward tenant quota; the assembled object does.

use std::collections::HashMap;

use bytes::Bytes;
use tokio::io::AsyncRead;
use tracing::{debug, warn};
use uuid::Uuid;

use maxiofs_core::ids::{self, NULL_VERSION_ID};
use maxiofs_core::types::{
    Bucket, MultipartUpload, ObjectRecord, ReplicationOp, UploadPart, VersioningState,
};
use maxiofs_core::{Error, Result};
use maxiofs_crypto::CtrStream;
use maxiofs_meta::keys;

use crate::object::{check_write_conditions, default_retention, enqueue_replication, ensure_unprotected};
use crate::quota::{QuotaDelta, QuotaTracker};
use crate::{ObjectEngine, WriteOrigin, etag, refs, validation};

/// Minimum size of every part except the last, per AWS.
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Maximum size of a single part, per AWS.
pub const MAX_PART_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// Highest allowed part number.
pub const MAX_PART_NUMBER: u32 = 10_000;

/// Inputs to `create_multipart`.
#[derive(Debug, Clone)]
pub struct CreateMultipartInput {
    /// Destination bucket.
    pub bucket: String,
    /// Destination key.
    pub key: String,
    /// Content type for the final object.
    pub content_type: Option<String>,
    /// User metadata for the final object.
    pub user_metadata: HashMap<String, String>,
}

/// One entry of a completion request.
#[derive(Debug, Clone)]
pub struct CompletedPart {
    /// Part number as uploaded.
    pub part_number: u32,
    /// ETag the client saw for the part (quoted or not).
    pub etag: String,
}

impl ObjectEngine {
    /// Initiate a multipart upload.
    pub fn create_multipart(&self, input: CreateMultipartInput) -> Result<MultipartUpload> {
        validation::validate_object_key(&input.key)?;
        validation::validate_user_metadata(&input.user_metadata)?;
        let bucket = self.require_bucket(&input.bucket)?;

        let upload = MultipartUpload {
            upload_id: Uuid::new_v4().simple().to_string(),
            bucket: input.bucket,
            key: input.key,
            tenant_id: bucket.tenant_id,
            content_type: input
                .content_type
                .unwrap_or_else(|| "application/octet-stream".to_owned()),
            user_metadata: input.user_metadata,
            encrypted: self.encryption_for(&bucket).is_some(),
            initiated_at: ids::now_secs(),
        };
        self.meta().put(&keys::multipart(&upload.upload_id), &upload)?;

        debug!(
            bucket = %upload.bucket,
            key = %upload.key,
            upload_id = %upload.upload_id,
            "multipart upload initiated"
        );
        Ok(upload)
    }

    /// Upload (or replace) one part. Returns the part's quoted ETag.
    pub async fn upload_part(
        &self,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> Result<String> {
        if part_number == 0 || part_number > MAX_PART_NUMBER {
            return Err(Error::invalid_argument(format!(
                "part number must be 1-{MAX_PART_NUMBER}"
            )));
        }
        if body.len() as u64 > MAX_PART_SIZE {
            return Err(Error::EntityTooLarge);
        }

        let upload = self.require_upload(upload_id)?;
        let md5 = etag::md5_hex(&body);
        let size = body.len() as u64;

        let blob_ref = refs::part_blob(upload.tenant_id, &upload.bucket, upload_id, part_number);
        let iv = upload.encrypted.then(maxiofs_crypto::random_iv);
        match iv {
            Some(iv) => {
                let key = self.decryption_key()?;
                let reader = CtrStream::new(key, &iv, body.as_ref());
                self.blobs().write(&blob_ref, reader).await?;
            }
            None => {
                self.blobs().write(&blob_ref, body.as_ref()).await?;
            }
        }

        let part = UploadPart {
            part_number,
            etag: md5.clone(),
            size,
            blob_ref,
            iv_hex: iv.map(hex::encode),
            uploaded_at: ids::now_secs(),
        };
        self.meta().update(|txn| {
            // The upload may have completed or been aborted while the part
            // body streamed in.
            if !txn.exists(&keys::multipart(upload_id))? {
                return Err(Error::NoSuchUpload {
                    upload_id: upload_id.to_owned(),
                });
            }
            txn.put(&keys::multipart_part(upload_id, part_number), &part)
        })?;

        debug!(upload_id, part_number, size, "part stored");
        Ok(format!("\"{md5}\""))
    }

    /// Complete the upload: validate the part list, assemble the final
    /// object, and commit it as a new version.
    pub async fn complete_multipart(
        &self,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<crate::object::PutObjectOutput> {
        if parts.is_empty() {
            return Err(Error::InvalidPart);
        }
        if !parts.windows(2).all(|w| w[0].part_number < w[1].part_number) {
            return Err(Error::InvalidPartOrder);
        }

        let upload = self.require_upload(upload_id)?;
        let bucket = self.require_bucket(&upload.bucket)?;
        let stored = self.stored_parts(upload_id)?;

        // Resolve every requested part against what was uploaded.
        let mut selected = Vec::with_capacity(parts.len());
        for requested in parts {
            let found = stored
                .iter()
                .find(|p| p.part_number == requested.part_number)
                .ok_or(Error::InvalidPart)?;
            if etag::unquote(&requested.etag) != found.etag {
                return Err(Error::InvalidPart);
            }
            selected.push(found.clone());
        }

        // Every part except the last must meet the size floor.
        if selected
            .iter()
            .rev()
            .skip(1)
            .any(|p| p.size < MIN_PART_SIZE)
        {
            return Err(Error::EntityTooSmall);
        }

        let total_size: u64 = selected.iter().map(|p| p.size).sum();
        let part_md5s: Vec<String> = selected.iter().map(|p| p.etag.clone()).collect();
        let composite_etag = etag::multipart_etag(&part_md5s);
        let now = ids::now_secs();

        let sort_key = ids::new_version_id();
        let version_id = if bucket.versioning == VersioningState::Enabled {
            sort_key.clone()
        } else {
            NULL_VERSION_ID.to_owned()
        };
        let blob_ref = refs::object_blob(bucket.tenant_id, &upload.bucket, &upload.key, &sort_key);

        // Assemble: chain the decrypted part streams, re-encrypting the
        // whole object under a fresh IV when the bucket encrypts.
        let plaintext = self.chained_part_reader(&selected).await?;
        let encryption = self.encryption_for(&bucket);
        let iv = encryption.map(|_| maxiofs_crypto::random_iv());
        let written = match (encryption, iv) {
            (Some(key), Some(iv)) => {
                self.blobs()
                    .write(&blob_ref, CtrStream::new(key, &iv, plaintext))
                    .await?
            }
            _ => self.blobs().write(&blob_ref, plaintext).await?,
        };
        if written != total_size {
            self.blobs().delete(&blob_ref).await.ok();
            return Err(Error::Internal(anyhow::anyhow!(
                "assembled {written} bytes, expected {total_size}"
            )));
        }

        let record = ObjectRecord {
            bucket: upload.bucket.clone(),
            key: upload.key.clone(),
            version_id: version_id.clone(),
            sort_key: sort_key.clone(),
            size: total_size,
            etag: composite_etag.clone(),
            content_type: upload.content_type.clone(),
            user_metadata: upload.user_metadata.clone(),
            tags: Vec::new(),
            created_at: now,
            encrypted: encryption.is_some(),
            iv_hex: iv.map(hex::encode),
            retention: default_retention(&bucket, now),
            legal_hold: false,
            is_delete_marker: false,
            blob_ref: Some(blob_ref.clone()),
        };

        let max_attempts = self.replication_max_attempts();
        let versioned = bucket.versioning == VersioningState::Enabled;
        let commit = self.meta().update(|txn| {
            let bucket: Bucket = txn.get(&keys::bucket(&upload.bucket))?.ok_or_else(|| {
                Error::NoSuchBucket {
                    bucket: upload.bucket.clone(),
                }
            })?;
            // A concurrent complete or abort wins; this request loses.
            if !txn.exists(&keys::multipart(upload_id))? {
                return Err(Error::NoSuchUpload {
                    upload_id: upload_id.to_owned(),
                });
            }

            let current: Option<ObjectRecord> =
                txn.get(&keys::object_current(&upload.bucket, &upload.key))?;
            check_write_conditions(current.as_ref(), None, None)?;

            let mut replaced: Option<ObjectRecord> = None;
            if !versioned {
                if let Some(old) = current
                    .filter(|r| !r.is_delete_marker && r.version_id == NULL_VERSION_ID)
                {
                    ensure_unprotected(&old, now, false)?;
                    replaced = Some(old);
                }
            }
            let byte_delta = total_size as i64 - replaced.as_ref().map_or(0, |r| r.size as i64);
            QuotaTracker::check_and_reserve(txn, bucket.tenant_id, QuotaDelta::bytes(byte_delta))?;

            if let Some(old) = &replaced {
                txn.delete(&keys::object_version(&upload.bucket, &upload.key, &old.sort_key))?;
            }
            txn.put(
                &keys::object_version(&upload.bucket, &upload.key, &sort_key),
                &record,
            )?;
            txn.put(&keys::object_current(&upload.bucket, &upload.key), &record)?;

            // Retire the upload state.
            txn.delete(&keys::multipart(upload_id))?;
            let part_rows =
                txn.scan_prefix(&keys::multipart_parts_prefix(upload_id), None, usize::MAX)?;
            for (row_key, _) in &part_rows {
                txn.delete(row_key)?;
            }

            enqueue_replication(
                txn,
                &upload.bucket,
                &upload.key,
                ReplicationOp::Put,
                max_attempts,
            )?;
            Ok(replaced.and_then(|r| r.blob_ref))
        });

        match commit {
            Ok(replaced_blob) => {
                let dir = refs::upload_dir(upload.tenant_id, &upload.bucket, upload_id);
                if let Err(e) = self.blobs().delete_prefix(&dir).await {
                    warn!(upload_id, error = %e, "failed to remove part blobs");
                }
                if let Some(old_ref) = replaced_blob {
                    if let Err(e) = self.blobs().delete(&old_ref).await {
                        warn!(blob_ref = %old_ref, error = %e, "failed to remove replaced blob");
                    }
                }
                debug!(
                    upload_id,
                    bucket = %upload.bucket,
                    key = %upload.key,
                    parts = parts.len(),
                    total_size,
                    "multipart upload completed"
                );
                Ok(crate::object::PutObjectOutput {
                    etag: composite_etag,
                    version_id: (version_id != NULL_VERSION_ID).then_some(version_id),
                    size: total_size,
                })
            }
            Err(err) => {
                self.blobs().delete(&blob_ref).await.ok();
                Err(err)
            }
        }
    }

    /// Abort an upload, removing all part state and payloads. Idempotent.
    pub async fn abort_multipart(&self, upload_id: &str) -> Result<()> {
        let Some(upload) = self.meta().get::<MultipartUpload>(&keys::multipart(upload_id))?
        else {
            return Ok(());
        };

        self.meta().update(|txn| {
            txn.delete(&keys::multipart(upload_id))?;
            let part_rows =
                txn.scan_prefix(&keys::multipart_parts_prefix(upload_id), None, usize::MAX)?;
            for (row_key, _) in &part_rows {
                txn.delete(row_key)?;
            }
            Ok(())
        })?;

        let dir = refs::upload_dir(upload.tenant_id, &upload.bucket, upload_id);
        self.blobs().delete_prefix(&dir).await?;
        debug!(upload_id, "multipart upload aborted");
        Ok(())
    }

    /// The upload record plus its parts in ascending part order.
    pub fn list_parts(&self, upload_id: &str) -> Result<(MultipartUpload, Vec<UploadPart>)> {
        let upload = self.require_upload(upload_id)?;
        let parts = self.stored_parts(upload_id)?;
        Ok((upload, parts))
    }

    /// All in-progress uploads in a bucket, oldest first.
    pub fn list_multipart_uploads(&self, bucket: &str) -> Result<Vec<MultipartUpload>> {
        self.require_bucket(bucket)?;
        let mut uploads: Vec<MultipartUpload> = self
            .meta()
            .scan_values::<MultipartUpload>(&keys::multipart_prefix())?
            .into_iter()
            .filter(|u| u.bucket == bucket)
            .collect();
        uploads.sort_by_key(|u| u.initiated_at);
        Ok(uploads)
    }

    /// Abort uploads initiated more than `max_age_secs` ago. Returns how
    /// many were collected.
    pub async fn gc_stale_uploads(&self, max_age_secs: u64) -> Result<u64> {
        let cutoff = ids::now_secs() - i64::try_from(max_age_secs).unwrap_or(i64::MAX);
        let stale: Vec<MultipartUpload> = self
            .meta()
            .scan_values::<MultipartUpload>(&keys::multipart_prefix())?
            .into_iter()
            .filter(|u| u.initiated_at < cutoff)
            .collect();

        let mut collected = 0;
        for upload in stale {
            self.abort_multipart(&upload.upload_id).await?;
            collected += 1;
        }
        Ok(collected)
    }

    fn require_upload(&self, upload_id: &str) -> Result<MultipartUpload> {
        self.meta()
            .get::<MultipartUpload>(&keys::multipart(upload_id))?
            .ok_or_else(|| Error::NoSuchUpload {
                upload_id: upload_id.to_owned(),
            })
    }

    fn stored_parts(&self, upload_id: &str) -> Result<Vec<UploadPart>> {
        self.meta()
            .scan_values::<UploadPart>(&keys::multipart_parts_prefix(upload_id))
    }

    /// One reader yielding the decrypted payloads of `parts` back to back.
    async fn chained_part_reader(
        &self,
        parts: &[UploadPart],
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
        let mut chained: Box<dyn AsyncRead + Send + Unpin> = Box::new(tokio::io::empty());
        for part in parts {
            let raw = self.blobs().open_reader(&part.blob_ref, None).await?;
            let reader: Box<dyn AsyncRead + Send + Unpin> = match &part.iv_hex {
                Some(iv_hex) => {
                    let iv = maxiofs_crypto::parse_iv(iv_hex)?;
                    Box::new(CtrStream::new(self.decryption_key()?, &iv, raw))
                }
                None => Box::new(raw),
            };
            chained = Box::new(tokio::io::AsyncReadExt::chain(chained, reader));
        }
        Ok(chained)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::CreateBucketInput;
    use crate::object::{GetObjectInput, GetOutcome};
    use crate::testutil;
    use md5::Digest;

    async fn make_bucket(env: &testutil::TestEnv, name: &str) {
        env.engine
            .create_bucket(CreateBucketInput {
                name: name.to_owned(),
                tenant_id: env.tenant_id,
                owner_user_id: env.user_id,
                versioning: VersioningState::Off,
                object_lock_enabled: false,
                default_retention: None,
                encryption_enabled: false,
            })
            .unwrap_or_else(|e| panic!("create_bucket failed: {e}"));
    }

    fn create_input(bucket: &str, key: &str) -> CreateMultipartInput {
        CreateMultipartInput {
            bucket: bucket.to_owned(),
            key: key.to_owned(),
            content_type: None,
            user_metadata: HashMap::new(),
        }
    }

    async fn read_current(env: &testutil::TestEnv, bucket: &str, key: &str) -> Vec<u8> {
        let got = env
            .engine
            .get_object(GetObjectInput {
                bucket: bucket.to_owned(),
                key: key.to_owned(),
                ..GetObjectInput::default()
            })
            .await
            .unwrap_or_else(|e| panic!("get failed: {e}"));
        let GetOutcome::Found(mut found) = got else {
            panic!("expected object");
        };
        let mut out = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut found.reader, &mut out)
            .await
            .unwrap();
        out
    }

    #[tokio::test]
    async fn test_should_complete_two_part_upload_with_composite_etag() {
        let env = testutil::env();
        make_bucket(&env, "mp").await;

        let part1 = vec![0x41u8; MIN_PART_SIZE as usize];
        let part2 = vec![0x42u8; 1024 * 1024];

        let upload = env.engine.create_multipart(create_input("mp", "assembled")).unwrap();
        let etag1 = env
            .engine
            .upload_part(&upload.upload_id, 1, Bytes::from(part1.clone()))
            .await
            .unwrap();
        let etag2 = env
            .engine
            .upload_part(&upload.upload_id, 2, Bytes::from(part2.clone()))
            .await
            .unwrap();

        let output = env
            .engine
            .complete_multipart(
                &upload.upload_id,
                &[
                    CompletedPart {
                        part_number: 1,
                        etag: etag1,
                    },
                    CompletedPart {
                        part_number: 2,
                        etag: etag2,
                    },
                ],
            )
            .await
            .unwrap_or_else(|e| panic!("complete failed: {e}"));

        // ETag = md5(md5(part1) || md5(part2)) + "-2".
        let mut hasher = md5::Md5::new();
        hasher.update(md5::Md5::digest(&part1));
        hasher.update(md5::Md5::digest(&part2));
        let expected = format!("\"{}-2\"", hex::encode(hasher.finalize()));
        assert_eq!(output.etag, expected);
        assert_eq!(output.size, (part1.len() + part2.len()) as u64);

        // Payload is the concatenation.
        let body = read_current(&env, "mp", "assembled").await;
        assert_eq!(body.len(), part1.len() + part2.len());
        assert_eq!(&body[..part1.len()], part1.as_slice());
        assert_eq!(&body[part1.len()..], part2.as_slice());

        // Upload state is gone.
        assert!(matches!(
            env.engine.list_parts(&upload.upload_id),
            Err(Error::NoSuchUpload { .. })
        ));
    }

    #[tokio::test]
    async fn test_should_reject_small_non_last_part() {
        let env = testutil::env();
        make_bucket(&env, "mp").await;

        let upload = env.engine.create_multipart(create_input("mp", "k")).unwrap();
        let e1 = env
            .engine
            .upload_part(&upload.upload_id, 1, Bytes::from(vec![0u8; 1024]))
            .await
            .unwrap();
        let e2 = env
            .engine
            .upload_part(&upload.upload_id, 2, Bytes::from(vec![0u8; 1024]))
            .await
            .unwrap();

        let result = env
            .engine
            .complete_multipart(
                &upload.upload_id,
                &[
                    CompletedPart {
                        part_number: 1,
                        etag: e1,
                    },
                    CompletedPart {
                        part_number: 2,
                        etag: e2,
                    },
                ],
            )
            .await;
        assert!(matches!(result, Err(Error::EntityTooSmall)));
    }

    #[tokio::test]
    async fn test_should_reject_out_of_order_and_unknown_parts() {
        let env = testutil::env();
        make_bucket(&env, "mp").await;

        let upload = env.engine.create_multipart(create_input("mp", "k")).unwrap();
        let e1 = env
            .engine
            .upload_part(&upload.upload_id, 1, Bytes::from(vec![0u8; 10]))
            .await
            .unwrap();

        // Descending order.
        let result = env
            .engine
            .complete_multipart(
                &upload.upload_id,
                &[
                    CompletedPart {
                        part_number: 2,
                        etag: e1.clone(),
                    },
                    CompletedPart {
                        part_number: 1,
                        etag: e1.clone(),
                    },
                ],
            )
            .await;
        assert!(matches!(result, Err(Error::InvalidPartOrder)));

        // Unknown part number.
        let result = env
            .engine
            .complete_multipart(
                &upload.upload_id,
                &[CompletedPart {
                    part_number: 9,
                    etag: e1.clone(),
                }],
            )
            .await;
        assert!(matches!(result, Err(Error::InvalidPart)));

        // Wrong ETag.
        let result = env
            .engine
            .complete_multipart(
                &upload.upload_id,
                &[CompletedPart {
                    part_number: 1,
                    etag: "\"badbad\"".to_owned(),
                }],
            )
            .await;
        assert!(matches!(result, Err(Error::InvalidPart)));
    }

    #[tokio::test]
    async fn test_should_replace_part_on_reupload() {
        let env = testutil::env();
        make_bucket(&env, "mp").await;

        let upload = env.engine.create_multipart(create_input("mp", "k")).unwrap();
        env.engine
            .upload_part(&upload.upload_id, 1, Bytes::from_static(b"first"))
            .await
            .unwrap();
        let replacement = env
            .engine
            .upload_part(&upload.upload_id, 1, Bytes::from_static(b"second"))
            .await
            .unwrap();

        let (_, parts) = env.engine.list_parts(&upload.upload_id).unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].size, 6);
        assert_eq!(format!("\"{}\"", parts[0].etag), replacement);
    }

    #[tokio::test]
    async fn test_should_abort_upload_and_drop_parts() {
        let env = testutil::env();
        make_bucket(&env, "mp").await;

        let upload = env.engine.create_multipart(create_input("mp", "k")).unwrap();
        env.engine
            .upload_part(&upload.upload_id, 1, Bytes::from_static(b"data"))
            .await
            .unwrap();

        env.engine
            .abort_multipart(&upload.upload_id)
            .await
            .unwrap_or_else(|e| panic!("abort failed: {e}"));

        assert!(matches!(
            env.engine
                .upload_part(&upload.upload_id, 2, Bytes::from_static(b"late"))
                .await,
            Err(Error::NoSuchUpload { .. })
        ));
        // Abort is idempotent.
        env.engine.abort_multipart(&upload.upload_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_should_list_uploads_per_bucket() {
        let env = testutil::env();
        make_bucket(&env, "a").await;
        make_bucket(&env, "b").await;

        env.engine.create_multipart(create_input("a", "k1")).unwrap();
        env.engine.create_multipart(create_input("a", "k2")).unwrap();
        env.engine.create_multipart(create_input("b", "k3")).unwrap();

        let uploads = env.engine.list_multipart_uploads("a").unwrap();
        assert_eq!(uploads.len(), 2);
        assert!(uploads.iter().all(|u| u.bucket == "a"));
    }

    #[tokio::test]
    async fn test_should_reject_invalid_part_numbers() {
        let env = testutil::env();
        make_bucket(&env, "mp").await;
        let upload = env.engine.create_multipart(create_input("mp", "k")).unwrap();

        for bad in [0, MAX_PART_NUMBER + 1] {
            let result = env
                .engine
                .upload_part(&upload.upload_id, bad, Bytes::from_static(b"x"))
                .await;
            assert!(
                matches!(result, Err(Error::InvalidArgument { .. })),
                "part {bad} must be rejected"
            );
        }
    }

    #[tokio::test]
    async fn test_should_gc_stale_uploads_only() {
        let env = testutil::env();
        make_bucket(&env, "mp").await;

        let stale = env.engine.create_multipart(create_input("mp", "old")).unwrap();
        // Backdate the record.
        let mut record = stale.clone();
        record.initiated_at -= 10_000;
        env.engine
            .meta()
            .put(&keys::multipart(&stale.upload_id), &record)
            .unwrap();

        let fresh = env.engine.create_multipart(create_input("mp", "new")).unwrap();

        let collected = env.engine.gc_stale_uploads(3600).await.unwrap();
        assert_eq!(collected, 1);
        assert!(env.engine.list_parts(&stale.upload_id).is_err());
        assert!(env.engine.list_parts(&fresh.upload_id).is_ok());
    }
}
