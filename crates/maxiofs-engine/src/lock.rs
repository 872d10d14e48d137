//! Object Lock: per-version retention and legal holds.
//!
//! COMPLIANCE retention can only ever be extended. GOVERNANCE retention can
//! be shortened or removed by callers holding the bypass capability who
//! pass the explicit bypass header; everyone else can only extend it.
//! Legal holds are independent of retention and block deletion while set.

use maxiofs_core::ids;
use maxiofs_core::types::{Retention, RetentionMode};
use maxiofs_core::{Error, Result};

use crate::ObjectEngine;
use crate::object::{GetObjectInput, GetOutcome};

impl ObjectEngine {
    /// Set or replace the retention of a version.
    pub fn put_object_retention(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
        new_retention: Option<Retention>,
        bypass_governance: bool,
    ) -> Result<()> {
        let bucket_record = self.require_bucket(bucket)?;
        if !bucket_record.object_lock_enabled {
            return Err(Error::invalid_argument(
                "Object Lock is not enabled for this bucket",
            ));
        }

        let now = ids::now_secs();
        self.mutate_record(bucket, key, version_id, |record| {
            check_retention_transition(record.retention, new_retention, now, bypass_governance)?;
            record.retention = new_retention;
            Ok(())
        })
    }

    /// Read the retention of a version.
    pub fn get_object_retention(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
    ) -> Result<Option<Retention>> {
        self.lookup(bucket, key, version_id)
            .map(|record| record.retention)
    }

    /// Set or clear the legal hold of a version.
    pub fn put_object_legal_hold(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
        hold: bool,
    ) -> Result<()> {
        let bucket_record = self.require_bucket(bucket)?;
        if !bucket_record.object_lock_enabled {
            return Err(Error::invalid_argument(
                "Object Lock is not enabled for this bucket",
            ));
        }
        self.mutate_record(bucket, key, version_id, |record| {
            record.legal_hold = hold;
            Ok(())
        })
    }

    /// Read the legal hold of a version.
    pub fn get_object_legal_hold(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
    ) -> Result<bool> {
        self.lookup(bucket, key, version_id)
            .map(|record| record.legal_hold)
    }

    fn lookup(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
    ) -> Result<maxiofs_core::types::ObjectRecord> {
        let outcome = self.head_object(&GetObjectInput {
            bucket: bucket.to_owned(),
            key: key.to_owned(),
            version_id: version_id.map(ToOwned::to_owned),
            ..GetObjectInput::default()
        })?;
        match outcome {
            GetOutcome::Found(found) => Ok(found.record),
            GetOutcome::DeleteMarker { .. } => Err(Error::NoSuchKey {
                key: key.to_owned(),
            }),
        }
    }
}

/// Whether replacing `current` with `proposed` is permitted.
fn check_retention_transition(
    current: Option<Retention>,
    proposed: Option<Retention>,
    now: i64,
    bypass_governance: bool,
) -> Result<()> {
    let Some(active) = current.filter(|r| r.is_active(now)) else {
        // Expired or absent retention can be replaced freely.
        return Ok(());
    };

    match active.mode {
        RetentionMode::Compliance => {
            // Only a strict extension in the same mode is allowed; nothing
            // and nobody can weaken COMPLIANCE.
            match proposed {
                Some(p) if p.mode == RetentionMode::Compliance && p.until >= active.until => Ok(()),
                _ => Err(Error::ObjectLocked),
            }
        }
        RetentionMode::Governance => {
            if bypass_governance {
                return Ok(());
            }
            match proposed {
                Some(p) if p.mode == RetentionMode::Governance && p.until >= active.until => Ok(()),
                _ => Err(Error::ObjectLocked),
            }
        }
    }
}
