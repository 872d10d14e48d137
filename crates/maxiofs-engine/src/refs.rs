//! Blob-ref construction.
//!
//! Blob refs are relative filesystem paths under the blob root:
//!
//! ```text
//! {tenant_id}/{bucket}/{md5(key)}/{sort_key}      object versions
//! {tenant_id}/{bucket}/mpu/{upload_id}/{part:05}  multipart parts
//! ```
//!
//! Keys are hashed rather than embedded so arbitrary S3 key bytes can never
//! form filesystem-hostile path components; the sort key keeps versions of
//! one key side by side.

use uuid::Uuid;

use crate::etag::md5_hex;

/// Blob ref for one object version.
#[must_use]
pub fn object_blob(tenant_id: Uuid, bucket: &str, key: &str, sort_key: &str) -> String {
    format!("{tenant_id}/{bucket}/{}/{sort_key}", md5_hex(key.as_bytes()))
}

/// Blob ref for one multipart part.
#[must_use]
pub fn part_blob(tenant_id: Uuid, bucket: &str, upload_id: &str, part_number: u32) -> String {
    format!("{tenant_id}/{bucket}/mpu/{upload_id}/{part_number:05}")
}

/// Directory ref holding all parts of one upload, for abort cleanup.
#[must_use]
pub fn upload_dir(tenant_id: Uuid, bucket: &str, upload_id: &str) -> String {
    format!("{tenant_id}/{bucket}/mpu/{upload_id}")
}

/// Directory ref holding every blob of one bucket, for bucket teardown.
#[must_use]
pub fn bucket_dir(tenant_id: Uuid, bucket: &str) -> String {
    format!("{tenant_id}/{bucket}")
}
