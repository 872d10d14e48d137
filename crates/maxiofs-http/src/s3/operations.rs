//! The S3 operations MaxIOFS serves.

use std::fmt;

/// One S3 action, identified from method, path shape, query selectors, and
/// headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum S3Operation {
    // Service level
    /// `GET /`
    ListBuckets,

    // Bucket level
    /// `PUT /{bucket}`
    CreateBucket,
    /// `DELETE /{bucket}`
    DeleteBucket,
    /// `HEAD /{bucket}`
    HeadBucket,
    /// `GET /{bucket}`
    ListObjects,
    /// `GET /{bucket}?list-type=2`
    ListObjectsV2,
    /// `GET /{bucket}?versions`
    ListObjectVersions,
    /// `GET /{bucket}?location`
    GetBucketLocation,
    /// `GET /{bucket}?versioning`
    GetBucketVersioning,
    /// `PUT /{bucket}?versioning`
    PutBucketVersioning,
    /// `GET /{bucket}?cors`
    GetBucketCors,
    /// `PUT /{bucket}?cors`
    PutBucketCors,
    /// `DELETE /{bucket}?cors`
    DeleteBucketCors,
    /// `GET /{bucket}?policy`
    GetBucketPolicy,
    /// `PUT /{bucket}?policy`
    PutBucketPolicy,
    /// `DELETE /{bucket}?policy`
    DeleteBucketPolicy,
    /// `GET /{bucket}?notification`
    GetBucketNotification,
    /// `PUT /{bucket}?notification`
    PutBucketNotification,
    /// `GET /{bucket}?object-lock`
    GetObjectLockConfig,
    /// `PUT /{bucket}?object-lock`
    PutObjectLockConfig,
    /// `GET /{bucket}?uploads`
    ListMultipartUploads,
    /// `POST /{bucket}?delete`
    DeleteObjects,

    // Object level
    /// `PUT /{bucket}/{key}`
    PutObject,
    /// `PUT /{bucket}/{key}` with `x-amz-copy-source`
    CopyObject,
    /// `GET /{bucket}/{key}`
    GetObject,
    /// `HEAD /{bucket}/{key}`
    HeadObject,
    /// `DELETE /{bucket}/{key}`
    DeleteObject,
    /// `GET /{bucket}/{key}?tagging`
    GetObjectTagging,
    /// `PUT /{bucket}/{key}?tagging`
    PutObjectTagging,
    /// `DELETE /{bucket}/{key}?tagging`
    DeleteObjectTagging,
    /// `GET /{bucket}/{key}?retention`
    GetObjectRetention,
    /// `PUT /{bucket}/{key}?retention`
    PutObjectRetention,
    /// `GET /{bucket}/{key}?legal-hold`
    GetObjectLegalHold,
    /// `PUT /{bucket}/{key}?legal-hold`
    PutObjectLegalHold,
    /// `GET /{bucket}/{key}?acl` (limited: reports the owner)
    GetObjectAcl,

    // Multipart
    /// `POST /{bucket}/{key}?uploads`
    CreateMultipartUpload,
    /// `PUT /{bucket}/{key}?uploadId=&partNumber=`
    UploadPart,
    /// `POST /{bucket}/{key}?uploadId=`
    CompleteMultipartUpload,
    /// `DELETE /{bucket}/{key}?uploadId=`
    AbortMultipartUpload,
    /// `GET /{bucket}/{key}?uploadId=`
    ListParts,
}

impl S3Operation {
    /// Whether the operation mutates state (drives routing and maintenance
    /// mode).
    #[must_use]
    pub fn is_write(&self) -> bool {
        !matches!(
            self,
            Self::ListBuckets
                | Self::HeadBucket
                | Self::ListObjects
                | Self::ListObjectsV2
                | Self::ListObjectVersions
                | Self::GetBucketLocation
                | Self::GetBucketVersioning
                | Self::GetBucketCors
                | Self::GetBucketPolicy
                | Self::GetBucketNotification
                | Self::GetObjectLockConfig
                | Self::ListMultipartUploads
                | Self::GetObject
                | Self::HeadObject
                | Self::GetObjectTagging
                | Self::GetObjectRetention
                | Self::GetObjectLegalHold
                | Self::GetObjectAcl
                | Self::ListParts
        )
    }
}

impl fmt::Display for S3Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_classify_reads_and_writes() {
        assert!(!S3Operation::GetObject.is_write());
        assert!(!S3Operation::ListObjectsV2.is_write());
        assert!(!S3Operation::ListParts.is_write());
        assert!(S3Operation::PutObject.is_write());
        assert!(S3Operation::DeleteObjects.is_write());
        assert!(S3Operation::CompleteMultipartUpload.is_write());
        assert!(S3Operation::PutObjectRetention.is_write());
    }
}
