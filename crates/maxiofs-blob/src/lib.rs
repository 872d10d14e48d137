//! Filesystem blob storage.
//!
//! [`BlobStore`] writes opaque object payloads under a root directory.
//! Semantic naming lives in the metadata store; blobs are addressed by
//! caller-constructed relative refs (`{tenant}/{bucket}/...`).
//!
//! Writes go to a temporary file first, are fsynced, and then atomically
//! renamed into place: a reader can never observe a partial blob, and an
//! interrupted write leaves nothing at the final ref. Reads support byte
//! ranges by seeking. All I/O streams through a fixed 32 KiB buffer.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use bytes::{Bytes, BytesMut};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use maxiofs_core::{Error, Result};

/// I/O buffer size for streaming copies.
pub const IO_BUF_SIZE: usize = 32 * 1024;

/// Metadata for a stored blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobStat {
    /// Size in bytes.
    pub size: u64,
    /// Modification time, epoch seconds.
    pub mtime: i64,
}

/// A reader over a stored blob (optionally a sub-range).
pub type BlobReader = tokio::io::Take<fs::File>;

/// Filesystem-backed blob store rooted at a single directory.
#[derive(Debug)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    /// Create a store rooted at `root`, creating the directory tree.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if the root or temp directory cannot be
    /// created.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(root.join("tmp"))
            .map_err(|e| Error::Internal(anyhow::anyhow!("create blob root: {e}")))?;
        debug!(root = %root.display(), "opened blob store");
        Ok(Self { root })
    }

    /// Write a blob from `reader`, returning the number of bytes written.
    ///
    /// The data is streamed to a temp file in 32 KiB chunks, fsynced, and
    /// renamed to `blob_ref`. On any error the temp file is removed and the
    /// final path is untouched.
    pub async fn write(&self, blob_ref: &str, mut reader: impl AsyncRead + Unpin) -> Result<u64> {
        let final_path = self.resolve(blob_ref)?;
        let tmp_path = self.root.join("tmp").join(Uuid::new_v4().to_string());

        let written = match copy_to_file(&tmp_path, &mut reader).await {
            Ok(n) => n,
            Err(err) => {
                remove_quietly(&tmp_path).await;
                return Err(err);
            }
        };

        if let Some(parent) = final_path.parent() {
            if let Err(e) = fs::create_dir_all(parent).await {
                remove_quietly(&tmp_path).await;
                return Err(Error::Internal(anyhow::anyhow!("create blob dir: {e}")));
            }
        }
        if let Err(e) = fs::rename(&tmp_path, &final_path).await {
            remove_quietly(&tmp_path).await;
            return Err(Error::Internal(anyhow::anyhow!(
                "rename blob into place: {e}"
            )));
        }

        trace!(blob_ref, written, "stored blob");
        Ok(written)
    }

    /// Open a blob for reading, optionally restricted to
    /// `[offset, offset + length)`.
    ///
    /// # Errors
    ///
    /// - [`Error::NoSuchKey`] if the blob does not exist.
    /// - [`Error::InvalidRange`] if the range lies outside the blob.
    pub async fn open_reader(
        &self,
        blob_ref: &str,
        range: Option<(u64, u64)>,
    ) -> Result<BlobReader> {
        let path = self.resolve(blob_ref)?;
        let mut file = fs::File::open(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::NoSuchKey {
                    key: blob_ref.to_owned(),
                }
            } else {
                Error::Internal(anyhow::anyhow!("open blob {blob_ref}: {e}"))
            }
        })?;

        let size = file
            .metadata()
            .await
            .map_err(|e| Error::Internal(anyhow::anyhow!("stat blob {blob_ref}: {e}")))?
            .len();

        match range {
            Some((offset, length)) => {
                if offset >= size || offset.checked_add(length).is_none_or(|end| end > size) {
                    return Err(Error::InvalidRange);
                }
                file.seek(SeekFrom::Start(offset))
                    .await
                    .map_err(|e| Error::Internal(anyhow::anyhow!("seek blob: {e}")))?;
                Ok(file.take(length))
            }
            None => Ok(file.take(size)),
        }
    }

    /// Read a whole blob (or a sub-range) into memory. Intended for small
    /// payloads and tests; large transfers should use [`Self::open_reader`].
    pub async fn read_all(&self, blob_ref: &str, range: Option<(u64, u64)>) -> Result<Bytes> {
        let mut reader = self.open_reader(blob_ref, range).await?;
        let mut buf = BytesMut::new();
        loop {
            let n = reader
                .read_buf(&mut buf)
                .await
                .map_err(|e| Error::Internal(anyhow::anyhow!("read blob {blob_ref}: {e}")))?;
            if n == 0 {
                break;
            }
        }
        Ok(buf.freeze())
    }

    /// Delete a blob. Idempotent: a missing blob is not an error.
    pub async fn delete(&self, blob_ref: &str) -> Result<()> {
        let path = self.resolve(blob_ref)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                trace!(blob_ref, "deleted blob");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Internal(anyhow::anyhow!(
                "delete blob {blob_ref}: {e}"
            ))),
        }
    }

    /// Delete every blob under a directory ref (multipart abort, bucket
    /// teardown). Idempotent.
    pub async fn delete_prefix(&self, dir_ref: &str) -> Result<()> {
        let path = self.resolve(dir_ref)?;
        match fs::remove_dir_all(&path).await {
            Ok(()) => {
                debug!(dir_ref, "deleted blob directory");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Internal(anyhow::anyhow!(
                "delete blob dir {dir_ref}: {e}"
            ))),
        }
    }

    /// Size and mtime of a stored blob.
    pub async fn stat(&self, blob_ref: &str) -> Result<BlobStat> {
        let path = self.resolve(blob_ref)?;
        let meta = fs::metadata(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::NoSuchKey {
                    key: blob_ref.to_owned(),
                }
            } else {
                Error::Internal(anyhow::anyhow!("stat blob {blob_ref}: {e}"))
            }
        })?;
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX));
        Ok(BlobStat {
            size: meta.len(),
            mtime,
        })
    }

    /// Resolve a ref to an absolute path, rejecting traversal components.
    fn resolve(&self, blob_ref: &str) -> Result<PathBuf> {
        if blob_ref.is_empty() {
            return Err(Error::invalid_argument("empty blob ref"));
        }
        for component in blob_ref.split('/') {
            if component.is_empty() || component == "." || component == ".." {
                return Err(Error::invalid_argument(format!(
                    "invalid blob ref: {blob_ref}"
                )));
            }
        }
        Ok(self.root.join(blob_ref))
    }
}

/// Stream `reader` into a new file at `path` and fsync it.
async fn copy_to_file(path: &Path, reader: &mut (impl AsyncRead + Unpin)) -> Result<u64> {
    let mut file = fs::File::create(path)
        .await
        .map_err(|e| Error::Internal(anyhow::anyhow!("create temp blob: {e}")))?;

    let mut buf = vec![0u8; IO_BUF_SIZE];
    let mut written = 0u64;
    loop {
        let n = reader
            .read(&mut buf)
            .await
            .map_err(|e| Error::Internal(anyhow::anyhow!("read upload stream: {e}")))?;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n])
            .await
            .map_err(|e| Error::Internal(anyhow::anyhow!("write temp blob: {e}")))?;
        written += n as u64;
    }

    file.sync_all()
        .await
        .map_err(|e| Error::Internal(anyhow::anyhow!("fsync temp blob: {e}")))?;
    Ok(written)
}

/// Best-effort temp cleanup; the error path already carries the real cause.
async fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to remove temp blob");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store() -> (tempfile::TempDir, BlobStore) {
        let dir = tempfile::TempDir::new().unwrap_or_else(|e| panic!("tempdir failed: {e}"));
        let store = BlobStore::open(dir.path()).unwrap_or_else(|e| panic!("open failed: {e}"));
        (dir, store)
    }

    #[tokio::test]
    async fn test_should_write_and_read_blob() {
        let (_dir, store) = open_store();
        let data = b"hello blob world";

        let written = store
            .write("t1/b1/obj", &data[..])
            .await
            .unwrap_or_else(|e| panic!("write failed: {e}"));
        assert_eq!(written, data.len() as u64);

        let read = store
            .read_all("t1/b1/obj", None)
            .await
            .unwrap_or_else(|e| panic!("read failed: {e}"));
        assert_eq!(read.as_ref(), data);
    }

    #[tokio::test]
    async fn test_should_read_byte_range() {
        let (_dir, store) = open_store();
        store
            .write("t/b/k", &b"hello world"[..])
            .await
            .unwrap_or_else(|e| panic!("write failed: {e}"));

        let range = store
            .read_all("t/b/k", Some((6, 5)))
            .await
            .unwrap_or_else(|e| panic!("range read failed: {e}"));
        assert_eq!(range.as_ref(), b"world");
    }

    #[tokio::test]
    async fn test_should_reject_out_of_bounds_range() {
        let (_dir, store) = open_store();
        store.write("t/b/k", &b"abc"[..]).await.unwrap();

        let result = store.open_reader("t/b/k", Some((0, 100))).await;
        assert!(matches!(result, Err(Error::InvalidRange)));

        let result = store.open_reader("t/b/k", Some((3, 1))).await;
        assert!(matches!(result, Err(Error::InvalidRange)));
    }

    #[tokio::test]
    async fn test_should_return_not_found_for_missing_blob() {
        let (_dir, store) = open_store();
        let result = store.read_all("t/b/ghost", None).await;
        assert!(matches!(result, Err(Error::NoSuchKey { .. })));
    }

    #[tokio::test]
    async fn test_should_delete_idempotently() {
        let (_dir, store) = open_store();
        store.write("t/b/k", &b"x"[..]).await.unwrap();

        store
            .delete("t/b/k")
            .await
            .unwrap_or_else(|e| panic!("delete failed: {e}"));
        store
            .delete("t/b/k")
            .await
            .unwrap_or_else(|e| panic!("second delete failed: {e}"));

        assert!(matches!(
            store.read_all("t/b/k", None).await,
            Err(Error::NoSuchKey { .. })
        ));
    }

    #[tokio::test]
    async fn test_should_overwrite_atomically() {
        let (_dir, store) = open_store();
        store.write("t/b/k", &b"version one"[..]).await.unwrap();
        store.write("t/b/k", &b"two"[..]).await.unwrap();

        let read = store.read_all("t/b/k", None).await.unwrap();
        assert_eq!(read.as_ref(), b"two");
    }

    #[tokio::test]
    async fn test_should_stat_blob() {
        let (_dir, store) = open_store();
        store.write("t/b/k", &b"12345"[..]).await.unwrap();

        let stat = store
            .stat("t/b/k")
            .await
            .unwrap_or_else(|e| panic!("stat failed: {e}"));
        assert_eq!(stat.size, 5);
        assert!(stat.mtime > 0);
    }

    #[tokio::test]
    async fn test_should_reject_traversal_refs() {
        let (_dir, store) = open_store();
        for bad in ["../escape", "a//b", "a/./b", "a/../b", ""] {
            let result = store.write(bad, &b"x"[..]).await;
            assert!(
                matches!(result, Err(Error::InvalidArgument { .. })),
                "ref {bad:?} must be rejected"
            );
        }
    }

    #[tokio::test]
    async fn test_should_delete_prefix_recursively() {
        let (_dir, store) = open_store();
        store.write("t/b/mpu/u1/00001", &b"p1"[..]).await.unwrap();
        store.write("t/b/mpu/u1/00002", &b"p2"[..]).await.unwrap();
        store.write("t/b/mpu/u2/00001", &b"other"[..]).await.unwrap();

        store
            .delete_prefix("t/b/mpu/u1")
            .await
            .unwrap_or_else(|e| panic!("delete_prefix failed: {e}"));

        assert!(store.read_all("t/b/mpu/u1/00001", None).await.is_err());
        assert!(store.read_all("t/b/mpu/u2/00001", None).await.is_ok());
    }

    #[tokio::test]
    async fn test_should_stream_large_blob_through_fixed_buffer() {
        let (_dir, store) = open_store();
        let data = vec![0xCD_u8; IO_BUF_SIZE * 3 + 17];

        let written = store.write("t/b/big", data.as_slice()).await.unwrap();
        assert_eq!(written, data.len() as u64);

        let read = store.read_all("t/b/big", None).await.unwrap();
        assert_eq!(read.len(), data.len());
        assert_eq!(read.as_ref(), data.as_slice());
    }
}
