//! At-rest encryption for object payloads.
//!
//! MaxIOFS encrypts blobs with AES-256-CTR under a single 32-byte master key
//! and a random per-object IV. CTR mode is length-preserving and seekable,
//! so ranged reads decrypt from any offset without touching earlier bytes.
//!
//! [`CtrStream`] wraps any [`AsyncRead`] and applies the keystream to bytes
//! as they pass through; the same wrapper serves both directions because CTR
//! encryption and decryption are the same operation. Buffering is bounded by
//! the caller's read buffer (the blob store uses 32 KiB).
//!
//! Objects written while encryption was enabled remain decryptable after the
//! server-level toggle is switched off, as long as the master key stays
//! loaded: decryption is driven by the per-object `encrypted` flag, never by
//! the toggle.

use std::io;
use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll};

use aes::Aes256;
use aes::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use ctr::Ctr128BE;
use rand::RngExt;
use tokio::io::{AsyncRead, ReadBuf};
use tracing::debug;

use maxiofs_core::{Error, Result};

type Aes256Ctr = Ctr128BE<Aes256>;

/// Master key length in bytes.
pub const KEY_LEN: usize = 32;

/// Per-object IV length in bytes.
pub const IV_LEN: usize = 16;

// ---------------------------------------------------------------------------
// MasterKey
// ---------------------------------------------------------------------------

/// The server-wide 32-byte encryption key.
///
/// Loaded once at startup from a file that must be readable only by its
/// owner. The `Debug` impl never prints key material.
#[derive(Clone)]
pub struct MasterKey([u8; KEY_LEN]);

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey(..)")
    }
}

impl MasterKey {
    /// Wrap raw key bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Generate a fresh random key.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        rand::rng().fill(&mut bytes);
        Self(bytes)
    }

    /// Load the key from `path`.
    ///
    /// # Errors
    ///
    /// - The file must contain exactly 32 raw bytes.
    /// - On Unix the file mode must not grant group/other access.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .map_err(|e| Error::Internal(anyhow::anyhow!("read master key {}: {e}", path.display())))?;

        let key: [u8; KEY_LEN] = bytes.as_slice().try_into().map_err(|_| {
            Error::Internal(anyhow::anyhow!(
                "master key {} must be exactly {KEY_LEN} bytes, found {}",
                path.display(),
                bytes.len()
            ))
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(path)
                .map_err(|e| Error::Internal(anyhow::anyhow!("stat master key: {e}")))?
                .permissions()
                .mode();
            if mode & 0o077 != 0 {
                return Err(Error::Internal(anyhow::anyhow!(
                    "master key {} is readable by group/other (mode {:o}); chmod 600 it",
                    path.display(),
                    mode & 0o777
                )));
            }
        }

        debug!(path = %path.display(), "loaded master key");
        Ok(Self(key))
    }

    /// Write the key to `path` with owner-only permissions, creating parent
    /// directories.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Internal(anyhow::anyhow!("create key dir: {e}")))?;
        }
        std::fs::write(path, self.0)
            .map_err(|e| Error::Internal(anyhow::anyhow!("write master key: {e}")))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                .map_err(|e| Error::Internal(anyhow::anyhow!("chmod master key: {e}")))?;
        }
        Ok(())
    }

    /// Raw key bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

/// Generate a random 16-byte IV for a new object version.
///
/// IVs are stored alongside the version record and never reused: every
/// encrypted write draws a fresh one.
#[must_use]
pub fn random_iv() -> [u8; IV_LEN] {
    let mut iv = [0u8; IV_LEN];
    rand::rng().fill(&mut iv);
    iv
}

/// Parse a hex-encoded IV from a version record.
pub fn parse_iv(iv_hex: &str) -> Result<[u8; IV_LEN]> {
    let bytes = hex::decode(iv_hex)
        .map_err(|e| Error::Internal(anyhow::anyhow!("corrupt IV encoding: {e}")))?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| Error::Internal(anyhow::anyhow!("IV must be {IV_LEN} bytes")))
}

// ---------------------------------------------------------------------------
// CtrStream
// ---------------------------------------------------------------------------

/// An [`AsyncRead`] adapter that XORs the AES-256-CTR keystream over
/// everything read through it.
///
/// Wrap a plaintext reader to encrypt on the way to disk, or a ciphertext
/// reader to decrypt on the way out. For ranged reads, construct with
/// [`CtrStream::with_offset`] so the keystream starts at the right counter
/// position.
pub struct CtrStream<R> {
    inner: R,
    cipher: Aes256Ctr,
}

impl<R: std::fmt::Debug> std::fmt::Debug for CtrStream<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CtrStream")
            .field("inner", &self.inner)
            .field("cipher", &"Aes256Ctr")
            .finish()
    }
}

impl<R> CtrStream<R> {
    /// Start the keystream at byte 0.
    #[must_use]
    pub fn new(key: &MasterKey, iv: &[u8; IV_LEN], inner: R) -> Self {
        let cipher = Aes256Ctr::new(key.as_bytes().into(), iv.into());
        Self { inner, cipher }
    }

    /// Start the keystream at `offset` bytes into the object, for ranged
    /// decryption.
    #[must_use]
    pub fn with_offset(key: &MasterKey, iv: &[u8; IV_LEN], inner: R, offset: u64) -> Self {
        let mut cipher = Aes256Ctr::new(key.as_bytes().into(), iv.into());
        cipher.seek(offset);
        Self { inner, cipher }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for CtrStream<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let already_filled = buf.filled().len();
        let me = &mut *self;
        match Pin::new(&mut me.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                me.cipher.apply_keystream(&mut buf.filled_mut()[already_filled..]);
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}
