//! ETag computation.
//!
//! Single-PUT ETags are the MD5 of the plaintext, quoted. Multipart ETags
//! are the MD5 of the concatenated binary part digests with a `-{count}`
//! suffix, which is what AWS computes and what SDK integrity checks expect.

use md5::{Digest, Md5};

/// Lowercase hex MD5 of `data`.
#[must_use]
pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// Quoted single-part ETag.
#[must_use]
pub fn etag_for(data: &[u8]) -> String {
    format!("\"{}\"", md5_hex(data))
}

/// Quoted composite ETag for a completed multipart upload.
///
/// `part_md5_hexes` are the unquoted per-part digests in part order.
#[must_use]
pub fn multipart_etag(part_md5_hexes: &[String]) -> String {
    let mut hasher = Md5::new();
    for part in part_md5_hexes {
        // Part digests are produced by this crate; a corrupt one would mean
        // a corrupted metadata row, so fall back to empty rather than panic.
        let raw = hex::decode(part).unwrap_or_default();
        hasher.update(&raw);
    }
    format!(
        "\"{}-{}\"",
        hex::encode(hasher.finalize()),
        part_md5_hexes.len()
    )
}

/// Strip surrounding quotes from an ETag for comparison.
#[must_use]
pub fn unquote(etag: &str) -> &str {
    etag.trim_matches('"')
}

/// Incremental MD5 over streamed chunks.
#[derive(Debug, Default)]
pub struct Md5Stream {
    hasher: Md5,
    len: u64,
}

impl Md5Stream {
    /// Start a new digest.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk.
    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.len += chunk.len() as u64;
    }

    /// Finish, returning `(unquoted_hex, total_bytes)`.
    #[must_use]
    pub fn finish(self) -> (String, u64) {
        (hex::encode(self.hasher.finalize()), self.len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_compute_known_md5() {
        // RFC 1321 test vector.
        assert_eq!(md5_hex(b"abc"), "900150983cd24fb0d6963f7d28e17f72");
        assert_eq!(etag_for(b""), "\"d41d8cd98f00b204e9800998ecf8427e\"");
    }

    #[test]
    fn test_should_compute_composite_etag_from_binary_digests() {
        let p1 = md5_hex(b"part one");
        let p2 = md5_hex(b"part two");

        // Reference computation: MD5 over the concatenated raw digests.
        let mut reference = Md5::new();
        reference.update(hex::decode(&p1).unwrap());
        reference.update(hex::decode(&p2).unwrap());
        let expected = format!("\"{}-2\"", hex::encode(reference.finalize()));

        assert_eq!(multipart_etag(&[p1, p2]), expected);
    }

    #[test]
    fn test_should_match_streamed_and_oneshot_digests() {
        let data = vec![0x5A_u8; 100_000];
        let mut stream = Md5Stream::new();
        for chunk in data.chunks(4096) {
            stream.update(chunk);
        }
        let (hex_digest, len) = stream.finish();
        assert_eq!(hex_digest, md5_hex(&data));
        assert_eq!(len, data.len() as u64);
    }

    #[test]
    fn test_should_unquote_etags() {
        assert_eq!(unquote("\"abc\""), "abc");
        assert_eq!(unquote("abc"), "abc");
    }
}
