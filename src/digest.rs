//! SHA-256 digests and the one-pass hashing sink all blob I/O flows through.
//!
//! Every byte of layer content that crosses an I/O boundary in this crate is
//! written through a [`HashingSink`] so that a digest and a byte count are
//! always computed in the same pass as the transport, never as a separate
//! buffer-then-hash step.

use crate::error::{BuildError, Result};
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::io::{self, Write};

/// The canonical `sha256:<64 lowercase hex>` form of a digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Sha256Digest(String);

impl Sha256Digest {
    /// Parses either a full `sha256:<hex>` string or a bare 64-hex hash.
    pub fn parse(value: &str) -> Result<Self> {
        let hex_part = match value.strip_prefix("sha256:") {
            Some(hex) => hex,
            None => value,
        };

        if hex_part.len() != 64 {
            return Err(BuildError::Validation(format!(
                "digest {value:?} must have 64 hex characters, got {}",
                hex_part.len()
            )));
        }
        if !hex_part.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(BuildError::Validation(format!(
                "digest {value:?} contains non-hex characters"
            )));
        }
        if hex_part.bytes().any(|b| b.is_ascii_uppercase()) {
            return Err(BuildError::Validation(format!(
                "digest {value:?} must be lowercase"
            )));
        }

        Ok(Self(format!("sha256:{hex_part}")))
    }

    /// Builds a digest directly from a completed hasher, bypassing parsing.
    fn from_hasher(hasher: Sha256) -> Self {
        Self(format!("sha256:{:x}", hasher.finalize()))
    }

    /// The full `sha256:<hex>` string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The bare 64-character hex hash, without the `sha256:` prefix — used
    /// for on-disk filenames under the cache's `layers/` directory.
    pub fn hex(&self) -> &str {
        &self.0[7..]
    }

    pub fn of_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self::from_hasher(hasher)
    }
}

impl fmt::Display for Sha256Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for Sha256Digest {
    type Err = BuildError;
    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl serde::Serialize for Sha256Digest {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for Sha256Digest {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Sha256Digest::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// A digest paired with the byte length of the blob it identifies.
///
/// `size = -1` marks an unknown size, which is only legal for an
/// upload-time HTTP body whose length hasn't been measured yet — never for
/// a descriptor that has been persisted to a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlobDescriptor {
    pub digest: Sha256Digest,
    pub size: i64,
}

impl BlobDescriptor {
    pub fn new(digest: Sha256Digest, size: u64) -> Self {
        Self {
            digest,
            size: size as i64,
        }
    }

    pub fn size_unknown(digest: Sha256Digest) -> Self {
        Self { digest, size: -1 }
    }

    pub fn size_known(&self) -> Option<u64> {
        (self.size >= 0).then_some(self.size as u64)
    }
}

/// A `Write` adapter that forwards every write to an inner writer while
/// feeding a running SHA-256 hash, so the digest of a stream and its byte
/// count are available the instant the stream finishes — without ever
/// buffering the whole thing.
pub struct HashingSink<W> {
    inner: W,
    hasher: Sha256,
    bytes_written: u64,
}

impl<W: Write> HashingSink<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            bytes_written: 0,
        }
    }

    /// Consumes the sink, returning the inner writer and the observed
    /// digest/size. Does not flush; callers that need flushed bytes on disk
    /// should `flush()` before calling this.
    pub fn finish(self) -> (W, BlobDescriptor) {
        let descriptor =
            BlobDescriptor::new(Sha256Digest::from_hasher(self.hasher), self.bytes_written);
        (self.inner, descriptor)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }
}

impl<W: Write> Write for HashingSink<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes_written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// A value that writes its bytes exactly once to a sink and reports the
/// descriptor it observed. Implementors MAY be retryable (the write is
/// idempotent and safe to replay on a transport retry) or not; the HTTP
/// layer consults [`Blob::is_retryable`] before resuming an upload.
pub trait Blob: Send + Sync {
    fn write_to(&self, sink: &mut dyn Write) -> Result<BlobDescriptor>;
    fn is_retryable(&self) -> bool {
        true
    }
    /// Size hint for HTTP `Content-Length`, if known ahead of time.
    fn size_hint(&self) -> Option<u64> {
        None
    }
}

/// The empty blob — used as the config for a from-scratch image.
pub struct EmptyBlob;

impl Blob for EmptyBlob {
    fn write_to(&self, sink: &mut dyn Write) -> Result<BlobDescriptor> {
        let mut hashing = HashingSink::new(sink);
        hashing.write_all(&[])?;
        Ok(hashing.finish().1)
    }
    fn size_hint(&self) -> Option<u64> {
        Some(0)
    }
}

/// An in-memory byte blob (manifests, container configs).
pub struct BytesBlob(pub Vec<u8>);

impl Blob for BytesBlob {
    fn write_to(&self, sink: &mut dyn Write) -> Result<BlobDescriptor> {
        let mut hashing = HashingSink::new(sink);
        hashing.write_all(&self.0)?;
        Ok(hashing.finish().1)
    }
    fn size_hint(&self) -> Option<u64> {
        Some(self.0.len() as u64)
    }
}

/// A blob backed by a file on disk. Retryable: re-reading a file from the
/// start is idempotent.
pub struct FileBlob(pub std::path::PathBuf);

impl Blob for FileBlob {
    fn write_to(&self, sink: &mut dyn Write) -> Result<BlobDescriptor> {
        let mut file = std::fs::File::open(&self.0)?;
        let mut hashing = HashingSink::new(sink);
        io::copy(&mut file, &mut hashing)?;
        Ok(hashing.finish().1)
    }
    fn size_hint(&self) -> Option<u64> {
        std::fs::metadata(&self.0).ok().map(|m| m.len())
    }
}

/// A blob whose bytes come from an arbitrary callback. Retryability is
/// caller-declared since the callback's idempotence can't be inferred.
pub struct WriterBlob<F> {
    write_fn: F,
    retryable: bool,
}

impl<F> WriterBlob<F>
where
    F: Fn(&mut dyn Write) -> Result<()> + Send + Sync,
{
    pub fn new(retryable: bool, write_fn: F) -> Self {
        Self { write_fn, retryable }
    }
}

impl<F> Blob for WriterBlob<F>
where
    F: Fn(&mut dyn Write) -> Result<()> + Send + Sync,
{
    fn write_to(&self, sink: &mut dyn Write) -> Result<BlobDescriptor> {
        let mut hashing = HashingSink::new(sink);
        (self.write_fn)(&mut hashing)?;
        Ok(hashing.finish().1)
    }
    fn is_retryable(&self) -> bool {
        self.retryable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_and_bare_forms() {
        let hex = "e".repeat(64);
        let full = format!("sha256:{hex}");
        assert_eq!(Sha256Digest::parse(&full).unwrap().as_str(), full);
        assert_eq!(Sha256Digest::parse(&hex).unwrap().as_str(), full);
    }

    #[test]
    fn rejects_bad_digests() {
        assert!(Sha256Digest::parse("sha256:abc").is_err());
        assert!(Sha256Digest::parse(&"g".repeat(64)).is_err());
        assert!(Sha256Digest::parse(&"A".repeat(64)).is_err());
        assert!(Sha256Digest::parse("md5:aabbcc").is_err());
    }

    #[test]
    fn hashing_sink_reports_size_and_forwards_bytes() {
        let mut out = Vec::new();
        let desc = {
            let mut sink = HashingSink::new(&mut out);
            sink.write_all(b"hi\n").unwrap();
            sink.finish().1
        };
        assert_eq!(desc.size, 3);
        assert_eq!(out, b"hi\n");
    }

    #[test]
    fn empty_blob_hashes_to_known_empty_digest() {
        let mut out = Vec::new();
        let desc = EmptyBlob.write_to(&mut out).unwrap();
        assert_eq!(
            desc.digest.as_str(),
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(desc.size, 0);
    }
}
