//! The content-addressed layer cache.
//!
//! ```text
//! <root>/
//!   version                                    cache layout version guard
//!   layers/<digest-hex>                         compressed tar.gz blob
//!   layers/<digest-hex>.json                    metadata
//!   selectors/<sha256-of-key>                   text file holding a digest-hex
//!   tmp/                                        in-progress writes + lockfiles
//! ```
//!
//! All fs operations here are synchronous. A lookup is a single stat plus a
//! small JSON parse, cheap enough to call directly from an async task; a
//! `put` for a freshly walked directory tree is heavier and callers that
//! build the entry list off the filesystem do that walk inside
//! `tokio::task::spawn_blocking` before handing the result to `put`.

mod lock;

pub use lock::CacheLock;

use crate::digest::{Blob, BlobDescriptor, Sha256Digest};
use crate::error::{BuildError, Result};
use crate::model::{CachedLayerMetadata, Layer};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CACHE_LAYOUT_VERSION: &str = "1";

pub struct Cache {
    root: PathBuf,
    lock_timeout: Duration,
    lock_poll_interval: Duration,
}

/// A fully materialized, resolvable-by-either-key cache entry.
#[derive(Debug, Clone)]
pub struct CachedLayer {
    pub compressed_path: PathBuf,
    pub descriptor: BlobDescriptor,
    pub diff_id: Sha256Digest,
    pub metadata: Option<CachedLayerMetadata>,
}

impl CachedLayer {
    pub fn into_layer(self) -> Layer {
        Layer::Cached {
            compressed_path: self.compressed_path,
            descriptor: self.descriptor,
            diff_id: self.diff_id,
        }
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
struct LayerJson {
    diff_id: Sha256Digest,
    size: i64,
    #[serde(flatten)]
    metadata: Option<CachedLayerMetadata>,
}

impl Cache {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(root.join("layers"))?;
        std::fs::create_dir_all(root.join("selectors"))?;
        std::fs::create_dir_all(root.join("tmp"))?;

        let version_path = root.join("version");
        if version_path.exists() {
            let existing = std::fs::read_to_string(&version_path)?;
            if existing.trim() != CACHE_LAYOUT_VERSION {
                return Err(BuildError::CacheCorrupted {
                    path: version_path,
                    reason: format!(
                        "cache layout version {} is incompatible with this build (expected {})",
                        existing.trim(),
                        CACHE_LAYOUT_VERSION
                    ),
                });
            }
        } else {
            atomic_write(&root.join("tmp"), &version_path, CACHE_LAYOUT_VERSION.as_bytes())?;
        }

        Ok(Self {
            root,
            lock_timeout: Duration::from_secs(30),
            lock_poll_interval: Duration::from_millis(50),
        })
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_lock_poll_interval(mut self, interval: Duration) -> Self {
        self.lock_poll_interval = interval;
        self
    }

    fn layers_dir(&self) -> PathBuf {
        self.root.join("layers")
    }

    fn selectors_dir(&self) -> PathBuf {
        self.root.join("selectors")
    }

    fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    /// Derives the on-disk selector filename for a cache key. The selector
    /// key (`SHA-256` over `kind, ordered source paths, mtimes`) is computed
    /// by the caller and passed in as `raw_key`; this hashes it again so
    /// arbitrarily long keys still map to a fixed-width filename.
    pub fn selector_digest(raw_key: &str) -> String {
        Sha256Digest::of_bytes(raw_key.as_bytes()).hex().to_string()
    }

    /// O(1) path-stat lookup by compressed digest.
    pub fn get(&self, digest: &Sha256Digest) -> Result<Option<CachedLayer>> {
        let blob_path = self.layers_dir().join(digest.hex());
        let json_path = self.layers_dir().join(format!("{}.json", digest.hex()));

        if !blob_path.exists() || !json_path.exists() {
            return Ok(None);
        }

        let json = match std::fs::read_to_string(&json_path) {
            Ok(j) => j,
            Err(_) => return Ok(None),
        };
        let parsed: LayerJson = match serde_json::from_str(&json) {
            Ok(p) => p,
            Err(_) => return Ok(None),
        };

        let size = blob_path.metadata()?.len();
        Ok(Some(CachedLayer {
            compressed_path: blob_path,
            descriptor: BlobDescriptor::new(digest.clone(), size),
            diff_id: parsed.diff_id,
            metadata: parsed.metadata,
        }))
    }

    /// Resolves a selector key to a cached layer via `selectors/`.
    pub fn get_by_selector(&self, raw_key: &str) -> Result<Option<CachedLayer>> {
        let selector_path = self.selectors_dir().join(Self::selector_digest(raw_key));
        let digest_hex = match std::fs::read_to_string(&selector_path) {
            Ok(s) => s,
            Err(_) => return Ok(None),
        };
        let digest = match Sha256Digest::parse(digest_hex.trim()) {
            Ok(d) => d,
            Err(_) => return Ok(None),
        };
        self.get(&digest)
    }

    /// Verifies that the bytes on disk for `digest` actually hash to it,
    /// and that gunzipping them yields `diff_id`. Callers use this before
    /// trusting a cache hit for a push (e.g. after suspecting disk
    /// corruption); `get`/`get_by_selector` themselves stay O(1).
    pub fn verify(&self, layer: &CachedLayer) -> Result<()> {
        let bytes = std::fs::read(&layer.compressed_path)?;
        let actual_digest = Sha256Digest::of_bytes(&bytes);
        if actual_digest != layer.descriptor.digest {
            return Err(BuildError::CacheCorrupted {
                path: layer.compressed_path.clone(),
                reason: format!(
                    "blob hashes to {actual_digest} but cache recorded {}",
                    layer.descriptor.digest
                ),
            });
        }

        let mut decoder = flate2::read::GzDecoder::new(std::io::Cursor::new(bytes));
        let mut uncompressed = Vec::new();
        std::io::Read::read_to_end(&mut decoder, &mut uncompressed)?;
        let actual_diff_id = Sha256Digest::of_bytes(&uncompressed);
        if actual_diff_id != layer.diff_id {
            return Err(BuildError::CacheCorrupted {
                path: layer.compressed_path.clone(),
                reason: format!(
                    "uncompressed content hashes to {actual_diff_id} but cache recorded diff_id {}",
                    layer.diff_id
                ),
            });
        }
        Ok(())
    }

    /// Builds and caches an `Unwritten` layer, guaranteeing at most one
    /// builder runs per `selector_key` (when given) — a second concurrent
    /// caller blocks on the advisory lock and then observes the first
    /// caller's result instead of rebuilding.
    pub fn put(
        &self,
        compressed: &dyn Blob,
        uncompressed: &dyn Blob,
        selector_key: Option<&str>,
        metadata: Option<CachedLayerMetadata>,
    ) -> Result<CachedLayer> {
        let _lock = match selector_key {
            Some(key) => Some(CacheLock::acquire_with_poll(
                &self.tmp_dir(),
                &Self::selector_digest(key),
                self.lock_timeout,
                self.lock_poll_interval,
            )?),
            None => None,
        };

        if let Some(key) = selector_key {
            if let Some(existing) = self.get_by_selector(key)? {
                return Ok(existing);
            }
        }

        // diff_id: hash the uncompressed stream without persisting it.
        let mut sink = crate::digest::HashingSink::new(std::io::sink());
        uncompressed.write_to(&mut sink)?;
        let diff_id = sink.finish().1.digest;

        // compressed bytes: persist under tmp/ first, fsync, then rename.
        let tmp_path = self.tmp_dir().join(format!("write-{}", uuid::Uuid::new_v4()));
        let descriptor = {
            let mut file = std::fs::File::create(&tmp_path)?;
            let descriptor = compressed.write_to(&mut file)?;
            file.sync_all()?;
            descriptor
        };

        let final_path = self.layers_dir().join(descriptor.digest.hex());
        std::fs::rename(&tmp_path, &final_path)?;

        let json_path = self
            .layers_dir()
            .join(format!("{}.json", descriptor.digest.hex()));
        let layer_json = LayerJson {
            diff_id: diff_id.clone(),
            size: descriptor.size,
            metadata: metadata.clone(),
        };
        atomic_write(&self.tmp_dir(), &json_path, serde_json::to_string(&layer_json)?.as_bytes())?;

        if let Some(key) = selector_key {
            let selector_path = self.selectors_dir().join(Self::selector_digest(key));
            atomic_write(&self.tmp_dir(), &selector_path, descriptor.digest.hex().as_bytes())?;
        }

        Ok(CachedLayer {
            compressed_path: final_path,
            descriptor,
            diff_id,
            metadata,
        })
    }

    /// Registers an already-fetched blob (e.g. a base-image layer pulled
    /// straight into `layers/` by the registry client) without going
    /// through the `Blob` write path again.
    pub fn adopt(
        &self,
        tmp_path: &Path,
        digest: &Sha256Digest,
        diff_id: Option<Sha256Digest>,
    ) -> Result<CachedLayer> {
        let final_path = self.layers_dir().join(digest.hex());
        std::fs::rename(tmp_path, &final_path)?;
        let size = final_path.metadata()?.len();

        let diff_id = match diff_id {
            Some(d) => d,
            None => {
                let bytes = std::fs::read(&final_path)?;
                let mut decoder = flate2::read::GzDecoder::new(std::io::Cursor::new(bytes));
                let mut uncompressed = Vec::new();
                std::io::Read::read_to_end(&mut decoder, &mut uncompressed)?;
                Sha256Digest::of_bytes(&uncompressed)
            }
        };

        let json_path = self.layers_dir().join(format!("{}.json", digest.hex()));
        let layer_json = LayerJson {
            diff_id: diff_id.clone(),
            size: size as i64,
            metadata: None,
        };
        atomic_write(&self.tmp_dir(), &json_path, serde_json::to_string(&layer_json)?.as_bytes())?;

        Ok(CachedLayer {
            compressed_path: final_path,
            descriptor: BlobDescriptor::new(digest.clone(), size),
            diff_id,
            metadata: None,
        })
    }

    pub fn tmp_file(&self) -> PathBuf {
        self.tmp_dir().join(format!("fetch-{}", uuid::Uuid::new_v4()))
    }
}

fn atomic_write(tmp_dir: &Path, dest: &Path, bytes: &[u8]) -> Result<()> {
    let tmp_path = tmp_dir.join(format!("write-{}", uuid::Uuid::new_v4()));
    {
        let mut file = std::fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp_path, dest)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::BytesBlob;

    #[test]
    fn put_then_get_by_digest_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = Cache::open(tmp.path()).unwrap();

        let uncompressed = BytesBlob(b"hello layer".to_vec());
        let mut gz = Vec::new();
        {
            let mut encoder =
                flate2::write::GzEncoder::new(&mut gz, flate2::Compression::default());
            encoder.write_all(b"hello layer").unwrap();
            encoder.finish().unwrap();
        }
        let compressed = BytesBlob(gz);

        let cached = cache.put(&compressed, &uncompressed, None, None).unwrap();
        let fetched = cache.get(&cached.descriptor.digest).unwrap().unwrap();
        assert_eq!(fetched.diff_id, cached.diff_id);
        cache.verify(&fetched).unwrap();
    }

    #[test]
    fn put_with_selector_resolves_by_selector_key() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = Cache::open(tmp.path()).unwrap();

        let uncompressed = BytesBlob(b"app layer".to_vec());
        let mut gz = Vec::new();
        {
            let mut encoder =
                flate2::write::GzEncoder::new(&mut gz, flate2::Compression::default());
            encoder.write_all(b"app layer").unwrap();
            encoder.finish().unwrap();
        }
        let compressed = BytesBlob(gz);

        let meta = CachedLayerMetadata {
            kind: "classes".to_string(),
            source_paths: vec!["target/classes".to_string()],
            last_modified: 42,
        };

        cache
            .put(&compressed, &uncompressed, Some("classes:target/classes:42"), Some(meta))
            .unwrap();

        let fetched = cache
            .get_by_selector("classes:target/classes:42")
            .unwrap()
            .unwrap();
        assert_eq!(fetched.metadata.unwrap().kind, "classes");
    }

    #[test]
    fn missing_json_is_treated_as_absent() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = Cache::open(tmp.path()).unwrap();
        let digest = Sha256Digest::of_bytes(b"nonexistent");
        std::fs::write(tmp.path().join("layers").join(digest.hex()), b"x").unwrap();
        assert!(cache.get(&digest).unwrap().is_none());
    }
}
