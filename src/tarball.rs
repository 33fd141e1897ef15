//! The tarball sink: an alternative to pushing, writing a `docker
//! load`-compatible tar instead.
//!
//! The layout matches what `docker load` expects: `manifest.json` (a
//! single-element array), `<config-digest-hex>.json`, and one
//! `<layer-digest-hex>.tar.gz` per layer, all at the tar's root — no nested
//! per-layer directories, since every layer here is already a standalone
//! gzip member rather than the legacy `<id>/layer.tar` + `VERSION` +
//! `json` triple older Docker releases wrote.

use crate::cache::Cache;
use crate::digest::{BlobDescriptor, Sha256Digest};
use crate::error::{BuildError, Result};
use crate::manifest::schema::ManifestV2;
use crate::model::{Image, Layer};
use crate::reference::ImageReference;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(serde::Serialize)]
struct SaveManifestEntry {
    #[serde(rename = "Config")]
    config: String,
    #[serde(rename = "RepoTags")]
    repo_tags: Vec<String>,
    #[serde(rename = "Layers")]
    layers: Vec<String>,
}

/// Writes `image`'s layers, its container config, and a synthesized
/// `manifest.json` into a tar file at `path`. `manifest` only fixes the
/// config's media type/size bookkeeping already folded into
/// `config_bytes`; layer order and digests are read straight off `image`.
pub fn write_tarball(
    path: &Path,
    image: &Image,
    manifest: &ManifestV2,
    config_bytes: &[u8],
    cache: &Cache,
    reference: &ImageReference,
) -> Result<()> {
    let _ = manifest;
    let config_digest = Sha256Digest::of_bytes(config_bytes);
    let config_name = format!("{}.json", config_digest.hex());

    let mut layer_names = Vec::with_capacity(image.layers.len());
    let mut layer_paths = Vec::with_capacity(image.layers.len());
    for layer in image.layers.iter() {
        let descriptor = layer.descriptor()?;
        layer_paths.push(layer_blob_path(layer, cache, descriptor)?);
        layer_names.push(format!("{}.tar.gz", descriptor.digest.hex()));
    }

    let repo_tags = if reference.is_scratch() {
        Vec::new()
    } else {
        vec![reference.to_string()]
    };

    let save_manifest = vec![SaveManifestEntry {
        config: config_name.clone(),
        repo_tags,
        layers: layer_names.clone(),
    }];

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::File::create(path)?;
    let mut builder = tar::Builder::new(file);
    builder.mode(tar::HeaderMode::Deterministic);

    append_bytes(&mut builder, "manifest.json", &serde_json::to_vec(&save_manifest)?)?;
    append_bytes(&mut builder, &config_name, config_bytes)?;
    for (name, blob_path) in layer_names.iter().zip(layer_paths.iter()) {
        append_file(&mut builder, name, blob_path)?;
    }

    builder.into_inner()?.sync_all()?;
    Ok(())
}

/// Every layer this pipeline produces is `Layer::Cached` by the time it
/// reaches `Image.layers` (see `pipeline::pull_and_cache_layer` and
/// `build_and_cache_app_layer`); the `Cache::get` fallback below only
/// matters if a caller ever hands this function an `Image` assembled some
/// other way.
fn layer_blob_path(layer: &Layer, cache: &Cache, descriptor: &BlobDescriptor) -> Result<PathBuf> {
    if let Layer::Cached { compressed_path, .. } = layer {
        return Ok(compressed_path.clone());
    }
    cache
        .get(&descriptor.digest)?
        .map(|cached| cached.compressed_path)
        .ok_or_else(|| {
            BuildError::Validation(format!(
                "layer {} has no local bytes available to write into a tarball",
                descriptor.digest
            ))
        })
}

fn append_bytes<W: Write>(builder: &mut tar::Builder<W>, name: &str, bytes: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_mode(0o644);
    header.set_size(bytes.len() as u64);
    header.set_mtime(1);
    header.set_entry_type(tar::EntryType::Regular);
    header.set_cksum();
    builder.append_data(&mut header, name, bytes).map_err(BuildError::from)
}

fn append_file<W: Write>(builder: &mut tar::Builder<W>, name: &str, source: &Path) -> Result<()> {
    let mut file = std::fs::File::open(source)?;
    let size = file.metadata()?.len();
    let mut header = tar::Header::new_gnu();
    header.set_mode(0o644);
    header.set_size(size);
    header.set_mtime(1);
    header.set_entry_type(tar::EntryType::Regular);
    header.set_cksum();
    builder
        .append_data(&mut header, name, &mut file)
        .map_err(BuildError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::BytesBlob;
    use crate::manifest::Translator;
    use crate::model::Platform;

    fn sample_cached_layer(cache: &Cache, content: &[u8]) -> Layer {
        let uncompressed = BytesBlob(content.to_vec());
        let mut gz = Vec::new();
        {
            let mut encoder = flate2::write::GzEncoder::new(&mut gz, flate2::Compression::default());
            encoder.write_all(content).unwrap();
            encoder.finish().unwrap();
        }
        let compressed = BytesBlob(gz);
        cache.put(&compressed, &uncompressed, None, None).unwrap().into_layer()
    }

    #[test]
    fn writes_manifest_config_and_layers_at_tar_root() {
        let cache_dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(cache_dir.path()).unwrap();

        let mut image = Image::default();
        image.layers.push(sample_cached_layer(&cache, b"layer-one")).unwrap();
        image.entrypoint = vec!["/app/run".to_string()];

        let platform = Platform::default();
        let config = Translator::build_container_config(&image, &platform).unwrap();
        let (config_bytes, config_descriptor) = Translator::config_blob(&config).unwrap();
        let manifest = Translator::build_manifest(&image, config_descriptor, false).unwrap();

        let out_dir = tempfile::tempdir().unwrap();
        let out_path = out_dir.path().join("image.tar");
        let reference = ImageReference::parse("localhost:5000/app:v1").unwrap();

        write_tarball(&out_path, &image, &manifest, &config_bytes, &cache, &reference).unwrap();

        let file = std::fs::File::open(&out_path).unwrap();
        let mut archive = tar::Archive::new(file);
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().to_string())
            .collect();

        assert!(names.contains(&"manifest.json".to_string()));
        assert_eq!(names.len(), 3);
    }

    #[test]
    fn repo_tags_reflect_the_output_reference() {
        let cache_dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(cache_dir.path()).unwrap();
        let image = Image::default();
        let platform = Platform::default();
        let config = Translator::build_container_config(&image, &platform).unwrap();
        let (config_bytes, config_descriptor) = Translator::config_blob(&config).unwrap();
        let manifest = Translator::build_manifest(&image, config_descriptor, false).unwrap();

        let out_dir = tempfile::tempdir().unwrap();
        let out_path = out_dir.path().join("scratch.tar");
        let reference = ImageReference::parse("scratch").unwrap();

        write_tarball(&out_path, &image, &manifest, &config_bytes, &cache, &reference).unwrap();

        let file = std::fs::File::open(&out_path).unwrap();
        let mut archive = tar::Archive::new(file);
        let mut manifest_entry = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap())
            .find(|e| e.path().unwrap().to_string_lossy() == "manifest.json")
            .unwrap();
        let mut bytes = Vec::new();
        std::io::Read::read_to_end(&mut manifest_entry, &mut bytes).unwrap();
        let parsed: Vec<serde_json::Value> = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed[0]["RepoTags"], serde_json::json!([]));
    }
}
