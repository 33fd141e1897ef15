//! Translates between [`crate::model::Image`] and the wire schemas in
//! [`super::schema`].
//!
//! Container config JSON produced here is canonical: `ContainerConfigFields`
//! and friends are plain structs (not `HashMap`s) so field order is fixed
//! by the struct definition, and every map-valued field (`Labels`,
//! `ExposedPorts`) is a `BTreeMap`, which `serde_json` always emits in key
//! order — together these make the produced bytes, and therefore the
//! config digest, reproducible for identical `Image` inputs.

use super::media_types::{self, all_accept_types};
use super::schema::{
    ContainerConfig, ContainerConfigFields, ContentDescriptor, EmptyObject, HistoryEntry,
    IndexEntry, ManifestIndex, ManifestV2, ManifestV2_1, RootFs,
};
use crate::digest::{BlobDescriptor, BytesBlob, Sha256Digest};
use crate::error::{BuildError, Result};
use crate::model::{Image, Layer, Platform};
use std::time::{SystemTime, UNIX_EPOCH};

/// The result of pulling `GET /v2/<repo>/manifests/<ref>`: either a
/// directly usable manifest, or a list/index that still needs a platform
/// selected out of it.
#[derive(Clone)]
pub enum ParsedManifest {
    V2 {
        manifest: ManifestV2,
        /// `None` for OCI/Docker v2.2, whose layers already carry diff-ids
        /// via the container config; `Some` only really matters for v2.1.
        layer_digests_fs_order: Vec<Sha256Digest>,
    },
    V2_1(ManifestV2_1),
    Index(ManifestIndex),
}

pub struct Translator;

impl Translator {
    /// Parses a manifest response body given its `Content-Type`, without
    /// yet resolving a list/index to a single-platform manifest.
    pub fn parse(content_type: &str, body: &[u8]) -> Result<ParsedManifest> {
        if media_types::is_list_or_index(content_type) {
            let index: ManifestIndex = serde_json::from_slice(body)?;
            return Ok(ParsedManifest::Index(index));
        }
        if media_types::is_v2_1(content_type) {
            let v1: ManifestV2_1 = serde_json::from_slice(body)?;
            return Ok(ParsedManifest::V2_1(v1));
        }
        if all_accept_types().contains(&content_type)
            || content_type == media_types::DOCKER_MANIFEST_V2_2
            || content_type == media_types::OCI_MANIFEST
        {
            let manifest: ManifestV2 = serde_json::from_slice(body)?;
            return Ok(ParsedManifest::V2 {
                manifest,
                layer_digests_fs_order: Vec::new(),
            });
        }
        Err(BuildError::UnknownManifestFormat(content_type.to_string()))
    }

    /// Selects the entry matching `platform` out of a manifest list/index;
    /// if more than one matches, the first is taken.
    pub fn select_platform<'a>(index: &'a ManifestIndex, platform: &Platform) -> Result<&'a IndexEntry> {
        index
            .manifests
            .iter()
            .find(|entry| {
                platform.matches(
                    &entry.platform.os,
                    &entry.platform.architecture,
                    entry.platform.variant.as_deref(),
                )
            })
            .ok_or_else(|| {
                BuildError::UnknownManifestFormat(format!(
                    "no manifest for platform {}/{}{}",
                    platform.os,
                    platform.architecture,
                    platform
                        .variant
                        .as_ref()
                        .map(|v| format!("/{v}"))
                        .unwrap_or_default()
                ))
            })
    }

    /// Reverses `fsLayers` (wire order is base-layer-last) into filesystem
    /// composition order.
    pub fn v2_1_layer_digests_fs_order(manifest: &ManifestV2_1) -> Vec<Sha256Digest> {
        manifest
            .fs_layers
            .iter()
            .rev()
            .map(|l| l.blob_sum.clone())
            .collect()
    }

    /// Builds the container config JSON for `image`: `rootfs.diff_ids` is
    /// exactly `image.layers`'s diff-ids in order, which every caller of
    /// this function must keep true.
    pub fn build_container_config(
        image: &Image,
        platform: &Platform,
    ) -> Result<ContainerConfig> {
        let diff_ids = image
            .layers
            .iter()
            .map(Layer::diff_id)
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .cloned()
            .collect::<Vec<_>>();

        let history = diff_ids
            .iter()
            .map(|_| HistoryEntry {
                created: Some(format_time(image.creation_time)),
                created_by: "containerize".to_string(),
                empty_layer: None,
            })
            .collect();

        let exposed_ports = image
            .exposed_ports
            .iter()
            .map(|p| (p.to_string(), EmptyObject::default()))
            .collect();

        Ok(ContainerConfig {
            architecture: platform.architecture.clone(),
            os: platform.os.clone(),
            config: ContainerConfigFields {
                env: image
                    .environment
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect(),
                entrypoint: image.entrypoint.clone(),
                cmd: image.cmd.clone(),
                exposed_ports,
                labels: image.labels.clone(),
                user: image.user.clone(),
                working_dir: image.working_dir.clone(),
            },
            rootfs: RootFs {
                kind: "layers".to_string(),
                diff_ids,
            },
            history,
            created: Some(format_time(image.creation_time)),
        })
    }

    /// Serializes a container config to canonical bytes and hashes it in
    /// one pass via [`crate::digest::BytesBlob`].
    pub fn config_blob(config: &ContainerConfig) -> Result<(Vec<u8>, BlobDescriptor)> {
        let bytes = serde_json::to_vec(config)?;
        let blob = BytesBlob(bytes.clone());
        let mut sink = std::io::sink();
        let descriptor = blob.write_to(&mut sink)?;
        Ok((bytes, descriptor))
    }

    /// Builds the pushable manifest: `schemaVersion: 2`, the config
    /// descriptor, and every layer descriptor in filesystem order.
    pub fn build_manifest(
        image: &Image,
        config_descriptor: BlobDescriptor,
        oci: bool,
    ) -> Result<ManifestV2> {
        let (manifest_media_type, config_media_type, layer_media_type) = if oci {
            (
                media_types::OCI_MANIFEST,
                media_types::OCI_IMAGE_CONFIG,
                media_types::OCI_LAYER_GZIP,
            )
        } else {
            (
                media_types::DOCKER_MANIFEST_V2_2,
                media_types::DOCKER_CONTAINER_CONFIG,
                media_types::DOCKER_LAYER_GZIP,
            )
        };

        let layers = image
            .layers
            .iter()
            .map(Layer::descriptor)
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .map(|d| ContentDescriptor {
                media_type: layer_media_type.to_string(),
                size: d.size,
                digest: d.digest.clone(),
            })
            .collect();

        Ok(ManifestV2 {
            schema_version: 2,
            media_type: manifest_media_type.to_string(),
            config: ContentDescriptor {
                media_type: config_media_type.to_string(),
                size: config_descriptor.size,
                digest: config_descriptor.digest,
            },
            layers,
        })
    }
}

use crate::digest::Blob;

fn format_time(time: SystemTime) -> String {
    let secs = time.duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0);
    chrono::DateTime::<chrono::Utc>::from_timestamp(secs, 0)
        .unwrap_or_else(|| chrono::DateTime::<chrono::Utc>::from_timestamp(0, 0).unwrap())
        .to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Port;

    fn sample_image_with_one_layer() -> Image {
        let mut image = Image::default();
        let digest = Sha256Digest::of_bytes(b"layer");
        let descriptor = BlobDescriptor::new(digest.clone(), 100);
        image
            .layers
            .push(Layer::Reference {
                descriptor,
                diff_id: digest,
            })
            .unwrap();
        image.entrypoint = vec!["/app/hello".to_string()];
        image.exposed_ports.insert(Port::new(8080, crate::model::Protocol::Tcp).unwrap());
        image
    }

    #[test]
    fn container_config_diff_ids_match_image_layers_in_order() {
        let image = sample_image_with_one_layer();
        let platform = Platform::default();
        let config = Translator::build_container_config(&image, &platform).unwrap();

        let expected: Vec<Sha256Digest> = image
            .layers
            .iter()
            .map(|l| l.diff_id().unwrap().clone())
            .collect();
        assert_eq!(config.rootfs.diff_ids, expected);
    }

    #[test]
    fn config_serialization_is_deterministic() {
        let image = sample_image_with_one_layer();
        let platform = Platform::default();
        let config = Translator::build_container_config(&image, &platform).unwrap();

        let (_, d1) = Translator::config_blob(&config).unwrap();
        let (_, d2) = Translator::config_blob(&config).unwrap();
        assert_eq!(d1.digest, d2.digest);
    }

    #[test]
    fn manifest_layer_count_matches_image_layers() {
        let image = sample_image_with_one_layer();
        let platform = Platform::default();
        let config = Translator::build_container_config(&image, &platform).unwrap();
        let (_, config_descriptor) = Translator::config_blob(&config).unwrap();
        let manifest = Translator::build_manifest(&image, config_descriptor, false).unwrap();
        assert_eq!(manifest.layers.len(), image.layers.len());
    }

    #[test]
    fn v2_1_fs_layers_are_reversed_to_composition_order() {
        let json = r#"{
            "name": "library/alpine",
            "tag": "latest",
            "fsLayers": [
                {"blobSum": "sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"},
                {"blobSum": "sha256:bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb"}
            ]
        }"#;
        let manifest: ManifestV2_1 = serde_json::from_str(json).unwrap();
        let digests = Translator::v2_1_layer_digests_fs_order(&manifest);
        assert_eq!(digests[0].hex(), "b".repeat(64));
        assert_eq!(digests[1].hex(), "a".repeat(64));
    }
}
