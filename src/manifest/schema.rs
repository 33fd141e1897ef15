//! On-wire JSON shapes for every manifest schema this crate reads or
//! writes. Kept separate from [`super::translator`] so the wire format and
//! the in-memory `Image` mapping can evolve independently.

use crate::digest::Sha256Digest;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A `{mediaType, size, digest}` content descriptor, shared by the config
/// and every layer entry in a v2.2/OCI manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentDescriptor {
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub size: i64,
    pub digest: Sha256Digest,
}

/// `{schemaVersion:2, mediaType, config, layers}` — identical shape for
/// Docker v2.2 and the OCI image manifest; only media types differ.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestV2 {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub config: ContentDescriptor,
    pub layers: Vec<ContentDescriptor>,
}

/// A single platform-scoped entry in a manifest list / OCI image index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub size: i64,
    pub digest: Sha256Digest,
    pub platform: IndexPlatform,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexPlatform {
    pub architecture: String,
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

/// `{schemaVersion:2, mediaType, manifests:[...]}` — Docker manifest list
/// and OCI image index share this shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestIndex {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub manifests: Vec<IndexEntry>,
}

/// Legacy v2.1 manifest, read-only. `fs_layers` is stored top-to-bottom in
/// the wire format (the base layer last); callers must reverse it to get
/// filesystem composition order.
#[derive(Debug, Clone, Deserialize)]
pub struct ManifestV2_1 {
    pub name: String,
    pub tag: String,
    #[serde(rename = "fsLayers")]
    pub fs_layers: Vec<FsLayer>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FsLayer {
    #[serde(rename = "blobSum")]
    pub blob_sum: Sha256Digest,
}

/// The container config JSON pushed alongside the manifest.
/// Field order matches serialization order; combined with
/// `serde_json`'s `preserve_order` feature this keeps config digests
/// reproducible for identical inputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    pub architecture: String,
    pub os: String,
    pub config: ContainerConfigFields,
    pub rootfs: RootFs,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerConfigFields {
    #[serde(rename = "Env", skip_serializing_if = "Vec::is_empty", default)]
    pub env: Vec<String>,
    #[serde(rename = "Entrypoint", skip_serializing_if = "Vec::is_empty", default)]
    pub entrypoint: Vec<String>,
    #[serde(rename = "Cmd", skip_serializing_if = "Vec::is_empty", default)]
    pub cmd: Vec<String>,
    #[serde(rename = "ExposedPorts", skip_serializing_if = "BTreeMap::is_empty", default)]
    pub exposed_ports: BTreeMap<String, EmptyObject>,
    #[serde(rename = "Labels", skip_serializing_if = "BTreeMap::is_empty", default)]
    pub labels: BTreeMap<String, String>,
    #[serde(rename = "User", skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(rename = "WorkingDir", skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
}

/// Serializes as `{}` — Docker's config schema represents set membership
/// (exposed ports, volumes) as an object whose keys are the set elements
/// and whose values are always an empty object.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmptyObject {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootFs {
    #[serde(rename = "type")]
    pub kind: String,
    pub diff_ids: Vec<Sha256Digest>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    pub created_by: String,
    #[serde(skip_serializing_if = "Option::is_none", rename = "empty_layer")]
    pub empty_layer: Option<bool>,
}
