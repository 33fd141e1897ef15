//! The in-memory data model shared by every component: ports, credentials,
//! file entries destined for a layer, and the `Image` an entire pipeline run
//! assembles before it is translated to a manifest by
//! [`crate::manifest::translator`].

use crate::digest::{BlobDescriptor, Sha256Digest};
use crate::error::{BuildError, Result};
use std::collections::{BTreeMap, HashSet};
use std::time::{Duration, SystemTime};

/// A network protocol for an exposed container port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        })
    }
}

/// `(number in [1, 65535], protocol)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Port {
    pub number: u16,
    pub protocol: Protocol,
}

impl Port {
    pub fn new(number: u16, protocol: Protocol) -> Result<Self> {
        if number == 0 {
            return Err(BuildError::Validation(
                "port number must be in [1, 65535]".to_string(),
            ));
        }
        Ok(Self { number, protocol })
    }

    /// Parses `"80"`, `"80/udp"`, or a range `"80-82/udp"` into the set of
    /// ports it expands to. Ranges are inclusive; `"82-80"` (descending) is
    /// an error, as is `"0"` or anything above `65535`.
    pub fn parse_spec(spec: &str) -> Result<Vec<Port>> {
        let (range_part, proto_part) = match spec.split_once('/') {
            Some((range, proto)) => (range, proto),
            None => (spec, "tcp"),
        };

        let protocol = match proto_part.to_ascii_lowercase().as_str() {
            "tcp" => Protocol::Tcp,
            "udp" => Protocol::Udp,
            other => {
                return Err(BuildError::Validation(format!(
                    "unknown port protocol {other:?}"
                )))
            }
        };

        let (start, end) = match range_part.split_once('-') {
            Some((a, b)) => (parse_port_number(a)?, parse_port_number(b)?),
            None => {
                let n = parse_port_number(range_part)?;
                (n, n)
            }
        };

        if start > end {
            return Err(BuildError::Validation(format!(
                "port range {start}-{end} is descending"
            )));
        }

        (start..=end)
            .map(|n| Port::new(n, protocol))
            .collect::<Result<Vec<_>>>()
    }
}

fn parse_port_number(s: &str) -> Result<u16> {
    let n: u32 = s
        .parse()
        .map_err(|_| BuildError::Validation(format!("invalid port number {s:?}")))?;
    if n == 0 || n > 65535 {
        return Err(BuildError::Validation(format!(
            "port number {n} out of range [1, 65535]"
        )));
    }
    Ok(n as u16)
}

impl std::fmt::Display for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.number, self.protocol)
    }
}

/// A username/password pair. The sentinel username `<token>` marks the
/// password as an OAuth refresh token rather than a literal password,
/// which changes how the push flow exchanges it at the token endpoint.
#[derive(Clone)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

impl Credential {
    pub const REFRESH_TOKEN_USERNAME: &'static str = "<token>";

    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn is_refresh_token(&self) -> bool {
        self.username == Self::REFRESH_TOKEN_USERNAME
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScheme {
    Basic,
    Bearer,
}

/// An immutable, ready-to-attach `Authorization` header value.
#[derive(Clone)]
pub struct Authorization {
    pub scheme: AuthScheme,
    token_text: String,
}

impl Authorization {
    pub fn basic(username: &str, password: &str) -> Self {
        use base64::Engine;
        let encoded =
            base64::engine::general_purpose::STANDARD.encode(format!("{username}:{password}"));
        Self {
            scheme: AuthScheme::Basic,
            token_text: encoded,
        }
    }

    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            scheme: AuthScheme::Bearer,
            token_text: token.into(),
        }
    }

    pub fn header_value(&self) -> String {
        match self.scheme {
            AuthScheme::Basic => format!("Basic {}", self.token_text),
            AuthScheme::Bearer => format!("Bearer {}", self.token_text),
        }
    }
}

impl std::fmt::Debug for Authorization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authorization")
            .field("scheme", &self.scheme)
            .field("token_text", &"<redacted>")
            .finish()
    }
}

/// A source file destined for a position in a built layer's tar stream.
///
/// `modification_time` precedence: an explicit override always wins;
/// absent an override, the source file's own mtime is used; absent both,
/// entries default to the Unix epoch plus one second (the oldest
/// timestamp most tar/gzip readers accept without treating it as
/// "unset").
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub source_path: std::path::PathBuf,
    pub container_path: String,
    pub permissions: u32,
    pub modification_time: SystemTime,
    pub owner: u32,
    pub group: u32,
    pub is_directory: bool,
}

/// The fixed timestamp layer builders default to when no mtime is known,
/// chosen for reproducibility.
pub const REPRODUCIBLE_EPOCH: Duration = Duration::from_secs(1);

impl FileEntry {
    /// Builds an entry for a real file, resolving mtime precedence as
    /// `override > filesystem mtime > REPRODUCIBLE_EPOCH`.
    pub fn from_file(
        source_path: impl Into<std::path::PathBuf>,
        container_path: impl Into<String>,
        permissions: u32,
        mtime_override: Option<SystemTime>,
    ) -> Result<Self> {
        let source_path = source_path.into();
        let modification_time = match mtime_override {
            Some(t) => t,
            None => std::fs::metadata(&source_path)
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH + REPRODUCIBLE_EPOCH),
        };

        Ok(Self {
            source_path,
            container_path: normalize_container_path(&container_path.into())?,
            permissions,
            modification_time,
            owner: 0,
            group: 0,
            is_directory: false,
        })
    }

    pub fn directory(container_path: impl Into<String>, permissions: u32) -> Result<Self> {
        Ok(Self {
            source_path: std::path::PathBuf::new(),
            container_path: normalize_container_path(&container_path.into())?,
            permissions,
            modification_time: SystemTime::UNIX_EPOCH + REPRODUCIBLE_EPOCH,
            owner: 0,
            group: 0,
            is_directory: true,
        })
    }
}

fn normalize_container_path(path: &str) -> Result<String> {
    if !path.starts_with('/') {
        return Err(BuildError::Validation(format!(
            "container path {path:?} must be absolute"
        )));
    }
    Ok(path.to_string())
}

/// Selects one entry out of a manifest list / OCI image index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    pub os: String,
    pub architecture: String,
    pub variant: Option<String>,
}

impl Default for Platform {
    fn default() -> Self {
        Self {
            os: "linux".to_string(),
            architecture: "amd64".to_string(),
            variant: None,
        }
    }
}

impl Platform {
    pub fn matches(&self, os: &str, architecture: &str, variant: Option<&str>) -> bool {
        self.os == os
            && self.architecture == architecture
            && (self.variant.is_none() || self.variant.as_deref() == variant)
    }
}

/// The per-layer rebuild key metadata stored alongside application layers
/// in the cache. Never shipped to a registry; purely a rebuild/selector
/// input.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CachedLayerMetadata {
    pub kind: String,
    pub source_paths: Vec<String>,
    pub last_modified: i64,
}

/// A tagged variant over the four states a layer can be in.
#[derive(Clone)]
pub enum Layer {
    /// Freshly built; not yet written to the cache.
    Unwritten {
        compressed: std::sync::Arc<dyn crate::digest::Blob>,
        uncompressed: std::sync::Arc<dyn crate::digest::Blob>,
    },
    /// Fully usable: bytes live in the cache.
    Cached {
        compressed_path: std::path::PathBuf,
        descriptor: BlobDescriptor,
        diff_id: Sha256Digest,
    },
    /// Known to exist on a remote registry; no local bytes.
    Reference {
        descriptor: BlobDescriptor,
        diff_id: Sha256Digest,
    },
    /// From a v2.1 manifest: descriptor known, diff-id not yet recovered.
    ReferenceNoDiffId { descriptor: BlobDescriptor },
}

impl Layer {
    pub fn variant_name(&self) -> &'static str {
        match self {
            Layer::Unwritten { .. } => "Unwritten",
            Layer::Cached { .. } => "Cached",
            Layer::Reference { .. } => "Reference",
            Layer::ReferenceNoDiffId { .. } => "ReferenceNoDiffId",
        }
    }

    /// The compressed blob descriptor — available on every variant except
    /// `Unwritten`, which hasn't been hashed yet.
    pub fn descriptor(&self) -> Result<&BlobDescriptor> {
        match self {
            Layer::Cached { descriptor, .. }
            | Layer::Reference { descriptor, .. }
            | Layer::ReferenceNoDiffId { descriptor } => Ok(descriptor),
            Layer::Unwritten { .. } => Err(BuildError::LayerPropertyNotFound {
                variant: "Unwritten",
                property: "descriptor",
            }),
        }
    }

    pub fn diff_id(&self) -> Result<&Sha256Digest> {
        match self {
            Layer::Cached { diff_id, .. } | Layer::Reference { diff_id, .. } => Ok(diff_id),
            Layer::ReferenceNoDiffId { .. } => Err(BuildError::LayerPropertyNotFound {
                variant: "ReferenceNoDiffId",
                property: "diff_id",
            }),
            Layer::Unwritten { .. } => Err(BuildError::LayerPropertyNotFound {
                variant: "Unwritten",
                property: "diff_id",
            }),
        }
    }
}

/// An append-only, insertion-ordered set of layers that rejects duplicate
/// digests — order is the container filesystem composition order.
#[derive(Clone, Default)]
pub struct ImageLayers {
    layers: Vec<Layer>,
    seen_digests: HashSet<Sha256Digest>,
}

impl ImageLayers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a layer whose descriptor is already known (`Cached`,
    /// `Reference`, `ReferenceNoDiffId`). Rejects a digest already present.
    pub fn push(&mut self, layer: Layer) -> Result<()> {
        if let Ok(descriptor) = layer.descriptor() {
            if !self.seen_digests.insert(descriptor.digest.clone()) {
                return Err(BuildError::DuplicateLayer(descriptor.digest.to_string()));
            }
        }
        self.layers.push(layer);
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Layer> {
        self.layers.iter()
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

/// The full in-memory description of the image being built, assembled by
/// the pipeline's driver step and handed to [`crate::manifest::translator`]
/// once every layer is final.
#[derive(Clone)]
pub struct Image {
    pub layers: ImageLayers,
    pub environment: BTreeMap<String, String>,
    pub entrypoint: Vec<String>,
    pub cmd: Vec<String>,
    pub exposed_ports: HashSet<Port>,
    pub labels: BTreeMap<String, String>,
    pub user: Option<String>,
    pub working_dir: Option<String>,
    pub creation_time: SystemTime,
}

impl Default for Image {
    fn default() -> Self {
        Self {
            layers: ImageLayers::new(),
            environment: BTreeMap::new(),
            entrypoint: Vec::new(),
            cmd: Vec::new(),
            exposed_ports: HashSet::new(),
            labels: BTreeMap::new(),
            user: None,
            working_dir: None,
            creation_time: SystemTime::UNIX_EPOCH,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_spec_single() {
        let ports = Port::parse_spec("80").unwrap();
        assert_eq!(ports, vec![Port::new(80, Protocol::Tcp).unwrap()]);
    }

    #[test]
    fn port_spec_range_udp() {
        let ports = Port::parse_spec("80-82/udp").unwrap();
        assert_eq!(
            ports,
            vec![
                Port::new(80, Protocol::Udp).unwrap(),
                Port::new(81, Protocol::Udp).unwrap(),
                Port::new(82, Protocol::Udp).unwrap(),
            ]
        );
    }

    #[test]
    fn port_spec_descending_range_errors() {
        assert!(Port::parse_spec("82-80").is_err());
    }

    #[test]
    fn port_spec_out_of_bounds_errors() {
        assert!(Port::parse_spec("0").is_err());
        assert!(Port::parse_spec("65536").is_err());
    }

    #[test]
    fn image_layers_rejects_duplicate_digest() {
        let mut layers = ImageLayers::new();
        let digest = Sha256Digest::of_bytes(b"x");
        let descriptor = BlobDescriptor::new(digest.clone(), 1);
        layers
            .push(Layer::Reference {
                descriptor: descriptor.clone(),
                diff_id: digest.clone(),
            })
            .unwrap();
        let err = layers
            .push(Layer::Reference {
                descriptor,
                diff_id: digest,
            })
            .unwrap_err();
        assert!(matches!(err, BuildError::DuplicateLayer(_)));
    }
}
