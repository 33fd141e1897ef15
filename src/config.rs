//! The pipeline's configuration surface: plain structs, validated totally
//! at construction rather than deep in the pipeline.

use crate::model::{FileEntry, Platform, Port};
use crate::reference::ImageReference;
use crate::registry::CredentialSource;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::SystemTime;

use crate::error::{BuildError, Result};

/// One application layer to build from a local directory tree. `kind`
/// feeds the cache's selector key (`kind ∥ ordered source paths ∥ mtimes`)
/// so distinct layer roles (e.g. `"dependencies"` vs `"classes"`) never
/// collide even if their source trees overlap.
#[derive(Debug, Clone)]
pub struct LayerSpec {
    pub kind: String,
    pub source_root: PathBuf,
    pub container_prefix: String,
}

impl LayerSpec {
    pub fn new(kind: impl Into<String>, source_root: impl Into<PathBuf>, container_prefix: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            source_root: source_root.into(),
            container_prefix: container_prefix.into(),
        }
    }
}

/// Where a completed build lands: pushed to a registry, or written as a
/// Docker-load tarball, an alternative sink for environments with no
/// registry to push to.
#[derive(Debug, Clone)]
pub enum Sink {
    Registry,
    Tarball(PathBuf),
}

/// Cache-specific knobs, split out of [`BuildConfig`] the same way
/// `RegistryClientConfig` is split out from the broader CLI config.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub root: PathBuf,
    pub lock_poll_interval: std::time::Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: default_cache_root(),
            lock_poll_interval: std::time::Duration::from_millis(50),
        }
    }
}

fn default_cache_root() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".cache")
        .join("containerize")
}

/// The single configuration surface for a pipeline run, validated totally
/// by [`BuildConfigBuilder::build`] rather than deferred into the pipeline.
pub struct BuildConfig {
    pub base_ref: ImageReference,
    pub target_ref: Option<ImageReference>,
    pub credential_sources: Vec<CredentialSource>,
    pub platform: Platform,
    pub entrypoint: Vec<String>,
    pub cmd: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub exposed_ports: Vec<Port>,
    pub user: Option<String>,
    pub working_dir: Option<String>,
    pub creation_time: SystemTime,
    pub layers: Vec<LayerSpec>,
    pub extra_files: Vec<FileEntry>,
    pub sink: Sink,
    pub allow_insecure_registries: bool,
    pub cache: CacheConfig,
}

/// Builds a [`BuildConfig`] with a builder-then-validate pattern: every
/// setter is infallible, and [`BuildConfigBuilder::build`] is the single
/// point where invariants are checked.
pub struct BuildConfigBuilder {
    base_ref: Option<ImageReference>,
    target_ref: Option<ImageReference>,
    credential_sources: Vec<CredentialSource>,
    platform: Platform,
    entrypoint: Vec<String>,
    cmd: Vec<String>,
    env: BTreeMap<String, String>,
    labels: BTreeMap<String, String>,
    exposed_ports: Vec<Port>,
    user: Option<String>,
    working_dir: Option<String>,
    creation_time: SystemTime,
    layers: Vec<LayerSpec>,
    extra_files: Vec<FileEntry>,
    sink: Sink,
    allow_insecure_registries: bool,
    cache: CacheConfig,
}

impl Default for BuildConfigBuilder {
    fn default() -> Self {
        Self {
            base_ref: None,
            target_ref: None,
            credential_sources: Vec::new(),
            platform: Platform::default(),
            entrypoint: Vec::new(),
            cmd: Vec::new(),
            env: BTreeMap::new(),
            labels: BTreeMap::new(),
            exposed_ports: Vec::new(),
            user: None,
            working_dir: None,
            creation_time: SystemTime::UNIX_EPOCH,
            layers: Vec::new(),
            extra_files: Vec::new(),
            sink: Sink::Registry,
            allow_insecure_registries: false,
            cache: CacheConfig::default(),
        }
    }
}

impl BuildConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn base_ref(mut self, reference: ImageReference) -> Self {
        self.base_ref = Some(reference);
        self
    }

    pub fn target_ref(mut self, reference: ImageReference) -> Self {
        self.target_ref = Some(reference);
        self
    }

    pub fn tarball_sink(mut self, path: PathBuf) -> Self {
        self.sink = Sink::Tarball(path);
        self
    }

    pub fn credential_source(mut self, source: CredentialSource) -> Self {
        self.credential_sources.push(source);
        self
    }

    pub fn platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    pub fn entrypoint(mut self, entrypoint: Vec<String>) -> Self {
        self.entrypoint = entrypoint;
        self
    }

    pub fn cmd(mut self, cmd: Vec<String>) -> Self {
        self.cmd = cmd;
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn exposed_port(mut self, port: Port) -> Self {
        self.exposed_ports.push(port);
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn working_dir(mut self, working_dir: impl Into<String>) -> Self {
        self.working_dir = Some(working_dir.into());
        self
    }

    pub fn creation_time(mut self, time: SystemTime) -> Self {
        self.creation_time = time;
        self
    }

    pub fn layer(mut self, layer: LayerSpec) -> Self {
        self.layers.push(layer);
        self
    }

    pub fn extra_file(mut self, file: FileEntry) -> Self {
        self.extra_files.push(file);
        self
    }

    pub fn allow_insecure_registries(mut self, allow: bool) -> Self {
        self.allow_insecure_registries = allow;
        self
    }

    pub fn cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    /// Validates and produces the final [`BuildConfig`]: a base reference is
    /// always required, and exactly one of a target registry reference or a
    /// tarball sink must be configured.
    pub fn build(self) -> Result<BuildConfig> {
        let base_ref = self
            .base_ref
            .ok_or_else(|| BuildError::Validation("base_ref is required".to_string()))?;

        if matches!(self.sink, Sink::Registry) && self.target_ref.is_none() {
            return Err(BuildError::Validation(
                "a target_ref is required unless a tarball sink is configured".to_string(),
            ));
        }

        let mut seen_kinds = std::collections::HashSet::new();
        for layer in &self.layers {
            if !seen_kinds.insert(layer.kind.clone()) {
                return Err(BuildError::Validation(format!(
                    "duplicate layer kind {:?}",
                    layer.kind
                )));
            }
        }

        Ok(BuildConfig {
            base_ref,
            target_ref: self.target_ref,
            credential_sources: self.credential_sources,
            platform: self.platform,
            entrypoint: self.entrypoint,
            cmd: self.cmd,
            env: self.env,
            labels: self.labels,
            exposed_ports: self.exposed_ports,
            user: self.user,
            working_dir: self.working_dir,
            creation_time: self.creation_time,
            layers: self.layers,
            extra_files: self.extra_files,
            sink: self.sink,
            allow_insecure_registries: self.allow_insecure_registries,
            cache: self.cache,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_base_ref_is_rejected() {
        let err = BuildConfigBuilder::new().build().unwrap_err();
        assert!(matches!(err, BuildError::Validation(_)));
    }

    #[test]
    fn missing_target_and_sink_is_rejected() {
        let base = ImageReference::parse("alpine").unwrap();
        let err = BuildConfigBuilder::new().base_ref(base).build().unwrap_err();
        assert!(matches!(err, BuildError::Validation(_)));
    }

    #[test]
    fn tarball_sink_does_not_require_target_ref() {
        let base = ImageReference::parse("alpine").unwrap();
        let config = BuildConfigBuilder::new()
            .base_ref(base)
            .tarball_sink(PathBuf::from("/tmp/out.tar"))
            .build()
            .unwrap();
        assert!(matches!(config.sink, Sink::Tarball(_)));
    }

    #[test]
    fn duplicate_layer_kinds_are_rejected() {
        let base = ImageReference::parse("alpine").unwrap();
        let target = ImageReference::parse("localhost:5000/app").unwrap();
        let err = BuildConfigBuilder::new()
            .base_ref(base)
            .target_ref(target)
            .layer(LayerSpec::new("classes", "/a", "/app"))
            .layer(LayerSpec::new("classes", "/b", "/app"))
            .build()
            .unwrap_err();
        assert!(matches!(err, BuildError::Validation(_)));
    }
}
