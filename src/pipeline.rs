//! The concrete build DAG: wires the registry client, cache, layer
//! builder, and manifest translator into the shape
//!
//! ```text
//!                  AuthPull ──┐
//!                             ▼
//!                         PullManifest
//!                             │
//!                    ┌────────┴─────────┐
//!               (per base layer)        │
//!          PullAndCacheLayer[i]     BuildAndCacheAppLayer[j]
//!                    │                  │
//!              (collect base)      (collect app)
//!                    │                  │
//!                    └────────┬─────────┘
//!                             ▼
//!             BuildAndPushContainerConfig ──┐
//!                                           │
//!                 AuthPush ─────┐           │
//!                               ▼           ▼
//!                    PushLayer[k] ×N   (config digest)
//!                               │           │
//!                               └─────┬─────┘
//!                                     ▼
//!                                PushManifest
//! ```

use crate::cache::Cache;
use crate::config::{BuildConfig, LayerSpec, Sink};
use crate::dag::{when_all, DagContext};
use crate::digest::{Blob, BlobDescriptor, Sha256Digest};
use crate::error::{BuildError, Result};
use crate::layer::tar::DefaultDirMode;
use crate::layer::TarLayerBuilder;
use crate::logging::Logger;
use crate::manifest::schema::ManifestV2_1;
use crate::manifest::{ParsedManifest, Translator};
use crate::model::{CachedLayerMetadata, FileEntry, Image, Layer};
use crate::progress::{Allocation, ProgressHandler};
use crate::reference::ImageReference;
use crate::registry::{CredentialChain, PushOutcome, RegistryClient, RegistryClientConfig};
use crate::tarball;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

/// The outcome of a completed pipeline run.
#[derive(Debug, Clone)]
pub struct BuildResult {
    pub image_reference: ImageReference,
    pub manifest_digest: Sha256Digest,
}

pub struct Pipeline {
    config: BuildConfig,
    cache: Arc<Cache>,
    logger: Logger,
    dag: DagContext,
    /// The root of this run's progress tree: every step below allocates a
    /// child under it and completes that child when it's done,
    /// so [`ProgressHandler::progress`] reflects the whole DAG's completion
    /// fraction at any point, not just one leaf.
    progress: Allocation,
}

impl Pipeline {
    pub fn new(config: BuildConfig, logger: Logger) -> Result<Self> {
        let cache = Cache::open(&config.cache.root)?.with_lock_poll_interval(config.cache.lock_poll_interval);
        Ok(Self {
            config,
            cache: Arc::new(cache),
            logger,
            dag: DagContext::new(4),
            progress: Allocation::root("build", 1),
        })
    }

    fn base_client(&self) -> Result<Arc<RegistryClient>> {
        let credentials = CredentialChain::new(
            self.config
                .credential_sources
                .iter()
                .map(clone_credential_source)
                .collect(),
        );
        let registry_config = RegistryClientConfig {
            allow_insecure_registries: self.config.allow_insecure_registries,
            ..RegistryClientConfig::default()
        };
        Ok(Arc::new(RegistryClient::new(
            self.config.base_ref.registry(),
            registry_config,
            credentials,
        )?))
    }

    fn target_client(&self, target: &ImageReference) -> Result<Arc<RegistryClient>> {
        let credentials = CredentialChain::new(
            self.config
                .credential_sources
                .iter()
                .map(clone_credential_source)
                .collect(),
        );
        let registry_config = RegistryClientConfig {
            allow_insecure_registries: self.config.allow_insecure_registries,
            ..RegistryClientConfig::default()
        };
        Ok(Arc::new(RegistryClient::new(
            target.registry(),
            registry_config,
            credentials,
        )?))
    }

    /// Runs the whole pipeline to completion: pull + cache the base image's
    /// layers, build + cache the application layers, assemble the
    /// container config and manifest, and push (or, with a tarball sink,
    /// write) the result.
    pub async fn run(&self) -> Result<BuildResult> {
        self.logger.section("Build");

        // AuthPull: a base-registry client is constructed eagerly so a
        // misconfigured credential source fails before any network call.
        let base_client = self.dag.spawn({
            let client = self.base_client()?;
            async move { Ok(client) }
        });

        // PullManifest depends on AuthPull via the captured client handle.
        let platform = self.config.platform.clone();
        let base_ref = self.config.base_ref.clone();
        let pull_manifest_progress = self.progress.child("pull-manifest", 1);
        let pull_manifest = self.dag.spawn({
            let base_client = base_client.clone();
            async move {
                let client = base_client.await?;
                if base_ref.is_scratch() {
                    pull_manifest_progress.complete();
                    return Ok(None);
                }
                let (parsed, _digest) = client
                    .pull_manifest(base_ref.repository(), base_ref.manifest_reference(), &platform)
                    .await?;
                pull_manifest_progress.complete();
                Ok(Some(parsed))
            }
        });

        // Base layers: PullAndCacheLayer[i], one step per layer, fanned out
        // once the manifest (and, for v2.2/OCI, its container config) is
        // known.
        let base_layer_specs = self.resolve_base_layer_specs(base_client.clone(), pull_manifest).await?;
        let base_repository = self.config.base_ref.repository().to_string();
        let base_layer_steps: Vec<_> = base_layer_specs
            .into_iter()
            .enumerate()
            .map(|(i, spec)| {
                let cache = self.cache.clone();
                let base_client = base_client.clone();
                let base_repository = base_repository.clone();
                let layer_progress = self.progress.child(format!("pull-layer-{i}"), 1);
                self.dag.spawn(async move {
                    let client = base_client.await?;
                    let layer = pull_and_cache_layer(&client, &cache, &base_repository, spec).await?;
                    layer_progress.complete();
                    Ok(layer)
                })
            })
            .collect();

        // Application layers: BuildAndCacheAppLayer[j], independent of the
        // base image entirely.
        let mut app_layer_steps: Vec<_> = self
            .config
            .layers
            .iter()
            .cloned()
            .map(|spec| {
                let cache = self.cache.clone();
                let layer_progress = self.progress.child(format!("build-layer-{}", spec.kind), 1);
                self.dag.spawn(async move {
                    let layer = build_and_cache_app_layer(cache, spec).await?;
                    layer_progress.complete();
                    Ok(layer)
                })
            })
            .collect();

        // extra_files: a final, ungrouped layer of individually named files
        // laid down on top of the kind-grouped application layers.
        if !self.config.extra_files.is_empty() {
            let entries = self.config.extra_files.clone();
            let cache = self.cache.clone();
            let layer_progress = self.progress.child("build-layer-extra", 1);
            app_layer_steps.push(self.dag.spawn(async move {
                let layer = build_and_cache_extra_layer(cache, entries).await?;
                layer_progress.complete();
                Ok(layer)
            }));
        }

        let (base_layers, app_layers) =
            futures::future::try_join(when_all(base_layer_steps), when_all(app_layer_steps)).await?;

        let mut image = Image {
            entrypoint: self.config.entrypoint.clone(),
            cmd: self.config.cmd.clone(),
            environment: self.config.env.clone(),
            labels: self.config.labels.clone(),
            user: self.config.user.clone(),
            working_dir: self.config.working_dir.clone(),
            creation_time: self.config.creation_time,
            exposed_ports: self.config.exposed_ports.iter().copied().collect(),
            ..Image::default()
        };
        for layer in base_layers.into_iter().chain(app_layers) {
            image.layers.push(layer)?;
        }
        self.logger.detail(&format!("assembled {} layers", image.layers.len()));

        // Build the config JSON, then (registry sink) push it: the config
        // blob must exist before the manifest referencing it is pushed.
        let config_progress = self.progress.child("config", 1);
        let container_config = Translator::build_container_config(&image, &self.config.platform)?;
        let (config_bytes, config_descriptor) = Translator::config_blob(&container_config)?;

        let result = match &self.config.sink {
            Sink::Tarball(path) => {
                let manifest = Translator::build_manifest(&image, config_descriptor, false)?;
                tarball::write_tarball(path, &image, &manifest, &config_bytes, &self.cache, &self.config.base_ref)?;
                config_progress.complete();
                let manifest_digest = Sha256Digest::of_bytes(&serde_json::to_vec(&manifest)?);
                self.logger.success(&format!("wrote tarball to {}", path.display()));
                Ok(BuildResult {
                    image_reference: self.config.base_ref.clone(),
                    manifest_digest,
                })
            }
            Sink::Registry => {
                let target = self
                    .config
                    .target_ref
                    .clone()
                    .ok_or_else(|| BuildError::Validation("target_ref is required for a registry sink".to_string()))?;

                // AuthPush
                let target_client = self.dag.spawn({
                    let client = self.target_client(&target)?;
                    async move { Ok(client) }
                });
                let target_client = target_client.await?;

                let mount_from = mount_source(&self.config.base_ref, &target);

                target_client
                    .push_blob(
                        target.repository(),
                        Arc::new(crate::digest::BytesBlob(config_bytes)),
                        &config_descriptor,
                        None,
                    )
                    .await?;
                config_progress.complete();

                // PushLayer[k] x N, each checked for existence first.
                let push_steps: Vec<_> = image
                    .layers
                    .iter()
                    .cloned()
                    .enumerate()
                    .map(|(i, layer)| {
                        let target_client = target_client.clone();
                        let target_repository = target.repository().to_string();
                        let mount_from = mount_from.clone();
                        let push_progress = self.progress.child(format!("push-layer-{i}"), 1);
                        self.dag.spawn(async move {
                            push_layer(&target_client, &target_repository, layer, mount_from.as_deref()).await?;
                            push_progress.complete();
                            Ok(())
                        })
                    })
                    .collect();
                when_all(push_steps).await?;

                let push_manifest_progress = self.progress.child("push-manifest", 1);
                let manifest = Translator::build_manifest(&image, config_descriptor, false)?;
                let manifest_digest = target_client
                    .push_manifest(target.repository(), target.manifest_reference(), &manifest)
                    .await?;
                push_manifest_progress.complete();

                self.logger.success(&format!("pushed {target} ({manifest_digest})"));
                Ok(BuildResult {
                    image_reference: target,
                    manifest_digest,
                })
            }
        };

        let handler = ProgressHandler::new(self.progress.clone());
        self.logger.detail(&format!(
            "progress {:.0}%{}",
            handler.progress() * 100.0,
            if result.is_ok() {
                String::new()
            } else {
                let unfinished = handler.unfinished_leaves();
                if unfinished.is_empty() {
                    String::new()
                } else {
                    format!(" (incomplete: {})", unfinished.join(", "))
                }
            }
        ));

        result
    }

    /// Resolves what the base-layer fan-out needs to pull: for v2.2/OCI,
    /// the container config blob is pulled first so each layer's `diff_id`
    /// is known before the per-layer steps start. For a v2.1 manifest,
    /// which carries no config with diff-ids, a subsequent step instead
    /// decompresses each pulled layer to recover its diff_id.
    async fn resolve_base_layer_specs(
        &self,
        base_client: crate::dag::Step<Arc<RegistryClient>>,
        pull_manifest: crate::dag::Step<Option<ParsedManifest>>,
    ) -> Result<Vec<BaseLayerSpec>> {
        let parsed = pull_manifest.await?;
        let parsed = match parsed {
            Some(p) => p,
            None => return Ok(Vec::new()),
        };

        match parsed {
            ParsedManifest::V2 { manifest, .. } => {
                let client = base_client.await?;
                let mut buf = Vec::new();
                client
                    .pull_blob(self.config.base_ref.repository(), &manifest.config.digest, &mut buf)
                    .await?;
                let config: crate::manifest::schema::ContainerConfig = serde_json::from_slice(&buf)?;

                if config.rootfs.diff_ids.len() != manifest.layers.len() {
                    return Err(BuildError::LayerCountMismatch {
                        config_count: config.rootfs.diff_ids.len(),
                        manifest_count: manifest.layers.len(),
                    });
                }

                Ok(manifest
                    .layers
                    .into_iter()
                    .zip(config.rootfs.diff_ids)
                    .map(|(layer, diff_id)| BaseLayerSpec {
                        descriptor: BlobDescriptor::new(layer.digest, layer.size as u64),
                        diff_id: Some(diff_id),
                    })
                    .collect())
            }
            ParsedManifest::V2_1(v1) => Ok(Self::v2_1_layer_specs(&v1)),
            ParsedManifest::Index(_) => Err(BuildError::UnknownManifestFormat(
                "nested manifest index after platform selection".to_string(),
            )),
        }
    }

    fn v2_1_layer_specs(manifest: &ManifestV2_1) -> Vec<BaseLayerSpec> {
        Translator::v2_1_layer_digests_fs_order(manifest)
            .into_iter()
            .map(|digest| BaseLayerSpec {
                descriptor: BlobDescriptor::size_unknown(digest),
                diff_id: None,
            })
            .collect()
    }
}

struct BaseLayerSpec {
    descriptor: BlobDescriptor,
    /// Known for v2.2/OCI (recovered from the container config); `None` for
    /// v2.1, recovered by [`Cache::adopt`] decompressing the pulled blob.
    diff_id: Option<Sha256Digest>,
}

async fn pull_and_cache_layer(
    client: &RegistryClient,
    cache: &Cache,
    repository: &str,
    spec: BaseLayerSpec,
) -> Result<Layer> {
    if let Some(existing) = cache.get(&spec.descriptor.digest)? {
        return Ok(existing.into_layer());
    }

    let tmp_path = cache.tmp_file();
    {
        let mut file = std::fs::File::create(&tmp_path)?;
        let mut hashing = crate::digest::HashingSink::new(&mut file);
        client.pull_blob(repository, &spec.descriptor.digest, &mut hashing).await?;
        let (_file, observed) = hashing.finish();
        RegistryClient::verify_pulled_digest(&spec.descriptor.digest, &observed.digest)?;
    }

    let cached = cache.adopt(&tmp_path, &spec.descriptor.digest, spec.diff_id)?;
    Ok(cached.into_layer())
}

async fn build_and_cache_app_layer(cache: Arc<Cache>, spec: LayerSpec) -> Result<Layer> {
    let kind = spec.kind.clone();
    tokio::task::spawn_blocking(move || {
        let entries = collect_layer_entries(&spec)?;
        cache_layer_from_entries(&cache, &kind, entries)
    })
    .await
    .map_err(|e| BuildError::Io(format!("layer build task panicked: {e}")))?
}

/// `extra_files` isn't rooted at one directory the way a [`LayerSpec`] is,
/// so there's nothing to walk — the caller-provided entries already
/// describe the whole layer. Grouped under the fixed kind `"extra"` for
/// its selector key. Still moved onto a blocking task: building the tar,
/// gzipping it, and hashing both passes is real CPU/disk work with no
/// await points of its own.
async fn build_and_cache_extra_layer(cache: Arc<Cache>, entries: Vec<FileEntry>) -> Result<Layer> {
    tokio::task::spawn_blocking(move || cache_layer_from_entries(&cache, "extra", entries))
        .await
        .map_err(|e| BuildError::Io(format!("layer build task panicked: {e}")))?
}

fn cache_layer_from_entries(cache: &Cache, kind: &str, entries: Vec<FileEntry>) -> Result<Layer> {
    let selector_key = selector_key(kind, &entries);

    if let Some(existing) = cache.get_by_selector(&selector_key)? {
        return Ok(existing.into_layer());
    }

    let last_modified = entries
        .iter()
        .map(|e| e.modification_time.duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0))
        .max()
        .unwrap_or(0);
    let source_paths = entries.iter().map(|e| e.container_path.clone()).collect();
    let metadata = CachedLayerMetadata {
        kind: kind.to_string(),
        source_paths,
        last_modified,
    };

    let builder = TarLayerBuilder::new(entries, DefaultDirMode::default());
    let compressed = builder.compressed_blob();
    let uncompressed = builder.uncompressed_blob();

    let cached = cache.put(compressed.as_ref(), uncompressed.as_ref(), Some(&selector_key), Some(metadata))?;
    Ok(cached.into_layer())
}

async fn push_layer(client: &RegistryClient, repository: &str, layer: Layer, mount_from: Option<&str>) -> Result<()> {
    let descriptor = layer.descriptor()?.clone();

    if client.check_blob(repository, &descriptor.digest).await? {
        return Ok(());
    }

    let blob: Arc<dyn Blob> = match layer {
        Layer::Unwritten { compressed, .. } => compressed,
        Layer::Cached { compressed_path, .. } => Arc::new(crate::digest::FileBlob(compressed_path)),
        Layer::Reference { .. } | Layer::ReferenceNoDiffId { .. } => {
            return Err(BuildError::Validation(format!(
                "layer {} has no local bytes to push and was not already present on the target registry",
                descriptor.digest
            )))
        }
    };

    client.push_blob(repository, blob, &descriptor, mount_from).await.map(|_: PushOutcome| ())
}

fn mount_source(base: &ImageReference, target: &ImageReference) -> Option<String> {
    (!base.is_scratch() && base.registry() == target.registry()).then(|| base.repository().to_string())
}

fn clone_credential_source(source: &crate::registry::CredentialSource) -> crate::registry::CredentialSource {
    match source {
        crate::registry::CredentialSource::Explicit(c) => crate::registry::CredentialSource::Explicit(c.clone()),
        crate::registry::CredentialSource::Helper(name) => crate::registry::CredentialSource::Helper(name.clone()),
        crate::registry::CredentialSource::DockerConfig(path) => crate::registry::CredentialSource::DockerConfig(path.clone()),
    }
}

/// Walks a layer's source tree into an ordered, deterministic
/// [`FileEntry`] list: directories first (so explicit directory entries
/// exist before their children are emitted), sorted by relative path.
fn collect_layer_entries(spec: &LayerSpec) -> Result<Vec<FileEntry>> {
    let mut relative_paths = BTreeSet::new();
    walk(&spec.source_root, &PathBuf::new(), &mut relative_paths)?;

    let prefix = spec.container_prefix.trim_end_matches('/');
    let mut entries = Vec::with_capacity(relative_paths.len());
    for relative in relative_paths {
        let absolute = spec.source_root.join(&relative);
        let container_path = format!("{prefix}/{}", relative.to_string_lossy().replace('\\', "/"));
        let metadata = std::fs::symlink_metadata(&absolute)?;
        if metadata.is_dir() {
            entries.push(FileEntry::directory(container_path, unix_mode(&metadata, 0o755))?);
        } else {
            entries.push(FileEntry::from_file(absolute, container_path, unix_mode(&metadata, 0o644), None)?);
        }
    }
    Ok(entries)
}

fn walk(root: &Path, relative: &Path, out: &mut BTreeSet<PathBuf>) -> Result<()> {
    let current = root.join(relative);
    let mut children: Vec<_> = std::fs::read_dir(&current)?.collect::<std::io::Result<Vec<_>>>()?;
    children.sort_by_key(|entry| entry.file_name());

    for entry in children {
        let child_relative = relative.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            out.insert(child_relative.clone());
            walk(root, &child_relative, out)?;
        } else {
            out.insert(child_relative);
        }
    }
    Ok(())
}

#[cfg(unix)]
fn unix_mode(metadata: &std::fs::Metadata, default: u32) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    let mode = metadata.permissions().mode() & 0o7777;
    if mode == 0 {
        default
    } else {
        mode
    }
}

#[cfg(not(unix))]
fn unix_mode(_metadata: &std::fs::Metadata, default: u32) -> u32 {
    default
}

fn selector_key(kind: &str, entries: &[FileEntry]) -> String {
    let mut key = String::from(kind);
    for entry in entries {
        let mtime = entry
            .modification_time
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        key.push(':');
        key.push_str(&entry.container_path);
        key.push('@');
        key.push_str(&mtime.to_string());
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_key_changes_when_an_entry_mtime_changes() {
        let entries_a = vec![FileEntry::from_file(
            "/dev/null",
            "/app/a",
            0o644,
            Some(UNIX_EPOCH + std::time::Duration::from_secs(1)),
        )
        .unwrap()];
        let entries_b = vec![FileEntry::from_file(
            "/dev/null",
            "/app/a",
            0o644,
            Some(UNIX_EPOCH + std::time::Duration::from_secs(2)),
        )
        .unwrap()];
        assert_ne!(selector_key("classes", &entries_a), selector_key("classes", &entries_b));
    }

    #[test]
    fn mount_source_only_applies_across_a_shared_registry() {
        let base = ImageReference::parse("myregistry.example.com/base").unwrap();
        let same_host = ImageReference::parse("myregistry.example.com/app").unwrap();
        let other_host = ImageReference::parse("otherregistry.example.com/app").unwrap();
        assert!(mount_source(&base, &same_host).is_some());
        assert!(mount_source(&base, &other_host).is_none());
    }

    #[tokio::test]
    async fn extra_files_are_cached_as_a_standalone_layer() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = Arc::new(Cache::open(tmp.path()).unwrap());
        let source = tmp.path().join("banner.txt");
        std::fs::write(&source, b"hello\n").unwrap();

        let entries = vec![FileEntry::from_file(&source, "/etc/banner.txt", 0o644, None).unwrap()];
        let layer = build_and_cache_extra_layer(cache.clone(), entries.clone()).await.unwrap();
        assert!(matches!(layer, Layer::Cached { .. }));

        // Rebuilding with the same entries hits the selector-key cache
        // rather than writing a second blob.
        let again = build_and_cache_extra_layer(cache, entries).await.unwrap();
        assert_eq!(again.descriptor().unwrap(), layer.descriptor().unwrap());
    }

    #[test]
    fn collect_layer_entries_is_sorted_and_deterministic() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("b")).unwrap();
        std::fs::write(tmp.path().join("b").join("two.txt"), b"2").unwrap();
        std::fs::write(tmp.path().join("a.txt"), b"1").unwrap();

        let spec = LayerSpec::new("app", tmp.path(), "/app");
        let entries = collect_layer_entries(&spec).unwrap();
        let paths: Vec<_> = entries.iter().map(|e| e.container_path.clone()).collect();
        assert_eq!(paths, vec!["/app/a.txt", "/app/b", "/app/b/two.txt"]);
    }
}
