//! Builds a reproducible tar stream from an ordered list of
//! [`FileEntry`](crate::model::FileEntry) values, then gzips it.
//!
//! Two independent [`Blob`] producers share the same entry list: one emits
//! the raw tar bytes (hashed into a layer's `diff_id`), the other gzips
//! those same bytes (hashed into the layer's on-wire `digest`). Both read
//! through the filesystem again on each write, matching [`Blob`]'s
//! "writes exactly once, callable more than once" contract used for
//! retryable uploads.

use crate::digest::{Blob, BlobDescriptor, HashingSink};
use crate::error::{BuildError, Result};
use crate::model::FileEntry;
use std::collections::BTreeSet;
use std::io::Write;
use std::sync::Arc;

/// The default `(permissions, mtime)` applied to a parent directory that
/// the builder has to synthesize because no entry in the input explicitly
/// creates it.
#[derive(Debug, Clone, Copy)]
pub struct DefaultDirMode {
    pub permissions: u32,
    pub modification_time_secs: u64,
}

impl Default for DefaultDirMode {
    fn default() -> Self {
        Self {
            permissions: 0o755,
            modification_time_secs: 1,
        }
    }
}

/// Produces the layer's bytes on demand: `compressed` and `uncompressed`
/// share the same entries and default directory mode, and are combined
/// into a [`crate::model::Layer::Unwritten`] by the pipeline step that
/// builds an application layer.
pub struct TarLayerBuilder {
    entries: Arc<Vec<FileEntry>>,
    default_dir_mode: DefaultDirMode,
}

impl TarLayerBuilder {
    pub fn new(entries: Vec<FileEntry>, default_dir_mode: DefaultDirMode) -> Self {
        Self {
            entries: Arc::new(entries),
            default_dir_mode,
        }
    }

    pub fn uncompressed_blob(&self) -> Arc<dyn Blob> {
        Arc::new(UncompressedTarBlob {
            entries: self.entries.clone(),
            default_dir_mode: self.default_dir_mode,
        })
    }

    pub fn compressed_blob(&self) -> Arc<dyn Blob> {
        Arc::new(GzipTarBlob {
            entries: self.entries.clone(),
            default_dir_mode: self.default_dir_mode,
        })
    }
}

struct UncompressedTarBlob {
    entries: Arc<Vec<FileEntry>>,
    default_dir_mode: DefaultDirMode,
}

impl Blob for UncompressedTarBlob {
    fn write_to(&self, sink: &mut dyn Write) -> Result<BlobDescriptor> {
        let mut hashing = HashingSink::new(sink);
        write_tar_stream(&self.entries, self.default_dir_mode, &mut hashing)?;
        Ok(hashing.finish().1)
    }

    fn is_retryable(&self) -> bool {
        true
    }
}

struct GzipTarBlob {
    entries: Arc<Vec<FileEntry>>,
    default_dir_mode: DefaultDirMode,
}

impl Blob for GzipTarBlob {
    fn write_to(&self, sink: &mut dyn Write) -> Result<BlobDescriptor> {
        let mut hashing = HashingSink::new(sink);
        {
            let mut encoder = flate2::write::GzEncoder::new(&mut hashing, flate2::Compression::default());
            write_tar_stream(&self.entries, self.default_dir_mode, &mut encoder)?;
            encoder.finish().map_err(BuildError::from)?;
        }
        Ok(hashing.finish().1)
    }

    fn is_retryable(&self) -> bool {
        true
    }
}

/// Emits entries in caller order, synthesizing any missing parent
/// directory shallowest-first the moment it's first needed.
fn write_tar_stream<W: Write>(
    entries: &[FileEntry],
    default_dir_mode: DefaultDirMode,
    writer: W,
) -> Result<()> {
    let mut builder = tar::Builder::new(writer);
    builder.mode(tar::HeaderMode::Deterministic);

    let mut emitted_dirs: BTreeSet<String> = BTreeSet::new();

    for entry in entries {
        ensure_parents_emitted(&mut builder, &mut emitted_dirs, &entry.container_path, default_dir_mode)?;

        if entry.is_directory {
            if emitted_dirs.insert(entry.container_path.clone()) {
                append_directory(
                    &mut builder,
                    &entry.container_path,
                    entry.permissions,
                    mtime_secs(entry),
                )?;
            }
            continue;
        }

        let mut file = std::fs::File::open(&entry.source_path).map_err(|e| {
            BuildError::Io(format!(
                "reading layer source {}: {e}",
                entry.source_path.display()
            ))
        })?;
        let metadata = file.metadata().map_err(BuildError::from)?;

        let mut header = tar::Header::new_gnu();
        header.set_mode(entry.permissions & 0o7777);
        header.set_size(metadata.len());
        header.set_mtime(mtime_secs(entry));
        header.set_uid(entry.owner as u64);
        header.set_gid(entry.group as u64);
        header.set_entry_type(tar::EntryType::Regular);
        header.set_cksum();

        builder
            .append_data(&mut header, &entry.container_path[1..], &mut file)
            .map_err(|e| {
                BuildError::Io(format!(
                    "source {} disappeared while building layer: {e}",
                    entry.source_path.display()
                ))
            })?;
    }

    builder.finish().map_err(BuildError::from)?;
    Ok(())
}

fn mtime_secs(entry: &FileEntry) -> u64 {
    entry
        .modification_time
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(1)
}

fn ensure_parents_emitted<W: Write>(
    builder: &mut tar::Builder<W>,
    emitted_dirs: &mut BTreeSet<String>,
    container_path: &str,
    default_dir_mode: DefaultDirMode,
) -> Result<()> {
    let mut parents = Vec::new();
    let mut current = container_path;
    while let Some(pos) = current.rfind('/') {
        if pos == 0 {
            break;
        }
        current = &current[..pos];
        parents.push(current.to_string());
    }
    // Shallowest-first.
    for parent in parents.into_iter().rev() {
        if emitted_dirs.insert(parent.clone()) {
            append_directory(
                builder,
                &parent,
                default_dir_mode.permissions,
                default_dir_mode.modification_time_secs,
            )?;
        }
    }
    Ok(())
}

fn append_directory<W: Write>(
    builder: &mut tar::Builder<W>,
    container_path: &str,
    permissions: u32,
    mtime_secs: u64,
) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_mode(permissions & 0o7777);
    header.set_size(0);
    header.set_mtime(mtime_secs);
    header.set_entry_type(tar::EntryType::Directory);
    header.set_cksum();

    let mut path = container_path.trim_start_matches('/').to_string();
    path.push('/');

    builder
        .append_data(&mut header, &path, std::io::empty())
        .map_err(BuildError::from)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn write_temp_file(dir: &std::path::Path, name: &str, contents: &[u8]) -> std::path::PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn synthesizes_parent_directories_shallowest_first() {
        let tmp = tempfile::tempdir().unwrap();
        let hello = write_temp_file(tmp.path(), "hello", b"hi\n");

        let entries = vec![FileEntry::from_file(&hello, "/app/bin/hello", 0o755, None).unwrap()];
        let builder = TarLayerBuilder::new(entries, DefaultDirMode::default());

        let mut buf = Vec::new();
        builder.uncompressed_blob().write_to(&mut buf).unwrap();

        let mut archive = ::tar::Archive::new(std::io::Cursor::new(buf));
        let paths: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().to_string())
            .collect();

        assert_eq!(paths, vec!["app/", "app/bin/", "app/bin/hello"]);
    }

    #[test]
    fn same_inputs_produce_same_digest() {
        let tmp = tempfile::tempdir().unwrap();
        let hello = write_temp_file(tmp.path(), "hello", b"hi\n");
        let entries = || {
            vec![FileEntry::from_file(
                &hello,
                "/app/hello",
                0o644,
                Some(std::time::SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1)),
            )
            .unwrap()]
        };

        let b1 = TarLayerBuilder::new(entries(), DefaultDirMode::default());
        let b2 = TarLayerBuilder::new(entries(), DefaultDirMode::default());

        let mut out1 = Vec::new();
        let d1 = b1.compressed_blob().write_to(&mut out1).unwrap();
        let mut out2 = Vec::new();
        let d2 = b2.compressed_blob().write_to(&mut out2).unwrap();

        assert_eq!(d1.digest, d2.digest);
    }

    #[test]
    fn compressed_blob_is_valid_gzip_of_uncompressed_tar() {
        let tmp = tempfile::tempdir().unwrap();
        let hello = write_temp_file(tmp.path(), "hello", b"hi\n");
        let entries = vec![FileEntry::from_file(&hello, "/app/hello", 0o644, None).unwrap()];
        let builder = TarLayerBuilder::new(entries, DefaultDirMode::default());

        let mut compressed = Vec::new();
        builder.compressed_blob().write_to(&mut compressed).unwrap();

        let mut decoder = flate2::read::GzDecoder::new(std::io::Cursor::new(compressed));
        let mut decompressed = Vec::new();
        decoder.read_to_end(&mut decompressed).unwrap();

        let mut uncompressed = Vec::new();
        builder.uncompressed_blob().write_to(&mut uncompressed).unwrap();

        assert_eq!(decompressed, uncompressed);
    }
}
