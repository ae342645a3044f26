use crate::docker::archive::open_archive;
use crate::error::{Result, UnlayerError};
use log::{debug, info, warn};
use serde::Serialize;
use std::fs;
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use tar::{Archive, Entry, EntryType};

/// What happened to the nested archive file after a successful unpack
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Cleanup {
    /// The archive was deleted
    Removed,
    /// The archive was left in place on request
    Kept,
    /// Deleting the archive failed; the unpack itself still succeeded
    Failed { error: String },
}

/// The unpacked filesystem tree of one layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtractedLayer {
    /// Directory holding the layer contents
    pub data_dir: PathBuf,
    /// Number of entries written
    pub entries: usize,
    /// Entries refused because they would land outside `data_dir`
    pub refused_entries: usize,
    pub cleanup: Cleanup,
}

/// Result of extracting one nested layer archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerExtraction {
    Extracted(ExtractedLayer),
    /// The nested archive was not on disk; nothing was unpacked
    SkippedMissing { path: PathBuf },
}

/// Unpacks a nested layer archive that is already on disk.
///
/// The contents always go to the archive path minus its extension
/// (`<dir>/layer.tar` into `<dir>/layer/`). `dest_dir` is the layer directory
/// holding the archive; it is informational and implementations must not
/// write outside it.
pub trait Extract {
    fn extract_layer(&self, layer_archive: &Path, dest_dir: &Path) -> Result<LayerExtraction>;
}

/// Unpacks `<dir>/layer.tar` into `<dir>/layer/` and deletes the archive
#[derive(Debug, Clone, Default)]
pub struct LayerExtractor {
    keep_archive: bool,
}

impl LayerExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Leave the nested archive on disk after unpacking it
    pub fn keep_archive(mut self, keep: bool) -> Self {
        self.keep_archive = keep;
        self
    }

    fn cleanup(&self, layer_archive: &Path) -> Cleanup {
        if self.keep_archive {
            return Cleanup::Kept;
        }

        match fs::remove_file(layer_archive) {
            Ok(()) => Cleanup::Removed,
            Err(source) => {
                let err = UnlayerError::Cleanup {
                    path: layer_archive.to_path_buf(),
                    source,
                };
                warn!("{}", err);
                Cleanup::Failed {
                    error: err.to_string(),
                }
            }
        }
    }
}

impl Extract for LayerExtractor {
    fn extract_layer(&self, layer_archive: &Path, dest_dir: &Path) -> Result<LayerExtraction> {
        if !layer_archive.exists() {
            warn!("{}, skipping", UnlayerError::MissingLayerFile {
                path: layer_archive.to_path_buf(),
            });
            return Ok(LayerExtraction::SkippedMissing {
                path: layer_archive.to_path_buf(),
            });
        }

        let mut archive = open_archive(layer_archive)?;

        let data_dir = layer_data_dir(layer_archive);
        fs::create_dir_all(&data_dir).map_err(|source| UnlayerError::DirectoryCreate {
            path: data_dir.clone(),
            source,
        })?;

        info!(
            "Unpacking {} into {}",
            layer_archive.display(),
            data_dir.display()
        );
        debug!("Layer directory: {}", dest_dir.display());

        let (entries, refused_entries) =
            unpack_entries(&mut archive, &data_dir).map_err(|source| UnlayerError::LayerExtract {
                path: layer_archive.to_path_buf(),
                source,
            })?;

        // Release the handle before deleting the file
        drop(archive);
        let cleanup = self.cleanup(layer_archive);

        Ok(LayerExtraction::Extracted(ExtractedLayer {
            data_dir,
            entries,
            refused_entries,
            cleanup,
        }))
    }
}

/// `.../abc123/layer.tar` becomes `.../abc123/layer`
pub fn layer_data_dir(layer_archive: &Path) -> PathBuf {
    layer_archive.with_extension("")
}

/// Unpack every entry under `dst`, returning (written, refused) counts.
///
/// Directories are unpacked last so read-only directory modes don't block
/// writing their children. Entries that would land outside `dst`, either by
/// `..` or through a symlink unpacked earlier, are refused and counted.
fn unpack_entries<R: Read>(archive: &mut Archive<R>, dst: &Path) -> io::Result<(usize, usize)> {
    let dst = dst.canonicalize().unwrap_or_else(|_| dst.to_path_buf());
    let mut written = 0;
    let mut refused = 0;
    let mut directories = Vec::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.header().entry_type() == EntryType::Directory {
            directories.push(entry);
            continue;
        }
        if unpack_entry(&mut entry, &dst)? {
            written += 1;
        } else {
            refused += 1;
        }
    }

    for mut dir in directories {
        if unpack_entry(&mut dir, &dst)? {
            written += 1;
        } else {
            refused += 1;
        }
    }

    Ok((written, refused))
}

/// Unpack one entry; `false` if it was refused
fn unpack_entry<R: Read>(entry: &mut Entry<'_, R>, dst: &Path) -> io::Result<bool> {
    if !escapes_dst(entry, dst)? && entry.unpack_in(dst)? {
        return Ok(true);
    }
    warn!("Refusing unsafe entry path: {}", entry.path()?.display());
    Ok(false)
}

/// Whether writing `entry` would follow a symlink out of `dst`.
///
/// `..` in the entry path itself is left to `unpack_in`, which refuses it.
fn escapes_dst<R: Read>(entry: &Entry<'_, R>, dst: &Path) -> io::Result<bool> {
    if let Some(path) = relative_path(&entry.path()?) {
        if let Some(parent) = path.parent() {
            if leaves_dst(dst, parent) {
                return Ok(true);
            }
        }
    }

    // A hard link source is looked up under dst the same way
    if entry.header().entry_type() == EntryType::Link {
        if let Some(target) = entry.link_name()? {
            return Ok(match relative_path(&target) {
                Some(target) => leaves_dst(dst, target.parent().unwrap_or_else(|| Path::new(""))),
                None => true,
            });
        }
    }

    Ok(false)
}

/// Walk `dir` below `dst` and check every existing component resolves inside `dst`
fn leaves_dst(dst: &Path, dir: &Path) -> bool {
    let mut current = dst.to_path_buf();
    for part in dir.components() {
        current.push(part);
        if fs::symlink_metadata(&current).is_err() {
            // Not created yet, so nothing further down can be a link
            return false;
        }
        match current.canonicalize() {
            Ok(resolved) if resolved.starts_with(dst) => {}
            _ => return true,
        }
    }
    false
}

/// Entry path with root and `.` dropped; `None` if it contains `..`
fn relative_path(path: &Path) -> Option<PathBuf> {
    let mut relative = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(..) | Component::RootDir | Component::CurDir => {}
            Component::ParentDir => return None,
            Component::Normal(part) => relative.push(part),
        }
    }
    Some(relative)
}
