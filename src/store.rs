//! On-disk variant cache.
//!
//! Every artifact lives at a path derived from its request, so identical
//! requests map to identical files and the cache deduplicates itself:
//!
//! ```text
//! <cache_root>/images/photo.w800m0q100.jpg        primary
//! <cache_root>/images/photo.w800m0q100.jpg.avif   sibling
//! <cache_root>/images/photo.w800m0q100.jpg.webp   sibling
//! ```
//!
//! There is no TTL and no eviction. Artifacts stay until [`VariantStore::purge`]
//! removes the whole tree.
//!
//! Writes go to a temp file in the target directory and are renamed into
//! place, so readers only ever see complete files. Directories are created
//! `0775` and files `0664` so a web server and a CLI user in the same group
//! can both manage the cache.

use crate::imaging::Format;
use crate::request::VariantRequest;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[cfg(unix)]
const DIR_MODE: u32 = 0o775;
#[cfg(unix)]
const FILE_MODE: u32 = 0o664;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Refusing to purge {}: not a plain cache directory", .0.display())]
    UnsafePurge(PathBuf),
}

/// File count and total size of the cache tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct CacheStats {
    pub files: u64,
    pub bytes: u64,
}

impl CacheStats {
    pub fn human_size(&self) -> String {
        human_bytes(self.bytes)
    }
}

/// Format a byte count with binary units, two decimals above bytes.
pub fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.2} {}", UNITS[unit])
}

#[derive(Debug, Clone)]
pub struct VariantStore {
    root: PathBuf,
}

impl VariantStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the artifact in the requested format.
    pub fn primary_path(&self, request: &VariantRequest) -> PathBuf {
        self.root.join(request.variant_path())
    }

    /// Path of a next-gen sibling: the primary path plus the sibling extension.
    pub fn sibling_path(&self, request: &VariantRequest, format: Format) -> PathBuf {
        let mut path = self.primary_path(request).into_os_string();
        path.push(".");
        path.push(format.extension());
        PathBuf::from(path)
    }

    /// Artifacts of `request` present on disk, primary first, with their sizes.
    pub fn artifacts(&self, request: &VariantRequest) -> Vec<(Format, PathBuf, u64)> {
        std::iter::once((request.format, self.primary_path(request)))
            .chain(
                Format::SIBLINGS
                    .into_iter()
                    .map(|f| (f, self.sibling_path(request, f))),
            )
            .filter_map(|(format, path)| {
                let len = std::fs::metadata(&path).ok()?.len();
                Some((format, path, len))
            })
            .collect()
    }

    pub fn exists(&self, path: &Path) -> bool {
        path.is_file()
    }

    pub fn read(&self, path: &Path) -> Result<Vec<u8>, StoreError> {
        Ok(std::fs::read(path)?)
    }

    /// Atomically write `bytes` to `path`, creating parent directories.
    pub fn write(&self, path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
        let parent = path
            .parent()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "artifact path has no parent"))?;
        create_dirs(parent)?;

        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.write_all(bytes)?;
        tmp.as_file().sync_all()?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tmp.as_file()
                .set_permissions(std::fs::Permissions::from_mode(FILE_MODE))?;
        }
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    /// Remove an artifact; a missing file is not an error.
    pub fn remove(&self, path: &Path) -> Result<(), StoreError> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Count files and bytes under the cache root. A missing root is empty.
    pub fn stats(&self) -> Result<CacheStats, StoreError> {
        let mut stats = CacheStats::default();
        if !self.root.exists() {
            return Ok(stats);
        }
        for entry in walkdir::WalkDir::new(&self.root) {
            let entry = entry.map_err(io::Error::from)?;
            if entry.file_type().is_file() {
                stats.files += 1;
                stats.bytes += entry.metadata().map_err(io::Error::from)?.len();
            }
        }
        Ok(stats)
    }

    /// Delete every artifact and recreate an empty root.
    ///
    /// Refuses to follow a symlinked root or to delete a filesystem root.
    /// Returns what was removed.
    pub fn purge(&self) -> Result<CacheStats, StoreError> {
        if !self.root.exists() {
            create_dirs(&self.root)?;
            return Ok(CacheStats::default());
        }

        let is_symlink = std::fs::symlink_metadata(&self.root)?
            .file_type()
            .is_symlink();
        let canonical = self.root.canonicalize()?;
        if is_symlink || !canonical.is_dir() || canonical.parent().is_none() {
            return Err(StoreError::UnsafePurge(self.root.clone()));
        }

        let removed = self.stats()?;
        std::fs::remove_dir_all(&canonical)?;
        create_dirs(&canonical)?;
        tracing::info!(root = %canonical.display(), files = removed.files, "Purged variant cache");
        Ok(removed)
    }
}

fn create_dirs(dir: &Path) -> io::Result<()> {
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(DIR_MODE);
    }
    builder.create(dir)
}
