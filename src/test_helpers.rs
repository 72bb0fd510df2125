//! Shared test utilities: synthetic originals and a ready-made public root.
//!
//! # Usage
//!
//! ```rust
//! use crate::test_helpers::*;
//!
//! let site = TestSite::new();
//! site.add_jpeg("images/photo.jpg", 160, 120);
//! assert!(site.public().join("images/photo.jpg").exists());
//! ```

use std::path::{Path, PathBuf};
use tempfile::TempDir;

// =========================================================================
// Synthetic images
// =========================================================================

/// Write a gradient JPEG of the given size, creating parent directories.
pub fn write_test_jpeg(path: &Path, width: u32, height: u32) {
    ensure_parent(path);
    let img = image::RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x % 256) as u8, (y % 256) as u8, 128])
    });
    img.save(path).unwrap();
}

/// Write a PNG with a horizontal alpha ramp.
pub fn write_test_png_with_alpha(path: &Path, width: u32, height: u32) {
    ensure_parent(path);
    let img = image::RgbaImage::from_fn(width, height, |x, y| {
        let alpha = ((x * 255) / width.max(1)) as u8;
        image::Rgba([200, (y % 256) as u8, 40, alpha])
    });
    img.save(path).unwrap();
}

fn ensure_parent(path: &Path) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
}

// =========================================================================
// Public root fixture
// =========================================================================

/// A temp directory laid out as `public/` with `public/processed/` beneath it.
pub struct TestSite {
    pub tmp: TempDir,
}

impl TestSite {
    pub fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("public/processed")).unwrap();
        Self { tmp }
    }

    pub fn public(&self) -> PathBuf {
        self.tmp.path().join("public")
    }

    pub fn cache(&self) -> PathBuf {
        self.public().join("processed")
    }

    pub fn add_jpeg(&self, relative: &str, width: u32, height: u32) -> PathBuf {
        let path = self.public().join(relative);
        write_test_jpeg(&path, width, height);
        path
    }

    /// Every file under the cache root, relative and sorted.
    pub fn cached_files(&self) -> Vec<String> {
        let cache = self.cache();
        let mut files: Vec<String> = walkdir::WalkDir::new(&cache)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| {
                e.path()
                    .strip_prefix(&cache)
                    .unwrap()
                    .to_string_lossy()
                    .replace('\\', "/")
            })
            .collect();
        files.sort();
        files
    }
}
