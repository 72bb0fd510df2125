//! CLI output formatting.
//!
//! Every command has a pure `format_*` function returning lines, and a thin
//! `print_*` wrapper. Tests exercise the `format_*` side.
//!
//! # Output Format
//!
//! ## Render
//!
//! ```text
//! /processed/images/photo.w800m0q100.jpg (generated)
//!     Source: images/photo.jpg
//!     jpg: public/processed/images/photo.w800m0q100.jpg (84.21 KB)
//!     avif: public/processed/images/photo.w800m0q100.jpg.avif (31.02 KB) ← served
//!     webp: public/processed/images/photo.w800m0q100.jpg.webp (40.77 KB)
//! ```
//!
//! ## Stats / Purge
//!
//! `stats --json` prints the raw counts as a JSON object instead.
//!
//! ```text
//! Cache public/processed
//!     Files: 1204
//!     Size: 312.48 MB
//! ```

use crate::imaging::Format;
use crate::processor::Served;
use crate::request::VariantRequest;
use crate::store::{CacheStats, human_bytes};
use std::path::{Path, PathBuf};

const INDENT: &str = "    ";

pub fn format_render_output(
    request: &VariantRequest,
    served: &Served,
    artifacts: &[(Format, PathBuf, u64)],
) -> Vec<String> {
    let status = if served.generated { "generated" } else { "cached" };
    let mut lines = vec![
        format!("{} ({status})", request.url_path()),
        format!("{INDENT}Source: {}", request.original_path()),
    ];
    for (format, path, len) in artifacts {
        let marker = if *path == served.path { " ← served" } else { "" };
        lines.push(format!(
            "{INDENT}{format}: {} ({}){marker}",
            path.display(),
            human_bytes(*len)
        ));
    }
    lines
}

pub fn print_render_output(
    request: &VariantRequest,
    served: &Served,
    artifacts: &[(Format, PathBuf, u64)],
) {
    for line in format_render_output(request, served, artifacts) {
        println!("{line}");
    }
}

pub fn format_stats_output(root: &Path, stats: &CacheStats) -> Vec<String> {
    vec![
        format!("Cache {}", root.display()),
        format!("{INDENT}Files: {}", stats.files),
        format!("{INDENT}Size: {}", stats.human_size()),
    ]
}

pub fn print_stats_output(root: &Path, stats: &CacheStats) {
    for line in format_stats_output(root, stats) {
        println!("{line}");
    }
}

/// Stats as a JSON object, for scripts.
pub fn format_stats_json(stats: &CacheStats) -> serde_json::Result<String> {
    serde_json::to_string_pretty(stats)
}

pub fn format_purge_output(root: &Path, removed: &CacheStats) -> Vec<String> {
    vec![
        format!("Purged {}", root.display()),
        format!(
            "{INDENT}Removed {} {} ({})",
            removed.files,
            if removed.files == 1 { "file" } else { "files" },
            removed.human_size()
        ),
    ]
}

pub fn print_purge_output(root: &Path, removed: &CacheStats) {
    for line in format_purge_output(root, removed) {
        println!("{line}");
    }
}
