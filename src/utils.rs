//! Utility functions for logging, file naming and output directories.
//!
//! - String truncation for log previews of response bodies
//! - Slugs for per-newspaper file names
//! - File system validation for output directories

use crate::error::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs as stdfs;
use std::path::Path;
use tokio::fs;
use tracing::{info, instrument};

static NON_SLUG: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-z0-9]+").unwrap());

/// Truncate a string for logging purposes.
///
/// Long strings are cut at the last character boundary before `max` bytes and
/// get an ellipsis and byte count indicator appended.
///
/// # Examples
///
/// ```ignore
/// assert_eq!(truncate_for_log("short", 100), "short");
/// assert_eq!(truncate_for_log(&"a".repeat(500), 10), "aaaaaaaaaa…(+490 bytes)");
/// ```
pub fn truncate_for_log(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut cut = max;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…(+{} bytes)", &s[..cut], s.len() - cut)
}

/// File-name slug for a newspaper title.
///
/// Lowercases, turns every run of characters outside `[a-z0-9]` into a single
/// hyphen and trims hyphens from both ends. Falls back to `"paper"`.
///
/// # Examples
///
/// ```ignore
/// assert_eq!(slugify("Neckar-Bote"), "neckar-bote");
/// assert_eq!(slugify("Kölnische Zeitung"), "k-lnische-zeitung");
/// ```
pub fn slugify(title: &str) -> String {
    let lower = title.to_lowercase();
    let slug = NON_SLUG.replace_all(&lower, "-");
    let slug = slug.trim_matches('-');
    if slug.is_empty() {
        "paper".to_string()
    } else {
        slug.to_string()
    }
}

/// Ensure a directory exists and is writable.
///
/// Creates the directory if needed, then creates and immediately deletes a
/// test file.
#[instrument(level = "info", skip_all, fields(path = %path.display()))]
pub async fn ensure_writable_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).await?;
    // A small sync write using std fs has the simpler error surface.
    let check_path = path.join("..__write_check__");
    stdfs::File::create(&check_path)?;
    let _ = stdfs::remove_file(&check_path);
    info!("Output directory is writable");
    Ok(())
}

/// Ensure the parent directory of `file` is writable.
pub async fn ensure_parent_writable(file: &Path) -> Result<()> {
    match file.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => ensure_writable_dir(parent).await,
        _ => ensure_writable_dir(Path::new(".")).await,
    }
}
