//! Merge every worker output file into one master file.
//!
//! Stateless and idempotent: rerunning after more scraping simply rebuilds the
//! master file from whatever worker files exist.

use super::csv::{read_records, write_records};
use crate::error::{HarvestError, Result};
use crate::models::PageRecord;
use std::path::{Path, PathBuf};
use tracing::{info, instrument};

fn is_worker_output(name: &str) -> bool {
    name.starts_with("output_worker_") && name.ends_with(".csv")
}

/// Worker output files in `dir`, sorted by file name.
pub fn worker_output_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if is_worker_output(&name.to_string_lossy()) && entry.file_type()?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

/// Concatenate rows and order them by `(aid, year, month, day, page)`.
pub fn merge_records(batches: Vec<Vec<PageRecord>>) -> Vec<PageRecord> {
    let mut merged: Vec<PageRecord> = batches.into_iter().flatten().collect();
    merged.sort_by(|a, b| {
        (&a.aid, a.year, a.month, a.day, a.page).cmp(&(&b.aid, b.year, b.month, b.day, b.page))
    });
    merged
}

/// Read all worker files from `input_dir` and write the sorted union to `output`.
///
/// # Returns
///
/// The number of rows written.
///
/// # Errors
///
/// Returns [`HarvestError::MissingInput`] if `input_dir` holds no worker file.
#[instrument(level = "info", skip_all, fields(input_dir = %input_dir.display(), output = %output.display()))]
pub fn merge_worker_outputs(input_dir: &Path, output: &Path) -> Result<usize> {
    info!("Looking for worker output");
    let files = worker_output_files(input_dir)?;
    if files.is_empty() {
        return Err(HarvestError::MissingInput(format!(
            "no output_worker_*.csv files in {}; run the workers first",
            input_dir.display()
        )));
    }
    info!(count = files.len(), "Found worker files");

    let mut batches = Vec::with_capacity(files.len());
    for file in &files {
        let rows: Vec<PageRecord> = read_records(file)?;
        info!(file = %file.display(), rows = rows.len(), "Loaded worker file");
        batches.push(rows);
    }

    let merged = merge_records(batches);
    write_records(output, &merged)?;
    info!(rows = merged.len(), "Merged worker output");
    Ok(merged.len())
}
