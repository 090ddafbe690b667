//! Per-worker checkpoint of pages already written.
//!
//! The checkpoint file `progress_worker_{id}.json` maps an issue key
//! (`{aid}_{date}`) to the page numbers already appended to that worker's
//! output file, as strings in completion order:
//!
//! ```json
//! {"nfp_18710101": ["1", "2", "3"]}
//! ```
//!
//! Issues whose page scan reached a terminal page are listed in
//! `completed_worker_{id}.json`, so a restart skips them without a request.
//!
//! Every mutation is flushed immediately. Only the owning worker ever writes
//! its files, so a replace-by-rename is all the atomicity needed.

use crate::error::Result;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, instrument, warn};

pub type ProgressMap = BTreeMap<String, Vec<String>>;

pub fn checkpoint_path(dir: &Path, worker_id: usize) -> PathBuf {
    dir.join(format!("progress_worker_{}.json", worker_id))
}

pub fn completed_path(dir: &Path, worker_id: usize) -> PathBuf {
    dir.join(format!("completed_worker_{}.json", worker_id))
}

async fn write_json<T: serde::Serialize>(dir: &Path, path: &Path, value: &T) -> Result<()> {
    fs::create_dir_all(dir).await?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_string(value)?).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

async fn read_completed(dir: &Path, worker_id: usize) -> Result<BTreeSet<String>> {
    match fs::read_to_string(completed_path(dir, worker_id)).await {
        Ok(raw) => Ok(serde_json::from_str(&raw)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeSet::new()),
        Err(e) => Err(e.into()),
    }
}

/// Read a worker's checkpoint; a missing file is an empty mapping.
#[instrument(level = "info", skip(dir), fields(dir = %dir.display()))]
pub async fn load_progress(dir: &Path, worker_id: usize) -> Result<ProgressMap> {
    let path = checkpoint_path(dir, worker_id);
    match fs::read_to_string(&path).await {
        Ok(raw) => {
            let map: ProgressMap = serde_json::from_str(&raw)?;
            info!(issues = map.len(), path = %path.display(), "Loaded progress");
            Ok(map)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "No progress file yet; starting fresh");
            Ok(ProgressMap::new())
        }
        Err(e) => Err(e.into()),
    }
}

/// Overwrite a worker's checkpoint with the full mapping.
pub async fn save_progress(dir: &Path, worker_id: usize, progress: &ProgressMap) -> Result<()> {
    let path = checkpoint_path(dir, worker_id);
    write_json(dir, &path, progress).await?;
    debug!(path = %path.display(), issues = progress.len(), "Saved progress");
    Ok(())
}

/// In-memory checkpoint with write-through persistence.
#[derive(Debug)]
pub struct ProgressStore {
    dir: PathBuf,
    worker_id: usize,
    entries: ProgressMap,
    completed: BTreeSet<String>,
}

impl ProgressStore {
    /// Load the checkpoint and completed set of `worker_id` from `dir`.
    ///
    /// Missing files load as empty.
    ///
    /// # Errors
    ///
    /// Returns an error if a file exists but cannot be read or parsed.
    pub async fn open(dir: &Path, worker_id: usize) -> Result<Self> {
        let entries = load_progress(dir, worker_id).await?;
        let completed = read_completed(dir, worker_id).await?;
        Ok(Self {
            dir: dir.to_path_buf(),
            worker_id,
            entries,
            completed,
        })
    }

    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    pub fn is_complete(&self, key: &str) -> bool {
        self.completed.contains(key)
    }

    /// Record that the page scan of `key` ended on a terminal page.
    pub async fn mark_complete(&mut self, key: &str) -> Result<()> {
        if self.completed.insert(key.to_string()) {
            let path = completed_path(&self.dir, self.worker_id);
            write_json(&self.dir, &path, &self.completed).await?;
        }
        Ok(())
    }

    pub fn entries(&self) -> &ProgressMap {
        &self.entries
    }

    pub fn pages(&self, key: &str) -> &[String] {
        self.entries.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn contains(&self, key: &str, page: u32) -> bool {
        let page = page.to_string();
        self.pages(key).iter().any(|p| *p == page)
    }

    /// Mark `page` of `key` as written and persist the whole mapping.
    ///
    /// # Arguments
    ///
    /// * `key` - Issue key, `{aid}_{date}`
    /// * `page` - Page number just appended to the output file
    ///
    /// # Errors
    ///
    /// Returns an error if the checkpoint cannot be rewritten. The in-memory
    /// mapping already holds the page in that case.
    pub async fn record(&mut self, key: &str, page: u32) -> Result<()> {
        if !self.contains(key, page) {
            self.entries
                .entry(key.to_string())
                .or_default()
                .push(page.to_string());
        }
        save_progress(&self.dir, self.worker_id, &self.entries).await
    }

    /// Fold in pages that exist in the output file but never reached the
    /// checkpoint. Returns how many pages were added.
    pub async fn reconcile(&mut self, derived: &ProgressMap) -> Result<usize> {
        let mut added = 0usize;
        for (key, pages) in derived {
            for page in pages {
                let known = self.entries.get(key).is_some_and(|p| p.contains(page));
                if !known {
                    self.entries.entry(key.clone()).or_default().push(page.clone());
                    added += 1;
                }
            }
        }
        if added > 0 {
            warn!(
                worker_id = self.worker_id,
                added, "Output rows missing from checkpoint; repaired progress"
            );
            save_progress(&self.dir, self.worker_id, &self.entries).await?;
        }
        Ok(added)
    }
}
