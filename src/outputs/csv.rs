//! CSV files: the append-only worker output and plain table read/write.

use crate::error::{HarvestError, Result};
use crate::models::PageRecord;
use crate::progress::ProgressMap;
use crate::utils::truncate_for_log;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};

/// Columns of a worker output row: `title,aid,year,month,day,page,text`.
const PAGE_COLUMNS: usize = 7;

pub fn output_path(dir: &Path, worker_id: usize) -> PathBuf {
    dir.join(format!("output_worker_{}.csv", worker_id))
}

/// Length of the longest prefix of `bytes` that consists of complete rows.
///
/// Every row must have [`PAGE_COLUMNS`] fields. The last row must also end in
/// a newline outside of any quoted field; the writer doubles quotes inside
/// fields, so an odd quote count in the last row means it was cut mid-field.
fn complete_prefix_len(bytes: &[u8]) -> usize {
    let mut rdr = ::csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(bytes);
    let mut record = ::csv::ByteRecord::new();
    let mut last_start = None;

    loop {
        match rdr.read_byte_record(&mut record) {
            Ok(true) => {
                let start = record.position().map_or(0, |p| p.byte() as usize);
                if record.len() != PAGE_COLUMNS {
                    return start;
                }
                last_start = Some(start);
            }
            Ok(false) => break,
            Err(e) => {
                return e.position().map_or(0, |p| p.byte() as usize);
            }
        }
    }

    match last_start {
        Some(start) => {
            let tail = &bytes[start..];
            let quotes = tail.iter().filter(|b| **b == b'"').count();
            if tail.ends_with(b"\n") && quotes % 2 == 0 {
                bytes.len()
            } else {
                start
            }
        }
        None => 0,
    }
}

/// Append-only page file owned by one worker. The header is written only when
/// the file is new or empty.
#[derive(Debug, Clone)]
pub struct PageSink {
    path: PathBuf,
}

impl PageSink {
    pub fn new(dir: &Path, worker_id: usize) -> Self {
        Self {
            path: output_path(dir, worker_id),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Cut the file back to its last complete row.
    ///
    /// A crash during [`PageSink::append`] can leave a partial row at the end
    /// of the file. Such a row must neither count as a written page nor have
    /// the next row appended onto it.
    ///
    /// # Returns
    ///
    /// The number of bytes removed; `0` for a missing or intact file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or truncated.
    #[instrument(level = "info", skip_all, fields(path = %self.path.display()))]
    pub async fn repair(&self) -> Result<u64> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let keep = complete_prefix_len(&bytes);
        if keep == bytes.len() {
            return Ok(0);
        }

        let file = fs::OpenOptions::new().write(true).open(&self.path).await?;
        file.set_len(keep as u64).await?;
        file.sync_all().await?;

        let dropped = (bytes.len() - keep) as u64;
        warn!(
            kept_bytes = keep,
            dropped_bytes = dropped,
            tail = %truncate_for_log(&String::from_utf8_lossy(&bytes[keep..]), 120),
            "Removed incomplete trailing row from worker output"
        );
        Ok(dropped)
    }

    /// Append one row and flush it before returning.
    pub async fn append(&self, record: &PageRecord) -> Result<()> {
        let needs_header = match fs::metadata(&self.path).await {
            Ok(meta) => meta.len() == 0,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
            Err(e) => return Err(e.into()),
        };

        let mut wtr = ::csv::WriterBuilder::new()
            .has_headers(needs_header)
            .from_writer(Vec::new());
        wtr.serialize(record)?;
        let bytes = wtr
            .into_inner()
            .map_err(|e| HarvestError::Io(e.into_error()))?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&bytes).await?;
        file.flush().await?;
        debug!(path = %self.path.display(), aid = %record.aid, page = record.page, "Appended page row");
        Ok(())
    }
}

/// Read every row of a headed CSV file.
pub fn read_records<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let mut rdr = ::csv::Reader::from_path(path)?;
    let mut rows = Vec::new();
    for row in rdr.deserialize() {
        rows.push(row?);
    }
    Ok(rows)
}

/// Write `rows` with a header to `path`, creating parent directories.
pub fn write_records<T: Serialize>(path: &Path, rows: &[T]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut wtr = ::csv::Writer::from_path(path)?;
    for row in rows {
        wtr.serialize(row)?;
    }
    wtr.flush()?;
    Ok(())
}

/// Rebuild the issue-key to page mapping from a worker output file. A missing
/// file yields an empty mapping.
#[instrument(level = "info", skip_all, fields(path = %path.display()))]
pub fn derive_progress(path: &Path) -> Result<ProgressMap> {
    let mut map = ProgressMap::new();
    if !path.exists() {
        return Ok(map);
    }
    for record in read_records::<PageRecord>(path)? {
        let pages = map.entry(record.key()).or_default();
        let page = record.page.to_string();
        if !pages.contains(&page) {
            pages.push(page);
        }
    }
    info!(issues = map.len(), "Derived progress from output rows");
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::IssueRef;

    fn record(aid: &str, date: &str, page: u32, text: &str) -> PageRecord {
        PageRecord::for_issue(&IssueRef::new(aid, "Titel", date), page, text.to_string()).unwrap()
    }

    #[tokio::test]
    async fn test_append_writes_header_once() {
        let dir = tempfile::tempdir().unwrap();
        let sink = PageSink::new(dir.path(), 4);
        sink.append(&record("nfp", "18710101", 1, "Erste Seite")).await.unwrap();
        sink.append(&record("nfp", "18710101", 2, "Zeile, mit \"Komma\"\nund Umbruch"))
            .await
            .unwrap();

        let raw = std::fs::read_to_string(sink.path()).unwrap();
        assert!(raw.starts_with("title,aid,year,month,day,page,text\n"));
        assert_eq!(raw.matches("title,aid").count(), 1);

        let rows: Vec<PageRecord> = read_records(sink.path()).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].text, "Zeile, mit \"Komma\"\nund Umbruch");
        assert_eq!(rows[1].page, 2);
    }

    #[tokio::test]
    async fn test_derive_progress_matches_rows() {
        let dir = tempfile::tempdir().unwrap();
        let sink = PageSink::new(dir.path(), 1);
        sink.append(&record("nfp", "18710101", 1, "a")).await.unwrap();
        sink.append(&record("nfp", "18710101", 2, "b")).await.unwrap();
        sink.append(&record("wrz", "18710102", 1, "c")).await.unwrap();

        let derived = derive_progress(sink.path()).unwrap();
        assert_eq!(derived["nfp_18710101"], vec!["1", "2"]);
        assert_eq!(derived["wrz_18710102"], vec!["1"]);
    }

    fn append_raw(path: &Path, raw: &str) {
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new().append(true).open(path).unwrap();
        file.write_all(raw.as_bytes()).unwrap();
    }

    #[tokio::test]
    async fn test_repair_cuts_row_torn_inside_quoted_text() {
        let dir = tempfile::tempdir().unwrap();
        let sink = PageSink::new(dir.path(), 1);
        sink.append(&record("nfp", "18710101", 1, "Erste Seite")).await.unwrap();
        let intact = std::fs::read(sink.path()).unwrap();
        append_raw(sink.path(), "Titel,nfp,1871,1,1,2,\"Seite zw");

        assert!(sink.repair().await.unwrap() > 0);
        assert_eq!(std::fs::read(sink.path()).unwrap(), intact);
        assert_eq!(derive_progress(sink.path()).unwrap()["nfp_18710101"], vec!["1"]);

        // The next row lands on a fresh line.
        sink.append(&record("nfp", "18710101", 2, "Zweite Seite")).await.unwrap();
        let rows: Vec<PageRecord> = read_records(sink.path()).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].text, "Zweite Seite");
    }

    #[tokio::test]
    async fn test_repair_cuts_row_torn_before_text() {
        let dir = tempfile::tempdir().unwrap();
        let sink = PageSink::new(dir.path(), 1);
        sink.append(&record("nfp", "18710101", 1, "Erste Seite")).await.unwrap();
        append_raw(sink.path(), "Titel,nfp,18");

        sink.repair().await.unwrap();
        let derived = derive_progress(sink.path()).unwrap();
        assert_eq!(derived["nfp_18710101"], vec!["1"]);
    }

    #[tokio::test]
    async fn test_repair_cuts_quoted_text_torn_after_newline() {
        let dir = tempfile::tempdir().unwrap();
        let sink = PageSink::new(dir.path(), 1);
        sink.append(&record("nfp", "18710101", 1, "a")).await.unwrap();
        append_raw(sink.path(), "Titel,nfp,1871,1,1,2,\"Zeile eins\n");

        sink.repair().await.unwrap();
        assert_eq!(read_records::<PageRecord>(sink.path()).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_repair_leaves_intact_file_alone() {
        let dir = tempfile::tempdir().unwrap();
        let sink = PageSink::new(dir.path(), 1);
        assert_eq!(sink.repair().await.unwrap(), 0);

        sink.append(&record("nfp", "18710101", 1, "Zeile, mit \"Komma\"\nund Umbruch")).await.unwrap();
        sink.append(&record("nfp", "18710101", 2, "b")).await.unwrap();
        let before = std::fs::read(sink.path()).unwrap();
        assert_eq!(sink.repair().await.unwrap(), 0);
        assert_eq!(std::fs::read(sink.path()).unwrap(), before);
    }

    #[tokio::test]
    async fn test_repair_torn_header_empties_file() {
        let dir = tempfile::tempdir().unwrap();
        let sink = PageSink::new(dir.path(), 1);
        std::fs::write(sink.path(), "title,aid,ye").unwrap();

        sink.repair().await.unwrap();
        assert_eq!(std::fs::metadata(sink.path()).unwrap().len(), 0);
        sink.append(&record("nfp", "18710101", 1, "a")).await.unwrap();
        assert_eq!(read_records::<PageRecord>(sink.path()).unwrap().len(), 1);
    }

    #[test]
    fn test_derive_progress_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let derived = derive_progress(&output_path(dir.path(), 9)).unwrap();
        assert!(derived.is_empty());
    }
}
