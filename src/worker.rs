//! One worker: a static slice of the issue list, scanned sequentially.
//!
//! Worker `i` of `n` (1-based) owns every issue whose row index satisfies
//! `index % n == i - 1`. Its checkpoint and output file are named after `i`,
//! so no file is ever shared between workers.

use crate::config::HarvestConfig;
use crate::error::{HarvestError, Result};
use crate::fetcher::Fetcher;
use crate::issue::{IssueEnd, ScrapePolicy, scrape_issue};
use crate::models::IssueRef;
use crate::outputs::csv::{PageSink, derive_progress, read_records};
use crate::progress::ProgressStore;
use crate::transport::{HttpTransport, PageTransport};
use std::path::Path;
use tracing::{error, info, instrument, warn};

/// Select the issues owned by `worker_id` out of `total_workers`, keeping
/// list order.
///
/// # Errors
///
/// Returns [`HarvestError::InvalidWorker`] unless `1 <= worker_id <= total_workers`.
pub fn partition(issues: &[IssueRef], worker_id: usize, total_workers: usize) -> Result<Vec<IssueRef>> {
    if total_workers == 0 || worker_id == 0 || worker_id > total_workers {
        return Err(HarvestError::InvalidWorker {
            worker_id,
            total_workers,
        });
    }
    Ok(issues
        .iter()
        .enumerate()
        .filter(|(idx, _)| idx % total_workers == worker_id - 1)
        .map(|(_, issue)| issue.clone())
        .collect())
}

/// Summary of one worker run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub assigned: usize,
    /// Issues that yielded at least one new page in this run.
    pub completed: usize,
    pub pages_written: usize,
    pub skipped_issues: usize,
    pub access_denied: bool,
}

/// Scan `issues` in order. Stops early, without error, on access denial.
///
/// # Arguments
///
/// * `fetcher` - Page fetcher owning the transport
/// * `issues` - This worker's partition, in scan order
/// * `progress` - Checkpoint, already reconciled with `sink`
/// * `sink` - The worker's output file
/// * `policy` - Page cap and transient retry settings
///
/// # Returns
///
/// Counters for the run, with `access_denied` set when the archive blocked
/// the worker.
///
/// # Errors
///
/// Returns an error if the checkpoint or output file cannot be written.
pub async fn run_partition<T: PageTransport>(
    fetcher: &Fetcher<T>,
    issues: &[IssueRef],
    progress: &mut ProgressStore,
    sink: &PageSink,
    policy: &ScrapePolicy,
) -> Result<WorkerReport> {
    let worker_id = progress.worker_id();
    let mut report = WorkerReport {
        assigned: issues.len(),
        ..WorkerReport::default()
    };

    for issue in issues {
        let key = issue.key();
        let already = progress.pages(&key).len();
        if already > 0 {
            info!(worker_id, aid = %issue.aid, date = %issue.date, pages = already, "Already started");
        } else {
            info!(worker_id, aid = %issue.aid, date = %issue.date, "Starting issue");
        }

        match scrape_issue(fetcher, issue, progress, sink, policy).await {
            Ok(outcome) => {
                if outcome.end == IssueEnd::AlreadyComplete {
                    report.skipped_issues += 1;
                    continue;
                }
                if !outcome.new_pages.is_empty() {
                    report.completed += 1;
                    report.pages_written += outcome.new_pages.len();
                    info!(
                        worker_id,
                        aid = %issue.aid,
                        date = %issue.date,
                        pages = outcome.new_pages.len(),
                        pages_total = outcome.total_pages(),
                        completed = report.completed,
                        assigned = report.assigned,
                        "Finished issue"
                    );
                }
            }
            Err(HarvestError::AccessDenied { aid, date, page }) => {
                error!(worker_id, %aid, %date, page, "Access blocked; stopping worker");
                report.access_denied = true;
                break;
            }
            Err(HarvestError::InvalidDate(date)) => {
                warn!(worker_id, aid = %issue.aid, %date, "Skipping issue with invalid date");
            }
            Err(e) => return Err(e),
        }
    }

    info!(
        worker_id,
        completed = report.completed,
        pages = report.pages_written,
        skipped = report.skipped_issues,
        access_denied = report.access_denied,
        "Worker finished or stopped"
    );
    Ok(report)
}

/// Open a worker's checkpoint and bring it in line with the output file.
///
/// An incomplete trailing row left by a crash is cut off first, so a torn page
/// is fetched again instead of being recorded. Complete rows the checkpoint
/// missed are then folded into it.
///
/// # Arguments
///
/// * `backup_dir` - Directory holding the worker's checkpoint and output file
/// * `worker_id` - 1-based worker id
/// * `sink` - The worker's output file
///
/// # Errors
///
/// Returns an error if either file cannot be read, repaired or rewritten.
pub async fn open_progress(backup_dir: &Path, worker_id: usize, sink: &PageSink) -> Result<ProgressStore> {
    let mut progress = ProgressStore::open(backup_dir, worker_id).await?;
    sink.repair().await?;
    let derived = derive_progress(sink.path())?;
    progress.reconcile(&derived).await?;
    Ok(progress)
}

/// Entry point of a worker process: read the issue list, take this worker's
/// partition and scan it over HTTP.
#[instrument(level = "info", skip(config))]
pub async fn run_worker(config: &HarvestConfig, worker_id: usize, total_workers: usize) -> Result<WorkerReport> {
    let issues_csv = &config.paths.issues_csv;
    if !issues_csv.exists() {
        return Err(HarvestError::MissingInput(format!(
            "issue list {} not found; run anno-select first",
            issues_csv.display()
        )));
    }
    let issues: Vec<IssueRef> = read_records(issues_csv)?;
    let mine = partition(&issues, worker_id, total_workers)?;
    info!(total = issues.len(), assigned = mine.len(), "Partition computed");

    let backup_dir = &config.paths.backup_dir;
    tokio::fs::create_dir_all(backup_dir).await?;
    let sink = PageSink::new(backup_dir, worker_id);
    let mut progress = open_progress(backup_dir, worker_id, &sink).await?;

    let fetcher = Fetcher::new(HttpTransport::from_config(&config.anno)?, &config.anno);
    let policy = ScrapePolicy::from_config(&config.anno);
    run_partition(&fetcher, &mine, &mut progress, &sink, &policy).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AnnoConfig;
    use crate::fetcher::page_url;
    use crate::models::PageRecord;
    use crate::outputs::csv::output_path;
    use crate::transport::testing::ScriptedTransport;
    use std::collections::HashSet;

    const BASE: &str = "http://anno.test";

    fn issues(n: usize) -> Vec<IssueRef> {
        (0..n)
            .map(|i| IssueRef::new("nfp", "Neue Freie Presse", &format!("187101{:02}", i + 1)))
            .collect()
    }

    fn config() -> AnnoConfig {
        AnnoConfig {
            base_url: BASE.to_string(),
            politeness_jitter_ms: 0,
            retry_base_delay_ms: 1,
            ..AnnoConfig::default()
        }
    }

    /// Every issue has one content page followed by a placeholder.
    fn one_page_issues(list: &[IssueRef], mut t: ScriptedTransport) -> ScriptedTransport {
        for issue in list {
            t = t
                .respond(
                    &page_url(BASE, &issue.aid, &issue.date, 1),
                    200,
                    &format!("[ x - {} - Seite 1 ] Inhalt {}", issue.date, issue.date),
                )
                .respond(&page_url(BASE, &issue.aid, &issue.date, 2), 200, "[ ]");
        }
        t
    }

    #[test]
    fn test_partition_is_disjoint_and_exhaustive() {
        let list = issues(23);
        for total in 1..=7 {
            let mut seen = HashSet::new();
            let mut count = 0;
            for id in 1..=total {
                for issue in partition(&list, id, total).unwrap() {
                    assert!(seen.insert(issue.key()), "issue assigned twice");
                    count += 1;
                }
            }
            assert_eq!(count, list.len());
        }
    }

    #[test]
    fn test_partition_keeps_order() {
        let list = issues(7);
        let keys: Vec<String> = partition(&list, 2, 3).unwrap().iter().map(|i| i.date.clone()).collect();
        assert_eq!(keys, vec!["18710102", "18710105"]);
    }

    #[test]
    fn test_partition_rejects_bad_ids() {
        let list = issues(3);
        assert!(partition(&list, 0, 3).is_err());
        assert!(partition(&list, 4, 3).is_err());
        assert!(partition(&list, 1, 0).is_err());
    }

    #[tokio::test]
    async fn test_access_denied_stops_only_that_worker() {
        let dir = tempfile::tempdir().unwrap();
        let list = issues(4);
        let cfg = config();
        let policy = ScrapePolicy::from_config(&cfg);

        // Worker 1 gets 403 on its first issue.
        let mine = partition(&list, 1, 2).unwrap();
        let denied = ScriptedTransport::new().respond(&page_url(BASE, "nfp", &mine[0].date, 1), 403, "");
        let fetcher_one = Fetcher::new(one_page_issues(&mine[1..], denied), &cfg);
        let sink_one = PageSink::new(dir.path(), 1);
        let mut progress_one = open_progress(dir.path(), 1, &sink_one).await.unwrap();
        let report_one = run_partition(&fetcher_one, &mine, &mut progress_one, &sink_one, &policy)
            .await
            .unwrap();
        assert!(report_one.access_denied);
        assert_eq!(report_one.completed, 0);
        assert_eq!(fetcher_one.transport().call_count(), 1);

        // Worker 2 is unaffected.
        let theirs = partition(&list, 2, 2).unwrap();
        let fetcher_two = Fetcher::new(one_page_issues(&theirs, ScriptedTransport::new()), &cfg);
        let sink_two = PageSink::new(dir.path(), 2);
        let mut progress_two = open_progress(dir.path(), 2, &sink_two).await.unwrap();
        let report_two = run_partition(&fetcher_two, &theirs, &mut progress_two, &sink_two, &policy)
            .await
            .unwrap();
        assert!(!report_two.access_denied);
        assert_eq!(report_two.completed, 2);
        assert_eq!(progress_two.entries().len(), 2);
        assert!(progress_one.entries().is_empty());
        assert!(!output_path(dir.path(), 1).exists());
    }

    #[tokio::test]
    async fn test_crash_window_row_is_not_refetched() {
        let dir = tempfile::tempdir().unwrap();
        let list = issues(1);
        let cfg = config();

        // Output row written, checkpoint never updated.
        let sink = PageSink::new(dir.path(), 1);
        let row = PageRecord::for_issue(&list[0], 1, "Inhalt".to_string()).unwrap();
        sink.append(&row).await.unwrap();

        let mut progress = open_progress(dir.path(), 1, &sink).await.unwrap();
        assert!(progress.contains(&list[0].key(), 1));

        let fetcher = Fetcher::new(one_page_issues(&list, ScriptedTransport::new()), &cfg);
        let report = run_partition(&fetcher, &list, &mut progress, &sink, &ScrapePolicy::from_config(&cfg))
            .await
            .unwrap();
        assert_eq!(report.pages_written, 0);
        assert_eq!(fetcher.transport().calls(), vec![page_url(BASE, "nfp", &list[0].date, 2)]);
        let rows: Vec<PageRecord> = read_records(sink.path()).unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_torn_row_is_refetched_not_recorded() {
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();
        let list = vec![
            IssueRef::new("nfp", "Neue Freie Presse", "18710101"),
        ];
        let cfg = config();
        let sink = PageSink::new(dir.path(), 1);
        let row = PageRecord::for_issue(&list[0], 1, "Seite eins".to_string()).unwrap();
        sink.append(&row).await.unwrap();
        let mut file = std::fs::OpenOptions::new().append(true).open(sink.path()).unwrap();
        file.write_all(b"Neue Freie Presse,nfp,1871,1,1,2,\"Seite zw").unwrap();
        drop(file);

        let mut progress = open_progress(dir.path(), 1, &sink).await.unwrap();
        assert_eq!(progress.pages(&list[0].key()), ["1".to_string()]);

        let transport = ScriptedTransport::new()
            .respond(&page_url(BASE, "nfp", "18710101", 2), 200, "[ x - 18710101 - Seite 2 ] Seite zwei")
            .respond(&page_url(BASE, "nfp", "18710101", 3), 200, "[ ]");
        let fetcher = Fetcher::new(transport, &cfg);
        let report = run_partition(&fetcher, &list, &mut progress, &sink, &ScrapePolicy::from_config(&cfg))
            .await
            .unwrap();
        assert_eq!(report.pages_written, 1);

        let rows: Vec<PageRecord> = read_records(sink.path()).unwrap();
        let texts: Vec<&str> = rows.iter().map(|r| r.text.as_str()).collect();
        assert_eq!(texts, vec!["Seite eins", "Seite zwei"]);
    }

    #[tokio::test]
    async fn test_second_run_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let list = issues(3);
        let cfg = config();
        let policy = ScrapePolicy::from_config(&cfg);
        let sink = PageSink::new(dir.path(), 1);

        let first = Fetcher::new(one_page_issues(&list, ScriptedTransport::new()), &cfg);
        let mut progress = open_progress(dir.path(), 1, &sink).await.unwrap();
        let report = run_partition(&first, &list, &mut progress, &sink, &policy).await.unwrap();
        assert_eq!(report.pages_written, 3);

        let second = Fetcher::new(one_page_issues(&list, ScriptedTransport::new()), &cfg);
        let mut progress = open_progress(dir.path(), 1, &sink).await.unwrap();
        let report = run_partition(&second, &list, &mut progress, &sink, &policy).await.unwrap();
        assert_eq!(report.pages_written, 0);
        assert_eq!(report.skipped_issues, 3);
        assert_eq!(second.transport().call_count(), 0);
        assert_eq!(derive_progress(sink.path()).unwrap(), *progress.entries());
    }

    #[tokio::test]
    async fn test_invalid_date_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut list = issues(2);
        list[0].date = "1871-01-01".to_string();
        let cfg = config();
        let fetcher = Fetcher::new(one_page_issues(&list[1..], ScriptedTransport::new()), &cfg);
        let sink = PageSink::new(dir.path(), 1);
        let mut progress = open_progress(dir.path(), 1, &sink).await.unwrap();
        let report = run_partition(&fetcher, &list, &mut progress, &sink, &ScrapePolicy::from_config(&cfg))
            .await
            .unwrap();
        assert_eq!(report.completed, 1);
    }
}
