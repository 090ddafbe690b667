//! Page scan of a single issue.
//!
//! Pages are walked strictly in order from 1. A page already in the checkpoint
//! is skipped without a request. Each new page is appended to the output file
//! first and only then recorded in the checkpoint, so a crash between the two
//! can at worst leave a row the checkpoint does not know about yet (repaired
//! at the next worker start), never a checkpoint entry without its row.
//!
//! ```text
//! scanning(1) --content--> scanning(2) --content--> ... --terminal/cap--> done
//!                 \--403--> AccessDenied (worker stops, issue stays resumable)
//! ```

use crate::config::AnnoConfig;
use crate::error::{HarvestError, Result};
use crate::fetcher::{Fetcher, PageFetch};
use crate::models::{IssueRef, PageRecord};
use crate::outputs::csv::PageSink;
use crate::progress::ProgressStore;
use crate::transport::PageTransport;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};

/// Limits applied while scanning an issue.
#[derive(Debug, Clone)]
pub struct ScrapePolicy {
    pub max_pages: u32,
    /// Extra attempts for a page that came back [`PageFetch::Transient`].
    pub transient_retries: u32,
    pub retry_base_delay: Duration,
}

impl ScrapePolicy {
    pub fn from_config(config: &AnnoConfig) -> Self {
        Self {
            max_pages: config.max_pages,
            transient_retries: config.transient_retries,
            retry_base_delay: Duration::from_millis(config.retry_base_delay_ms),
        }
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        self.retry_base_delay
            .saturating_mul(1 << attempt.saturating_sub(1).min(10))
    }
}

impl Default for ScrapePolicy {
    fn default() -> Self {
        Self::from_config(&AnnoConfig::default())
    }
}

/// Why the scan of an issue stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IssueEnd {
    /// Issue was already finished in an earlier run.
    AlreadyComplete,
    /// Empty, placeholder or server-error page.
    Terminal(&'static str),
    /// `max_pages` reached.
    PageCap,
    /// Transient failures outlasted the retry budget; the issue stays open.
    RetriesExhausted(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueOutcome {
    /// Pages fetched and written in this run.
    pub new_pages: Vec<u32>,
    /// Pages skipped because the checkpoint already had them.
    pub skipped: u32,
    pub end: IssueEnd,
}

impl IssueOutcome {
    pub fn total_pages(&self) -> u32 {
        self.new_pages.len() as u32 + self.skipped
    }
}

/// Scan one issue, writing every new page through `sink` and `progress`.
///
/// Returns [`HarvestError::AccessDenied`] on HTTP 403 and propagates any I/O
/// failure on the checkpoint or output file.
#[instrument(level = "info", skip_all, fields(worker_id = progress.worker_id(), aid = %issue.aid, date = %issue.date))]
pub async fn scrape_issue<T: PageTransport>(
    fetcher: &Fetcher<T>,
    issue: &IssueRef,
    progress: &mut ProgressStore,
    sink: &PageSink,
    policy: &ScrapePolicy,
) -> Result<IssueOutcome> {
    issue.calendar_date()?;
    let key = issue.key();
    let mut outcome = IssueOutcome {
        new_pages: Vec::new(),
        skipped: 0,
        end: IssueEnd::PageCap,
    };

    if progress.is_complete(&key) {
        outcome.skipped = progress.pages(&key).len() as u32;
        outcome.end = IssueEnd::AlreadyComplete;
        return Ok(outcome);
    }

    for page in 1..=policy.max_pages {
        if progress.contains(&key, page) {
            outcome.skipped += 1;
            continue;
        }

        match fetch_with_retry(fetcher, issue, page, policy).await {
            PageFetch::Content(text) => {
                let record = PageRecord::for_issue(issue, page, text)?;
                sink.append(&record).await?;
                progress.record(&key, page).await?;
                debug!(page, bytes = record.text.len(), "Saved page");
                outcome.new_pages.push(page);
            }
            PageFetch::AccessDenied => {
                warn!(page, "Access denied");
                return Err(HarvestError::AccessDenied {
                    aid: issue.aid.clone(),
                    date: issue.date.clone(),
                    page,
                });
            }
            PageFetch::Transient(reason) => {
                warn!(page, %reason, "Giving up on issue after transient failures");
                outcome.end = IssueEnd::RetriesExhausted(reason);
                return Ok(outcome);
            }
            terminal => {
                debug_assert!(terminal.is_issue_terminal());
                debug!(page, outcome = terminal.label(), "End of issue");
                outcome.end = IssueEnd::Terminal(terminal.label());
                progress.mark_complete(&key).await?;
                return Ok(outcome);
            }
        }
    }

    info!(max_pages = policy.max_pages, "Page cap reached");
    progress.mark_complete(&key).await?;
    Ok(outcome)
}

async fn fetch_with_retry<T: PageTransport>(
    fetcher: &Fetcher<T>,
    issue: &IssueRef,
    page: u32,
    policy: &ScrapePolicy,
) -> PageFetch {
    let mut attempt = 0u32;
    loop {
        match fetcher.fetch_page(&issue.aid, &issue.date, page).await {
            PageFetch::Transient(reason) if attempt < policy.transient_retries => {
                attempt += 1;
                let delay = policy.retry_delay(attempt);
                warn!(page, attempt, max = policy.transient_retries, ?delay, %reason, "Transient page error; retrying");
                sleep(delay).await;
            }
            other => return other,
        }
    }
}
