//! ANNO fulltext page fetcher.
//!
//! One request per `(aid, date, page)` against
//! `{base}/cgi-content/annoshow?text={aid}|{date}|{page}`. The response body is
//! plain text led by a bracketed header such as
//! `[ 1921-05-04 - 19210504 - Seite 1 ]`, optionally followed by the page text.
//!
//! All text matching lives in [`classify`], a pure function over status and body,
//! so it can be tested without any network I/O.

use crate::config::AnnoConfig;
use crate::transport::{PageTransport, RawResponse};
use crate::utils::truncate_for_log;
use once_cell::sync::Lazy;
use rand::{Rng, rng};
use regex::Regex;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, instrument, warn};

/// Header-only body: the page index is past the last page of the issue.
static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\[\s*\d{4}-\d{2}-\d{2}\s*-\s*\d{8}\s*-\s*Seite\s+\d+\s*\]$").unwrap()
});

/// Everything up to and including the first `]`, plus trailing whitespace.
static HEADER_PREFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)^.*?\]\s*").unwrap());

/// Classified outcome of one page request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageFetch {
    /// Page text with the bracketed header removed.
    Content(String),
    /// Header stripped, nothing left.
    Empty,
    /// Only the placeholder header came back.
    Malformed,
    /// HTTP 500.
    ServerError,
    /// Any other failure: other non-2xx status, network error, timeout.
    Transient(String),
    /// HTTP 403; the archive is blocking this client.
    AccessDenied,
}

impl PageFetch {
    /// Conditions that end the scan of the current issue.
    pub fn is_issue_terminal(&self) -> bool {
        matches!(
            self,
            PageFetch::Empty | PageFetch::Malformed | PageFetch::ServerError
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            PageFetch::Content(_) => "content",
            PageFetch::Empty => "no_content",
            PageFetch::Malformed => "invalid_index",
            PageFetch::ServerError => "server_error_500",
            PageFetch::Transient(_) => "error",
            PageFetch::AccessDenied => "forbidden_403",
        }
    }
}

/// Classify a raw response. Precedence: 403, 500, other non-2xx, placeholder,
/// then header stripping.
pub fn classify(response: &RawResponse) -> PageFetch {
    match response.status {
        403 => return PageFetch::AccessDenied,
        500 => return PageFetch::ServerError,
        s if !(200..300).contains(&s) => return PageFetch::Transient(format!("HTTP {}", s)),
        _ => {}
    }

    if PLACEHOLDER.is_match(response.body.trim()) {
        return PageFetch::Malformed;
    }

    let content = HEADER_PREFIX.replace(&response.body, "");
    let content = content.trim();
    if content.is_empty() {
        PageFetch::Empty
    } else {
        PageFetch::Content(content.to_string())
    }
}

/// Build the fulltext URL for one page.
pub fn page_url(base_url: &str, aid: &str, date: &str, page: u32) -> String {
    format!(
        "{}/cgi-content/annoshow?text={}|{}|{}",
        base_url.trim_end_matches('/'),
        aid,
        date,
        page
    )
}

/// Page fetcher owning its transport. One per worker process.
#[derive(Debug)]
pub struct Fetcher<T> {
    transport: T,
    base_url: String,
    delay: Duration,
    jitter_ms: u64,
}

impl<T> Fetcher<T>
where
    T: PageTransport,
{
    /// # Arguments
    ///
    /// * `transport` - Transport every page request goes through
    /// * `config` - Source of the base URL and the politeness delay
    pub fn new(transport: T, config: &AnnoConfig) -> Self {
        Self {
            transport,
            base_url: config.base_url.clone(),
            delay: Duration::from_millis(config.politeness_delay_ms),
            jitter_ms: config.politeness_jitter_ms,
        }
    }

    #[cfg(test)]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn politeness_delay(&self) -> Duration {
        if self.jitter_ms == 0 {
            return self.delay;
        }
        self.delay + Duration::from_millis(rng().random_range(0..=self.jitter_ms))
    }

    /// Fetch and classify one page. Never fails; transport errors come back as
    /// [`PageFetch::Transient`].
    #[instrument(level = "debug", skip(self))]
    pub async fn fetch_page(&self, aid: &str, date: &str, page: u32) -> PageFetch {
        let delay = self.politeness_delay();
        if !delay.is_zero() {
            sleep(delay).await;
        }

        let url = page_url(&self.base_url, aid, date, page);
        match self.transport.get(&url).await {
            Ok(resp) => {
                let result = classify(&resp);
                debug!(
                    status = resp.status,
                    outcome = result.label(),
                    preview = %truncate_for_log(&resp.body, 80),
                    "Classified page response"
                );
                result
            }
            Err(e) => {
                warn!(aid, date, page, error = %e, "Page request failed");
                PageFetch::Transient(e.to_string())
            }
        }
    }
}
