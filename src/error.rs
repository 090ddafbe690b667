//! Error type shared by every pipeline stage.
//!
//! Page-level outcomes (empty pages, placeholder pages, server errors) are not
//! errors; they are values of [`crate::fetcher::PageFetch`]. What ends up here
//! is either fatal for the current stage or, in the case of
//! [`HarvestError::AccessDenied`], the signal that stops a worker loop.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum HarvestError {
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML config error: {0}")]
    Config(#[from] serde_yaml::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Request to {url} failed: {reason}")]
    Request { url: String, reason: String },

    #[error("Invalid issue date '{0}', expected YYYYMMDD")]
    InvalidDate(String),

    #[error("Invalid worker id {worker_id} for {total_workers} workers")]
    InvalidWorker { worker_id: usize, total_workers: usize },

    #[error("No input found: {0}")]
    MissingInput(String),

    #[error("Selection is empty: {0}")]
    EmptySelection(String),

    #[error("No DDB API key configured (set DDB_API_KEY or ddb.api_key)")]
    MissingApiKey,

    #[error("Access denied (HTTP 403) for {aid} {date} page {page}")]
    AccessDenied { aid: String, date: String, page: u32 },
}

pub type Result<T> = std::result::Result<T, HarvestError>;
