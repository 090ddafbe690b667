//! HTTP transport with an injectable seam and an exponential backoff decorator.
//!
//! # Architecture
//!
//! - [`PageTransport`]: core trait, one GET returning status and body
//! - [`HttpTransport`]: `reqwest` client built once per process with proxy,
//!   user agent and timeout
//! - [`RetryTransport`]: decorator that retries failed requests and non-2xx
//!   statuses on top of any `PageTransport`
//!
//! The page fetcher talks to a bare transport because it classifies raw
//! statuses itself. List pages and API calls go through [`RetryTransport`].
//!
//! # Retry Strategy
//!
//! ```text
//! delay = min(base_delay * 2^(attempt-1), max_delay) + random_jitter(0..250ms)
//! ```

use crate::config::AnnoConfig;
use crate::error::{HarvestError, Result};
use crate::utils::truncate_for_log;
use rand::{Rng, rng};
use reqwest::{Client, Proxy};
use std::fmt;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};

/// Status code and decoded body of one response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub body: String,
}

impl RawResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// A request that produced no response: connect failure, timeout, decode error.
#[derive(Error, Debug, Clone)]
#[error("{0}")]
pub struct TransportError(pub String);

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        TransportError(e.to_string())
    }
}

/// One GET request. Implemented by the real HTTP client and by test fakes.
pub trait PageTransport {
    async fn get(&self, url: &str) -> std::result::Result<RawResponse, TransportError>;
}

/// `reqwest`-backed transport, owned by the process that built it.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// Build a client from the ANNO settings: user agent, timeout and optional proxy.
    pub fn from_config(config: &AnnoConfig) -> Result<Self> {
        let mut builder = Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.timeout());
        if let Some(proxy) = &config.proxy {
            builder = builder.proxy(Proxy::all(proxy)?);
            info!("Using outbound proxy");
        }
        Ok(Self {
            client: builder.build()?,
        })
    }
}

impl PageTransport for HttpTransport {
    #[instrument(level = "debug", skip(self))]
    async fn get(&self, url: &str) -> std::result::Result<RawResponse, TransportError> {
        let t0 = Instant::now();
        let resp = self.client.get(url).send().await?;
        let status = resp.status().as_u16();
        let body = resp.text().await?;
        debug!(
            status,
            bytes = body.len(),
            elapsed_ms = t0.elapsed().as_millis() as u64,
            "GET finished"
        );
        Ok(RawResponse { status, body })
    }
}

/// Wrapper that adds a polite pre-request delay and exponential backoff to
/// any [`PageTransport`]. Non-2xx responses count as failed attempts.
pub struct RetryTransport<T> {
    inner: T,
    max_retries: usize,
    base_delay: Duration,
    max_delay: Duration,
    polite_delay: Duration,
}

impl<T> RetryTransport<T>
where
    T: PageTransport,
{
    pub fn new(inner: T, max_retries: usize, base_delay: Duration) -> Self {
        Self {
            inner,
            max_retries,
            base_delay,
            max_delay: Duration::from_secs(30),
            polite_delay: Duration::ZERO,
        }
    }

    #[cfg(test)]
    pub fn inner(&self) -> &T {
        &self.inner
    }

    /// Sleep this long before every attempt.
    pub fn with_polite_delay(mut self, delay: Duration) -> Self {
        self.polite_delay = delay;
        self
    }

    fn backoff(&self, attempt: usize) -> Duration {
        let shift = (attempt.saturating_sub(1)).min(16) as u32;
        let mut delay = self.base_delay.saturating_mul(1 << shift);
        if delay > self.max_delay {
            delay = self.max_delay;
        }
        let jitter_ms: u64 = rng().random_range(0..=250);
        delay + Duration::from_millis(jitter_ms)
    }

    /// GET `url` and return the body of the first 2xx response.
    #[instrument(level = "info", skip(self))]
    pub async fn get_text(&self, url: &str) -> Result<String> {
        let total_t0 = Instant::now();
        let mut attempt = 0usize;

        loop {
            if !self.polite_delay.is_zero() {
                sleep(self.polite_delay).await;
            }
            let failure = match self.inner.get(url).await {
                Ok(resp) if resp.is_success() => return Ok(resp.body),
                Ok(resp) => format!(
                    "HTTP {}: {}",
                    resp.status,
                    truncate_for_log(&resp.body, 200)
                ),
                Err(e) => e.to_string(),
            };

            attempt += 1;
            if attempt > self.max_retries {
                error!(
                    attempt,
                    max = self.max_retries,
                    elapsed_ms_total = total_t0.elapsed().as_millis() as u64,
                    error = %failure,
                    "GET exhausted retries"
                );
                return Err(HarvestError::Request {
                    url: url.to_string(),
                    reason: failure,
                });
            }

            let delay = self.backoff(attempt);
            warn!(
                attempt,
                max = self.max_retries,
                ?delay,
                error = %failure,
                "GET attempt failed; backing off"
            );
            sleep(delay).await;
        }
    }
}

impl<T> fmt::Debug for RetryTransport<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryTransport")
            .field("max_retries", &self.max_retries)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("polite_delay", &self.polite_delay)
            .finish()
    }
}
