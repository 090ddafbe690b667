//! ANNO (Austrian National Library) issue index.
//!
//! Builds the list of issues the page workers consume, in three steps:
//!
//! 1. `alph_list.htm`: every newspaper with its place of publication
//!    ("Erscheinungsort"), filtered to the target cities
//! 2. `cgi-content/anno?aid={aid}`: the years available for one newspaper
//! 3. `cgi-content/anno?aid={aid}&datum={year}`: the issue dates of one year
//!
//! # URL Pattern
//!
//! Newspaper links carry `aid=<id>`, year links `datum=YYYY` and issue links
//! `datum=YYYYMMDD`.

use crate::config::AnnoConfig;
use crate::error::Result;
use crate::models::{IssueRef, NewspaperEntry};
use crate::outputs::csv::write_records;
use crate::transport::{PageTransport, RetryTransport};
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

static LIST_ITEM: Lazy<Selector> = Lazy::new(|| Selector::parse("div.list-item").unwrap());
static LINK: Lazy<Selector> = Lazy::new(|| Selector::parse("a[href]").unwrap());
static HEADING: Lazy<Selector> = Lazy::new(|| Selector::parse("h4").unwrap());
static ZUSATZ: Lazy<Selector> = Lazy::new(|| Selector::parse("table.zusatz").unwrap());
static ROW: Lazy<Selector> = Lazy::new(|| Selector::parse("tr").unwrap());
static CELL: Lazy<Selector> = Lazy::new(|| Selector::parse("td").unwrap());
static YEAR_LINK: Lazy<Selector> =
    Lazy::new(|| Selector::parse("#content.view-year a[href*='datum=']").unwrap());
static ISSUE_LINK: Lazy<Selector> =
    Lazy::new(|| Selector::parse("td.active a[href*='datum=']").unwrap());

static AID: Lazy<Regex> = Lazy::new(|| Regex::new(r"aid=([a-zA-Z0-9]+)").unwrap());
static DATUM_YEAR: Lazy<Regex> = Lazy::new(|| Regex::new(r"datum=(\d{4})").unwrap());
static DATUM_DAY: Lazy<Regex> = Lazy::new(|| Regex::new(r"datum=(\d{8})").unwrap());

/// Text of an element with each text node trimmed, concatenated.
fn stripped_text(el: ElementRef<'_>) -> String {
    el.text().map(str::trim).collect::<String>()
}

fn place_of_publication(item: ElementRef<'_>) -> Option<String> {
    let table = item.select(&ZUSATZ).next()?;
    for row in table.select(&ROW) {
        let cells: Vec<ElementRef<'_>> = row.select(&CELL).collect();
        if cells.len() == 2 {
            let key = stripped_text(cells[0]).to_lowercase();
            if key.contains("erscheinungsort") {
                return Some(stripped_text(cells[1]).to_lowercase());
            }
        }
    }
    None
}

/// Parse the alphabetical list and keep newspapers published in one of
/// `target_cities` (lower-case).
pub fn parse_newspaper_list(html: &str, target_cities: &[String]) -> Vec<NewspaperEntry> {
    let document = Html::parse_document(html);
    let mut newspapers = Vec::new();

    for item in document.select(&LIST_ITEM) {
        let Some(href) = item.select(&LINK).next().and_then(|a| a.value().attr("href")) else {
            continue;
        };
        let Some(aid) = AID.captures(href).map(|c| c[1].to_string()) else {
            continue;
        };
        let title = item
            .select(&HEADING)
            .next()
            .map(stripped_text)
            .unwrap_or_else(|| "Unknown Title".to_string());

        match place_of_publication(item) {
            Some(place) if target_cities.iter().any(|c| *c == place) => {
                newspapers.push(NewspaperEntry { aid, title });
            }
            _ => debug!(%aid, "Newspaper outside target cities"),
        }
    }
    newspapers
}

/// Years linked from a newspaper's overview page, limited to `from..=to`.
pub fn parse_years(html: &str, from: i32, to: i32) -> Vec<i32> {
    let document = Html::parse_document(html);
    document
        .select(&YEAR_LINK)
        .filter_map(|a| a.value().attr("href"))
        .filter_map(|href| DATUM_YEAR.captures(href).and_then(|c| c[1].parse().ok()))
        .filter(|y| (from..=to).contains(y))
        .collect()
}

/// Issue dates (`YYYYMMDD`) linked from a year page.
pub fn parse_issue_dates(html: &str) -> Vec<String> {
    let document = Html::parse_document(html);
    document
        .select(&ISSUE_LINK)
        .filter_map(|a| a.value().attr("href"))
        .filter_map(|href| DATUM_DAY.captures(href).map(|c| c[1].to_string()))
        .collect()
}

/// Client for the ANNO list pages.
#[derive(Debug)]
pub struct AnnoIndexer<T> {
    http: RetryTransport<T>,
    base_url: String,
}

impl<T> AnnoIndexer<T>
where
    T: PageTransport,
{
    /// Build an indexer over `transport`.
    ///
    /// Every list page gets at most `config.index_attempts` requests in total,
    /// each preceded by `config.index_delay_ms`.
    pub fn new(transport: T, config: &AnnoConfig) -> Self {
        let retries = config.index_attempts.saturating_sub(1);
        let http = RetryTransport::new(transport, retries, Duration::from_secs(2))
            .with_polite_delay(Duration::from_millis(config.index_delay_ms));
        Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        }
    }

    #[instrument(level = "info", skip_all)]
    pub async fn newspapers(&self, target_cities: &[String]) -> Result<Vec<NewspaperEntry>> {
        let html = self.http.get_text(&format!("{}/alph_list.htm", self.base_url)).await?;
        let newspapers = parse_newspaper_list(&html, target_cities);
        info!(count = newspapers.len(), cities = ?target_cities, "Indexed newspapers");
        Ok(newspapers)
    }

    pub async fn years(&self, aid: &str, from: i32, to: i32) -> Result<Vec<i32>> {
        let url = format!("{}/cgi-content/anno?aid={}", self.base_url, aid);
        Ok(parse_years(&self.http.get_text(&url).await?, from, to))
    }

    pub async fn issue_dates(&self, aid: &str, year: i32) -> Result<Vec<String>> {
        let url = format!("{}/cgi-content/anno?aid={}&datum={}", self.base_url, aid, year);
        Ok(parse_issue_dates(&self.http.get_text(&url).await?))
    }

    async fn issues_of(&self, paper: &NewspaperEntry, config: &AnnoConfig) -> Result<Vec<IssueRef>> {
        let years = self.years(&paper.aid, config.year_from, config.year_to).await?;
        info!(aid = %paper.aid, ?years, "Years in target range");
        let mut issues = Vec::new();
        for year in years {
            let dates = self.issue_dates(&paper.aid, year).await?;
            debug!(aid = %paper.aid, year, count = dates.len(), "Issues in year");
            issues.extend(dates.iter().map(|d| IssueRef::new(&paper.aid, &paper.title, d)));
        }
        Ok(issues)
    }

    /// Every issue of every newspaper in the target cities and year range. A
    /// newspaper whose pages fail is logged and skipped.
    #[instrument(level = "info", skip_all)]
    pub async fn index_issues(&self, config: &AnnoConfig) -> Result<Vec<IssueRef>> {
        let newspapers = self.newspapers(&config.target_cities).await?;
        let mut rows = Vec::new();
        for paper in &newspapers {
            info!(aid = %paper.aid, title = %paper.title, "Indexing newspaper");
            match self.issues_of(paper, config).await {
                Ok(issues) => rows.extend(issues),
                Err(e) => error!(aid = %paper.aid, error = %e, "Failed to index newspaper; skipping"),
            }
        }
        if rows.is_empty() {
            warn!("No issues found in the target range");
        }
        Ok(rows)
    }
}

/// Index ANNO and write `aid,title,date` rows to `output`.
pub async fn run_index<T: PageTransport>(transport: T, config: &AnnoConfig, output: &Path) -> Result<usize> {
    let indexer = AnnoIndexer::new(transport, config);
    let rows = indexer.index_issues(config).await?;
    write_records(output, &rows)?;
    info!(rows = rows.len(), path = %output.display(), "Wrote issue metadata");
    Ok(rows.len())
}
