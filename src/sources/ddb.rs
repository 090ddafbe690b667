//! Deutsche Digitale Bibliothek newspaper portal API.
//!
//! Two Solr-style indexes under `{api_base}/search/index/`:
//!
//! | Index | Used for |
//! |-------|----------|
//! | `newspaper` | title list with `progress` notes, for time spans |
//! | `newspaper-issues` | issue and page documents, for ZDB ids and fulltext |
//!
//! Responses look like `{"response": {"numFound": N, "docs": [...]}}` and are
//! paged with `start`/`rows`. Document fields may be single values or lists,
//! so docs are kept as `serde_json::Value` and read with the helpers below.

use crate::config::DdbConfig;
use crate::error::{HarvestError, Result};
use crate::models::{DdbPageRecord, NewspaperPeriod};
use crate::outputs::csv::write_records;
use crate::transport::{PageTransport, RetryTransport};
use crate::utils::slugify;
use chrono::{DateTime, Datelike, NaiveDate};
use itertools::Itertools;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::cmp::Reverse;
use std::time::Duration;
use tracing::{info, instrument, warn};
use url::Url;

static YEAR: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(1[5-9]\d{2}|20\d{2})\b").unwrap());

#[derive(Debug, Default, Deserialize)]
struct SolrEnvelope {
    #[serde(default)]
    response: SolrResponse,
}

#[derive(Debug, Default, Deserialize)]
struct SolrResponse {
    #[serde(default, rename = "numFound")]
    num_found: usize,
    #[serde(default)]
    docs: Vec<Value>,
}

/// String fields: a plain string, or a list of strings joined with `sep`.
pub fn field_text(doc: &Value, field: &str, sep: &str) -> Option<String> {
    match doc.get(field)? {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => Some(items.iter().filter_map(Value::as_str).join(sep)),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

fn field_strings(doc: &Value, field: &str) -> Vec<String> {
    match doc.get(field) {
        Some(Value::String(s)) => vec![s.clone()],
        Some(Value::Array(items)) => items.iter().filter_map(Value::as_str).map(str::to_string).collect(),
        _ => Vec::new(),
    }
}

/// Numeric field given as a number or a numeric string (first element of a list).
fn field_number(doc: &Value, field: &str) -> Option<f64> {
    let value = match doc.get(field)? {
        Value::Array(items) => items.first()?,
        v => v,
    };
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Year span mentioned in a title's `progress` notes.
pub fn parse_progress(entries: &[String]) -> Option<(i32, i32)> {
    let years: Vec<i32> = entries
        .iter()
        .flat_map(|e| YEAR.find_iter(e).filter_map(|m| m.as_str().parse().ok()).collect::<Vec<i32>>())
        .collect();
    Some((*years.iter().min()?, *years.iter().max()?))
}

pub fn compute_periods(docs: &[Value]) -> Vec<NewspaperPeriod> {
    docs.iter()
        .map(|doc| {
            NewspaperPeriod::new(
                field_text(doc, "id", "; ").unwrap_or_default(),
                field_text(doc, "title", "; ").unwrap_or_default(),
                parse_progress(&field_strings(doc, "progress")),
            )
        })
        .collect()
}

/// Longest coverage first, then earliest start; unknown spans last.
pub fn sort_periods(periods: &mut [NewspaperPeriod]) {
    periods.sort_by_key(|p| {
        (
            p.years_covered.is_none(),
            Reverse(p.years_covered),
            p.start_year.is_none(),
            p.start_year,
        )
    });
}

/// Solr range over `publication_date` covering whole years.
pub fn publication_date_range(start_year: i32, end_year: i32) -> String {
    format!(
        "[{}-01-01T12:00:00Z TO {}-12-31T12:00:00Z]",
        start_year, end_year
    )
}

fn parse_publication_date(raw: &str) -> Option<NaiveDate> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw.trim()) {
        return Some(dt.date_naive());
    }
    NaiveDate::parse_from_str(raw.trim().get(..10)?, "%Y-%m-%d").ok()
}

/// Turn raw page documents into rows: parseable date, integral page number,
/// page window and year window applied, sorted by date and page.
pub fn preprocess_pages(docs: &[Value], fallback_title: &str, config: &DdbConfig) -> Vec<DdbPageRecord> {
    let mut rows: Vec<DdbPageRecord> = docs
        .iter()
        .filter_map(|doc| {
            let date = parse_publication_date(&field_text(doc, "publication_date", "")?)?;
            let page = field_number(doc, "pagenumber")?;
            if page < 0.0 || page.fract() != 0.0 {
                return None;
            }
            Some(DdbPageRecord {
                title: field_text(doc, "paper_title", "; ").unwrap_or_else(|| fallback_title.to_string()),
                year: date.year(),
                month: date.month(),
                day: date.day(),
                pagenumber: page as u32,
                text: field_text(doc, "plainpagefulltext", "\n").unwrap_or_default(),
            })
        })
        .filter(|r| config.page_min.is_none_or(|min| r.pagenumber >= min))
        .filter(|r| config.page_max.is_none_or(|max| r.pagenumber <= max))
        .filter(|r| (config.start_year..=config.end_year).contains(&r.year))
        .collect();
    rows.sort_by_key(|r| (r.year, r.month, r.day, r.pagenumber));
    rows
}

/// Authenticated client for the DDB search API.
#[derive(Debug)]
pub struct DdbClient<T> {
    http: RetryTransport<T>,
    api_base: String,
    api_key: String,
    rows_per_page: usize,
}

impl<T> DdbClient<T>
where
    T: PageTransport,
{
    /// # Arguments
    ///
    /// * `transport` - Transport for API requests
    /// * `config` - API base, key and page size
    /// * `retries` - Extra attempts per request after the first
    ///
    /// # Errors
    ///
    /// Returns [`HarvestError::MissingApiKey`] if the key is unset, empty or
    /// still `YOUR_API_KEY`.
    pub fn new(transport: T, config: &DdbConfig, retries: usize) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.is_empty() && k != "YOUR_API_KEY")
            .ok_or(HarvestError::MissingApiKey)?;
        Ok(Self {
            http: RetryTransport::new(transport, retries, Duration::from_secs(1)),
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key,
            rows_per_page: config.rows_per_page.max(1),
        })
    }

    fn select_url(&self, index: &str, params: &[(&str, String)], start: usize) -> Result<String> {
        let mut url = Url::parse(&format!("{}/search/index/{}/select", self.api_base, index))?;
        url.query_pairs_mut()
            .extend_pairs(params.iter().map(|(k, v)| (*k, v.as_str())))
            .append_pair("wt", "json")
            .append_pair("start", &start.to_string())
            .append_pair("rows", &self.rows_per_page.to_string())
            .append_pair("oauth_consumer_key", &self.api_key);
        Ok(url.into())
    }

    /// All documents matching `params`, following `start` until `numFound`.
    #[instrument(level = "info", skip(self, params))]
    async fn select_all(&self, index: &str, params: &[(&str, String)]) -> Result<Vec<Value>> {
        let mut docs = Vec::new();
        let mut start = 0usize;
        loop {
            let url = self.select_url(index, params, start)?;
            let body = self.http.get_text(&url).await?;
            let envelope: SolrEnvelope = serde_json::from_str(&body)?;
            let page_len = envelope.response.docs.len();
            docs.extend(envelope.response.docs);
            start += self.rows_per_page;
            info!(fetched = docs.len(), found = envelope.response.num_found, "Fetched result page");
            if start >= envelope.response.num_found || page_len == 0 {
                break;
            }
        }
        Ok(docs)
    }

    /// Every newspaper title with loaded issues.
    pub async fn fetch_newspapers(&self) -> Result<Vec<Value>> {
        let params = [
            ("q", "hasLoadedIssues:true".to_string()),
            ("fl", "id,title,progress".to_string()),
        ];
        self.select_all("newspaper", &params).await
    }

    /// Distinct ZDB ids of a title's issues within the year range.
    #[instrument(level = "info", skip(self))]
    pub async fn zdb_ids_for_paper(
        &self,
        paper_title: &str,
        start_year: i32,
        end_year: i32,
        language: &str,
    ) -> Result<Vec<String>> {
        let q = format!(
            "paper_title:\"{}\" AND publication_date:{} AND language:{}",
            paper_title.replace('"', "\\\""),
            publication_date_range(start_year, end_year),
            language
        );
        let params = [("q", q), ("fl", "id,zdb_id".to_string())];
        let issues = self.select_all("newspaper-issues", &params).await?;
        if issues.is_empty() {
            warn!(paper_title, start_year, end_year, "No issues in range");
        }
        let ids: Vec<String> = issues
            .iter()
            .flat_map(|doc| field_strings(doc, "zdb_id"))
            .sorted()
            .dedup()
            .collect();
        info!(paper_title, ids = ?ids, "Found ZDB ids");
        Ok(ids)
    }

    /// Page documents of one ZDB id.
    pub async fn pages_for_zdb(&self, zdb_id: &str) -> Result<Vec<Value>> {
        let params = [
            ("q", format!("zdb_id:\"{}\"", zdb_id)),
            (
                "fl",
                "id,paper_title,publication_date,pagenumber,plainpagefulltext".to_string(),
            ),
        ];
        let pages = self.select_all("newspaper-issues", &params).await?;
        if pages.is_empty() {
            warn!(zdb_id, "No pages for ZDB id");
        }
        Ok(pages)
    }
}

/// Fetch every title's time span and write the sorted table.
pub async fn run_timespans<T: PageTransport>(client: &DdbClient<T>, config: &DdbConfig) -> Result<usize> {
    info!("Loading newspaper titles");
    let docs = client.fetch_newspapers().await?;
    info!(count = docs.len(), "Fetched titles");
    let mut periods = compute_periods(&docs);
    sort_periods(&mut periods);
    write_records(&config.timespans_csv, &periods)?;
    info!(path = %config.timespans_csv.display(), rows = periods.len(), "Wrote time spans");
    Ok(periods.len())
}

/// Fetch page fulltext for every configured paper; one CSV per paper plus a
/// master CSV. Returns the number of master rows.
pub async fn run_pages<T: PageTransport>(client: &DdbClient<T>, config: &DdbConfig) -> Result<usize> {
    info!(start = config.start_year, end = config.end_year, papers = ?config.papers, "Fetching DDB pages");
    let mut master = Vec::new();

    for paper in &config.papers {
        info!(paper = %paper, "Processing newspaper");
        let ids = client
            .zdb_ids_for_paper(paper, config.start_year, config.end_year, &config.language)
            .await?;

        let mut paper_rows = Vec::new();
        for zdb_id in &ids {
            let docs = client.pages_for_zdb(zdb_id).await?;
            let rows = preprocess_pages(&docs, paper, config);
            if rows.is_empty() {
                warn!(paper = %paper, %zdb_id, "No pages left after filtering");
            }
            paper_rows.extend(rows);
        }

        if paper_rows.is_empty() {
            warn!(paper = %paper, "No pages for newspaper in range");
            continue;
        }

        let file = config.per_paper_dir.join(format!(
            "{}_{}_to_{}.csv",
            slugify(paper),
            config.start_year,
            config.end_year
        ));
        write_records(&file, &paper_rows)?;
        info!(paper = %paper, rows = paper_rows.len(), path = %file.display(), "Wrote newspaper pages");
        master.extend(paper_rows);
    }

    if master.is_empty() {
        warn!("No pages found for the configured newspapers");
        return Ok(0);
    }
    write_records(&config.master_csv, &master)?;
    info!(rows = master.len(), path = %config.master_csv.display(), "Wrote master page table");
    Ok(master.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outputs::csv::read_records;
    use crate::transport::testing::ScriptedTransport;
    use serde_json::json;

    fn config(dir: &std::path::Path) -> DdbConfig {
        DdbConfig {
            api_base: "http://ddb.test".to_string(),
            api_key: Some("k".to_string()),
            rows_per_page: 2,
            timespans_csv: dir.join("spans.csv"),
            per_paper_dir: dir.join("by_newspaper"),
            master_csv: dir.join("master.csv"),
            ..DdbConfig::default()
        }
    }

    fn client(transport: ScriptedTransport, cfg: &DdbConfig) -> DdbClient<ScriptedTransport> {
        DdbClient::new(transport, cfg, 0).unwrap()
    }

    #[test]
    fn test_parse_progress() {
        let entries = vec![
            "1798 - 1806; 1871-1945".to_string(),
            "Lücken 1919, Ausgabe 123".to_string(),
        ];
        assert_eq!(parse_progress(&entries), Some((1798, 1945)));
        assert_eq!(parse_progress(&["keine Angaben 12345".to_string()]), None);
        assert_eq!(parse_progress(&[]), None);
    }

    #[test]
    fn test_compute_periods_joins_list_titles() {
        let docs = vec![
            json!({"id": "A", "title": ["Neckar-Bote", "Beilage"], "progress": ["1871 - 1954"]}),
            json!({"id": "B", "title": "Ohne Angaben"}),
        ];
        let periods = compute_periods(&docs);
        assert_eq!(periods[0].title, "Neckar-Bote; Beilage");
        assert_eq!(periods[0].years_covered, Some(84));
        assert_eq!(periods[1].start_year, None);
    }

    #[test]
    fn test_sort_periods() {
        let mut periods = vec![
            NewspaperPeriod::new("a".into(), "a".into(), None),
            NewspaperPeriod::new("b".into(), "b".into(), Some((1900, 1909))),
            NewspaperPeriod::new("c".into(), "c".into(), Some((1850, 1900))),
            NewspaperPeriod::new("d".into(), "d".into(), Some((1880, 1889))),
        ];
        sort_periods(&mut periods);
        let ids: Vec<&str> = periods.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "d", "b", "a"]);
    }

    #[test]
    fn test_missing_api_key() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = DdbConfig {
            api_key: None,
            ..config(dir.path())
        };
        assert!(matches!(
            DdbClient::new(ScriptedTransport::new(), &cfg, 0),
            Err(HarvestError::MissingApiKey)
        ));
    }

    #[test]
    fn test_select_url_encodes_query() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let c = client(ScriptedTransport::new(), &cfg);
        let url = c
            .select_url("newspaper", &[("q", "hasLoadedIssues:true".to_string())], 4)
            .unwrap();
        assert_eq!(
            url,
            "http://ddb.test/search/index/newspaper/select?q=hasLoadedIssues%3Atrue&wt=json&start=4&rows=2&oauth_consumer_key=k"
        );
    }

    #[tokio::test]
    async fn test_timespans_follow_pagination() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let url_client = client(ScriptedTransport::new(), &cfg);
        let params = [
            ("q", "hasLoadedIssues:true".to_string()),
            ("fl", "id,title,progress".to_string()),
        ];
        let page0 = url_client.select_url("newspaper", &params, 0).unwrap();
        let page1 = url_client.select_url("newspaper", &params, 2).unwrap();

        let transport = ScriptedTransport::new()
            .respond(
                &page0,
                200,
                &json!({"response": {"numFound": 3, "docs": [
                    {"id": "A", "title": "Kurz", "progress": ["1900-1902"]},
                    {"id": "B", "title": "Lang", "progress": ["1850", "1950"]}
                ]}})
                .to_string(),
            )
            .respond(
                &page1,
                200,
                &json!({"response": {"numFound": 3, "docs": [{"id": "C", "title": "Leer"}]}}).to_string(),
            );
        let c = client(transport, &cfg);
        assert_eq!(run_timespans(&c, &cfg).await.unwrap(), 3);

        let rows: Vec<NewspaperPeriod> = read_records(&cfg.timespans_csv).unwrap();
        let ids: Vec<&str> = rows.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["B", "A", "C"]);
        assert_eq!(rows[0].years_covered, Some(101));
    }

    #[test]
    fn test_preprocess_pages_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let docs = vec![
            json!({"publication_date": "1900-01-02T12:00:00Z", "pagenumber": 2, "plainpagefulltext": ["B"]}),
            json!({"publication_date": "1900-01-02T12:00:00Z", "pagenumber": "1", "plainpagefulltext": "A", "paper_title": "Neckar-Bote"}),
            json!({"publication_date": "1900-01-01T12:00:00Z", "pagenumber": 7, "plainpagefulltext": "zu weit"}),
            json!({"publication_date": "1860-05-05", "pagenumber": 1, "plainpagefulltext": "zu früh"}),
            json!({"publication_date": "kaputt", "pagenumber": 1}),
            json!({"publication_date": "1900-01-03T12:00:00Z", "plainpagefulltext": "ohne Seite"}),
        ];
        let rows = preprocess_pages(&docs, "Fallback", &cfg);
        assert_eq!(rows.len(), 2);
        assert_eq!((rows[0].pagenumber, rows[0].title.as_str(), rows[0].text.as_str()), (1, "Neckar-Bote", "A"));
        assert_eq!((rows[1].pagenumber, rows[1].title.as_str()), (2, "Fallback"));
        assert_eq!((rows[1].year, rows[1].month, rows[1].day), (1900, 1, 2));
    }

    #[tokio::test]
    async fn test_run_pages_writes_per_paper_and_master() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = DdbConfig {
            papers: vec!["Neckar-Bote".to_string()],
            rows_per_page: 10,
            ..config(dir.path())
        };
        let url_client = client(ScriptedTransport::new(), &cfg);
        let issues_q = format!(
            "paper_title:\"Neckar-Bote\" AND publication_date:{} AND language:ger",
            publication_date_range(1871, 1954)
        );
        let issues_url = url_client
            .select_url("newspaper-issues", &[("q", issues_q), ("fl", "id,zdb_id".to_string())], 0)
            .unwrap();
        let pages_url = url_client
            .select_url(
                "newspaper-issues",
                &[
                    ("q", "zdb_id:\"123-4\"".to_string()),
                    ("fl", "id,paper_title,publication_date,pagenumber,plainpagefulltext".to_string()),
                ],
                0,
            )
            .unwrap();

        let transport = ScriptedTransport::new()
            .respond(
                &issues_url,
                200,
                &json!({"response": {"numFound": 2, "docs": [{"zdb_id": "123-4"}, {"zdb_id": ["123-4"]}]}}).to_string(),
            )
            .respond(
                &pages_url,
                200,
                &json!({"response": {"numFound": 1, "docs": [
                    {"publication_date": "1880-03-01T12:00:00Z", "pagenumber": 1, "plainpagefulltext": "Text"}
                ]}})
                .to_string(),
            );
        let c = client(transport, &cfg);
        assert_eq!(run_pages(&c, &cfg).await.unwrap(), 1);

        let per_paper = cfg.per_paper_dir.join("neckar-bote_1871_to_1954.csv");
        let rows: Vec<DdbPageRecord> = read_records(&per_paper).unwrap();
        assert_eq!(rows[0].text, "Text");
        let raw = std::fs::read_to_string(&cfg.master_csv).unwrap();
        assert!(raw.starts_with("title,year,month,day,pagenumber,text\n"));
        assert_eq!(c.http.inner().call_count(), 2);
    }
}
