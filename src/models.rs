//! Data models shared by the ANNO and DDB pipelines.
//!
//! - [`IssueRef`]: one newspaper issue on one date, the unit of worker work
//! - [`PageRecord`]: one fetched ANNO page, one row of a worker output file
//! - [`NewspaperPeriod`] / [`SelectedNewspaper`]: DDB title time spans
//! - [`DdbPageRecord`]: one DDB page row
//!
//! Field names match the CSV column names, so the structs are serialized with
//! `csv` + `serde` directly.

use crate::error::{HarvestError, Result};
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

/// Build the checkpoint key for an issue.
pub fn issue_key(aid: &str, date: &str) -> String {
    format!("{}_{}", aid, date)
}

/// One newspaper issue, as listed in the issue CSV (`aid,title,date`).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct IssueRef {
    /// ANNO newspaper id, e.g. `nfp`.
    pub aid: String,
    pub title: String,
    /// Issue date as `YYYYMMDD`.
    pub date: String,
}

impl IssueRef {
    pub fn new(aid: &str, title: &str, date: &str) -> Self {
        Self {
            aid: aid.to_string(),
            title: title.to_string(),
            date: date.to_string(),
        }
    }

    pub fn key(&self) -> String {
        issue_key(&self.aid, &self.date)
    }

    pub fn calendar_date(&self) -> Result<NaiveDate> {
        NaiveDate::parse_from_str(&self.date, "%Y%m%d")
            .map_err(|_| HarvestError::InvalidDate(self.date.clone()))
    }

    /// Four-digit year prefix of the date.
    pub fn year(&self) -> Option<i32> {
        self.date.get(..4).and_then(|y| y.parse().ok())
    }
}

/// One successfully fetched ANNO page.
///
/// Column order is `title,aid,year,month,day,page,text`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PageRecord {
    pub title: String,
    pub aid: String,
    pub year: i32,
    pub month: u32,
    pub day: u32,
    pub page: u32,
    pub text: String,
}

impl PageRecord {
    pub fn for_issue(issue: &IssueRef, page: u32, text: String) -> Result<Self> {
        let d = issue.calendar_date()?;
        Ok(Self {
            title: issue.title.clone(),
            aid: issue.aid.clone(),
            year: d.year(),
            month: d.month(),
            day: d.day(),
            page,
            text,
        })
    }

    /// Date string in the issue-list format, `YYYYMMDD`.
    pub fn date_string(&self) -> String {
        format!("{:04}{:02}{:02}", self.year, self.month, self.day)
    }

    pub fn key(&self) -> String {
        issue_key(&self.aid, &self.date_string())
    }
}

/// A newspaper from the ANNO alphabetical list that matched a target city.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewspaperEntry {
    pub aid: String,
    pub title: String,
}

/// Year coverage of one ANNO title in the issue metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TitleCoverage {
    pub title: String,
    pub start_year: i32,
    pub end_year: i32,
    pub years: usize,
}

/// Year coverage of a family of related ANNO titles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FamilyCoverage {
    pub family: String,
    pub title_count: usize,
    pub start_year: i32,
    pub end_year: i32,
    pub years: usize,
}

/// Years a title family covers within one decade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FamilyDecadeCoverage {
    pub family: String,
    /// First year of the decade, e.g. `1870`.
    pub decade: i32,
    pub years: usize,
}

/// A DDB newspaper title with the year span derived from its `progress` field.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct NewspaperPeriod {
    pub id: String,
    pub title: String,
    pub start_year: Option<i32>,
    pub end_year: Option<i32>,
    pub years_covered: Option<i32>,
}

impl NewspaperPeriod {
    pub fn new(id: String, title: String, span: Option<(i32, i32)>) -> Self {
        let (start_year, end_year) = match span {
            Some((s, e)) => (Some(s), Some(e)),
            None => (None, None),
        };
        Self {
            id,
            title,
            start_year,
            end_year,
            years_covered: span.map(|(s, e)| e - s + 1),
        }
    }
}

/// Role of a selected DDB title within the corpus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionRole {
    Early,
    Late,
    Unspecified,
}

/// A DDB title chosen for the corpus.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct SelectedNewspaper {
    pub id: String,
    pub title: String,
    pub start_year: Option<i32>,
    pub end_year: Option<i32>,
    pub years_covered: Option<i32>,
    pub role: SelectionRole,
    pub notes: String,
}

/// One DDB page with its fulltext.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DdbPageRecord {
    pub title: String,
    pub year: i32,
    pub month: u32,
    pub day: u32,
    pub pagenumber: u32,
    pub text: String,
}
