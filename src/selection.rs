//! Narrowing the catalogues down to the titles that get harvested.
//!
//! ANNO: year coverage per title and per title family, then a filter of the
//! issue metadata to the configured titles. The filtered list is the worker
//! input.
//!
//! DDB: a filter of the time-span table by minimum coverage and configured
//! titles, with each kept title tagged as an early or late source.

use crate::config::{DdbConfig, HarvestConfig, SelectionConfig};
use crate::error::{HarvestError, Result};
use crate::models::{
    FamilyCoverage, FamilyDecadeCoverage, IssueRef, NewspaperPeriod, SelectedNewspaper, SelectionRole, TitleCoverage,
};
use crate::outputs::csv::{read_records, write_records};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::{info, instrument, warn};

fn years_by_title(issues: &[IssueRef]) -> BTreeMap<&str, BTreeSet<i32>> {
    let mut map: BTreeMap<&str, BTreeSet<i32>> = BTreeMap::new();
    for issue in issues {
        match issue.year() {
            Some(year) => {
                map.entry(issue.title.as_str()).or_default().insert(year);
            }
            None => warn!(aid = %issue.aid, date = %issue.date, "Issue without a year"),
        }
    }
    map
}

/// Coverage of every title, most years first.
pub fn title_coverage(issues: &[IssueRef]) -> Vec<TitleCoverage> {
    let mut rows: Vec<TitleCoverage> = years_by_title(issues)
        .into_iter()
        .filter_map(|(title, years)| {
            Some(TitleCoverage {
                title: title.to_string(),
                start_year: *years.first()?,
                end_year: *years.last()?,
                years: years.len(),
            })
        })
        .collect();
    rows.sort_by_key(|c| Reverse(c.years));
    rows
}

fn family_years(by_title: &BTreeMap<&str, BTreeSet<i32>>, members: &[String]) -> BTreeSet<i32> {
    members
        .iter()
        .filter_map(|m| by_title.get(m.as_str()))
        .flat_map(|y| y.iter().copied())
        .collect()
}

/// Coverage of each family across its member titles. Families with no
/// member in the metadata are left out.
///
/// `title_count` is the number of configured members, whether or not each of
/// them shows up in the metadata.
pub fn family_coverage(issues: &[IssueRef], families: &BTreeMap<String, Vec<String>>) -> Vec<FamilyCoverage> {
    let by_title = years_by_title(issues);
    families
        .iter()
        .filter_map(|(family, members)| {
            let years = family_years(&by_title, members);
            Some(FamilyCoverage {
                family: family.clone(),
                title_count: members.len(),
                start_year: *years.first()?,
                end_year: *years.last()?,
                years: years.len(),
            })
        })
        .collect()
}

/// Covered years per family and decade, both ascending. Decades without any
/// covered year are left out.
pub fn family_decade_coverage(
    issues: &[IssueRef],
    families: &BTreeMap<String, Vec<String>>,
) -> Vec<FamilyDecadeCoverage> {
    let by_title = years_by_title(issues);
    families
        .iter()
        .flat_map(|(family, members)| {
            let mut decades: BTreeMap<i32, usize> = BTreeMap::new();
            for year in family_years(&by_title, members) {
                *decades.entry(year.div_euclid(10) * 10).or_default() += 1;
            }
            decades.into_iter().map(|(decade, years)| FamilyDecadeCoverage {
                family: family.clone(),
                decade,
                years,
            })
        })
        .collect()
}

/// Issues of the configured titles, in input order.
pub fn select_titles(issues: &[IssueRef], selection: &SelectionConfig) -> Vec<IssueRef> {
    let wanted: BTreeSet<&str> = selection.titles.iter().map(String::as_str).collect();
    issues
        .iter()
        .filter(|i| wanted.contains(i.title.as_str()))
        .cloned()
        .collect()
}

/// Build the worker input from the issue metadata. Returns the number of
/// selected issues.
#[instrument(level = "info", skip(config))]
pub fn run_anno_select(config: &HarvestConfig) -> Result<usize> {
    let paths = &config.paths;
    if !paths.metadata_csv.exists() {
        return Err(HarvestError::MissingInput(format!(
            "issue metadata {} not found; run anno-index first",
            paths.metadata_csv.display()
        )));
    }
    let issues: Vec<IssueRef> = read_records(&paths.metadata_csv)?;
    info!(issues = issues.len(), "Loaded issue metadata");

    let coverage = title_coverage(&issues);
    write_records(&paths.coverage_csv, &coverage)?;
    info!(titles = coverage.len(), path = %paths.coverage_csv.display(), "Wrote title coverage");

    for family in family_coverage(&issues, &config.selection.families) {
        info!(
            family = %family.family,
            titles = family.title_count,
            start = family.start_year,
            end = family.end_year,
            years = family.years,
            "Family coverage"
        );
    }
    for row in family_decade_coverage(&issues, &config.selection.families) {
        info!(family = %row.family, decade = row.decade, years = row.years, "Family coverage by decade");
    }

    let selected = select_titles(&issues, &config.selection);
    if selected.is_empty() {
        return Err(HarvestError::EmptySelection(
            "no issues match the configured titles".to_string(),
        ));
    }
    write_records(&paths.issues_csv, &selected)?;
    info!(selected = selected.len(), path = %paths.issues_csv.display(), "Wrote worker input");
    Ok(selected.len())
}

fn bounds(p: &NewspaperPeriod) -> Option<(i32, i32)> {
    Some((p.start_year?, p.end_year?))
}

/// Role of a title given its span; `None` spans are unspecified.
pub fn role_for(period: &NewspaperPeriod, config: &DdbConfig) -> SelectionRole {
    match bounds(period) {
        Some((_, end)) if end >= config.late_end_ref => SelectionRole::Late,
        Some((start, _)) if start <= config.early_start_ref => SelectionRole::Early,
        _ => SelectionRole::Unspecified,
    }
}

fn log_candidates(periods: &[NewspaperPeriod], config: &DdbConfig) {
    let late: Vec<&str> = periods
        .iter()
        .filter(|p| matches!(bounds(p), Some((s, e)) if e > 1945 && s < 1900))
        .map(|p| p.title.as_str())
        .collect();
    let long: Vec<&str> = periods
        .iter()
        .filter(|p| matches!(bounds(p), Some((s, e)) if e > 1946 && s < config.early_start_ref))
        .map(|p| p.title.as_str())
        .collect();
    info!(count = late.len(), titles = ?late, "Candidates reaching past 1945");
    info!(count = long.len(), titles = ?long, "Candidates spanning the whole period");
}

/// Filter and tag DDB titles.
pub fn select_ddb(periods: &[NewspaperPeriod], config: &DdbConfig) -> Vec<SelectedNewspaper> {
    let covered: Vec<NewspaperPeriod> = periods
        .iter()
        .filter(|p| p.years_covered.is_some_and(|y| y >= config.min_years))
        .cloned()
        .collect();
    info!(kept = covered.len(), min_years = config.min_years, "Filtered by coverage");
    log_candidates(&covered, config);

    let wanted: BTreeSet<&str> = config.selected_titles.iter().map(String::as_str).collect();
    let mut selected: Vec<SelectedNewspaper> = covered
        .iter()
        .filter(|p| wanted.contains(p.title.as_str()))
        .map(|p| SelectedNewspaper {
            id: p.id.clone(),
            title: p.title.clone(),
            start_year: p.start_year,
            end_year: p.end_year,
            years_covered: p.years_covered,
            role: role_for(p, config),
            notes: String::new(),
        })
        .collect();
    selected.sort_by_key(|s| (s.role, Reverse(s.years_covered), s.start_year));
    selected
}

/// Read the time-span table, select and write the selection table.
#[instrument(level = "info", skip(config))]
pub fn run_ddb_select(config: &DdbConfig) -> Result<usize> {
    let input: &Path = &config.timespans_csv;
    if !input.exists() {
        return Err(HarvestError::MissingInput(format!(
            "time-span table {} not found; run ddb-timespans first",
            input.display()
        )));
    }
    let periods: Vec<NewspaperPeriod> = read_records(input)?;
    let selected = select_ddb(&periods, config);
    if selected.is_empty() {
        return Err(HarvestError::EmptySelection(
            "no DDB titles match the configured titles and minimum coverage".to_string(),
        ));
    }
    for s in &selected {
        info!(title = %s.title, role = ?s.role, start = ?s.start_year, end = ?s.end_year, "Selected");
    }
    write_records(&config.selection_csv, &selected)?;
    info!(rows = selected.len(), path = %config.selection_csv.display(), "Wrote DDB selection");
    Ok(selected.len())
}
