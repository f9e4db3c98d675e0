use crate::config::{AgeFilter, ColumnLayout, DatasetConfig};
use crate::types::IncidentRecord;
use regex::Regex;
use serde::Serialize;
use std::collections::HashSet;
use std::str::Lines;
use std::sync::OnceLock;
use tracing::debug;

/// Counters for what happened to each data line. Dropped rows never raise
/// an error, they only show up here.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ParseStats {
    pub emitted: usize,
    pub bad_number: usize,
    pub excluded: usize,
    pub malformed: usize,
}

impl ParseStats {
    pub fn dropped(&self) -> usize {
        self.bad_number + self.excluded + self.malformed
    }
}

enum Rejection {
    BadNumber,
    Excluded,
    Malformed,
}

/// Per-dataset rules applied to each line.
#[derive(Debug, Clone)]
struct RowRules {
    layout: ColumnLayout,
    age_filter: Option<AgeFilter>,
    category: String,
    country: Option<String>,
}

/// Lazy iterator over the incident records of one CSV text. The header line
/// is always skipped. Once drained it cannot be restarted; parse the text
/// again instead.
pub struct RecordParser<'a> {
    lines: std::iter::Skip<Lines<'a>>,
    rules: RowRules,
    stats: ParseStats,
}

impl<'a> RecordParser<'a> {
    /// `source` is the file path or URL the text came from; aggregate files
    /// without a configured category take it from the file name.
    pub fn new(text: &'a str, dataset: &DatasetConfig, source: &str) -> Self {
        let category = match (&dataset.category, dataset.layout) {
            (Some(c), _) => c.clone(),
            (None, ColumnLayout::Aggregate) => category_from_file_name(source),
            (None, _) => String::new(),
        };
        Self {
            lines: text.lines().skip(1),
            rules: RowRules {
                layout: dataset.layout,
                age_filter: dataset.age_filter,
                category,
                country: dataset.country.clone(),
            },
            stats: ParseStats::default(),
        }
    }

    pub fn stats(&self) -> ParseStats {
        self.stats
    }
}

impl Iterator for RecordParser<'_> {
    type Item = IncidentRecord;

    fn next(&mut self) -> Option<IncidentRecord> {
        for raw in self.lines.by_ref() {
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }

            match parse_line(line, &self.rules) {
                Ok(record) => {
                    self.stats.emitted += 1;
                    return Some(record);
                }
                Err(Rejection::BadNumber) => {
                    debug!(line, "dropping row with non-numeric field");
                    self.stats.bad_number += 1;
                }
                Err(Rejection::Excluded) => {
                    self.stats.excluded += 1;
                }
                Err(Rejection::Malformed) => {
                    debug!(line, "dropping malformed row");
                    self.stats.malformed += 1;
                }
            }
        }
        None
    }
}

/// `RIOTS_data_loc_m_y.csv` -> `RIOTS`
pub fn category_from_file_name(source: &str) -> String {
    let file_name = source.rsplit(['/', '\\']).next().unwrap_or(source);
    file_name.split('_').next().unwrap_or(file_name).to_string()
}

fn parse_line(line: &str, rules: &RowRules) -> Result<IncidentRecord, Rejection> {
    match rules.layout {
        ColumnLayout::FixedColumns => parse_fixed_columns(line, rules),
        ColumnLayout::QuotedAddress => parse_quoted_address(line, rules),
        ColumnLayout::Aggregate => parse_aggregate(line, rules),
    }
}

fn parse_int<T: std::str::FromStr>(field: &str) -> Result<T, Rejection> {
    field.trim().parse().map_err(|_| Rejection::BadNumber)
}

fn check_age(age: i32, rules: &RowRules) -> Result<(), Rejection> {
    match rules.age_filter {
        Some(filter) if !filter.admits(age) => Err(Rejection::Excluded),
        _ => Ok(()),
    }
}

fn unquote(field: &str) -> String {
    field.replace('"', "").trim().to_string()
}

fn parse_fixed_columns(line: &str, rules: &RowRules) -> Result<IncidentRecord, Rejection> {
    let items: Vec<&str> = line.split(',').collect();
    if items.len() < 4 {
        return Err(Rejection::Malformed);
    }

    let year = parse_int(items[0])?;
    let age = parse_int(items[1])?;
    let address = unquote(&items[2..items.len() - 1].join(","));
    let category = unquote(items[items.len() - 1]);
    if address.is_empty() || category.is_empty() {
        return Err(Rejection::Malformed);
    }
    check_age(age, rules)?;

    Ok(IncidentRecord {
        year,
        age: Some(age),
        address,
        category,
        count: None,
    })
}

fn quoted_row_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"^([^,]*),([^,]*),\s*(?:"([^"]*)"|(.*?))\s*,\s*(?:"([^"]*)"|([^,]*))$"#)
            .expect("quoted row pattern is valid")
    })
}

fn parse_quoted_address(line: &str, rules: &RowRules) -> Result<IncidentRecord, Rejection> {
    let caps = quoted_row_pattern()
        .captures(line)
        .ok_or(Rejection::Malformed)?;

    let year = parse_int(&caps[1])?;
    let age = parse_int(&caps[2])?;
    let address = caps
        .get(3)
        .or_else(|| caps.get(4))
        .map(|m| unquote(m.as_str()))
        .unwrap_or_default();
    let category = caps
        .get(5)
        .or_else(|| caps.get(6))
        .map(|m| unquote(m.as_str()))
        .unwrap_or_default();
    if address.chars().count() <= 2 || category.is_empty() {
        return Err(Rejection::Malformed);
    }
    check_age(age, rules)?;

    Ok(IncidentRecord {
        year,
        age: Some(age),
        address,
        category,
        count: None,
    })
}

fn parse_aggregate(line: &str, rules: &RowRules) -> Result<IncidentRecord, Rejection> {
    let items: Vec<&str> = line.split(',').map(str::trim).collect();
    if items.len() < 3 {
        return Err(Rejection::Malformed);
    }

    let count = parse_int(items[items.len() - 2])?;
    let year = parse_int(items[items.len() - 1])?;

    let raw_place = items[..items.len() - 2].join(",").replace('"', "");
    let mut place = dedup_fragments(&raw_place);
    if place.is_empty() {
        return Err(Rejection::Malformed);
    }
    if let Some(country) = &rules.country {
        if !place.to_lowercase().contains(&country.to_lowercase()) {
            place.push_str(", ");
            place.push_str(country);
        }
    }

    Ok(IncidentRecord {
        year,
        age: None,
        address: place,
        category: rules.category.clone(),
        count: Some(count),
    })
}

/// Removes repeated comma-separated fragments, keeping the first occurrence.
fn dedup_fragments(place: &str) -> String {
    let mut seen = HashSet::new();
    place
        .split(',')
        .map(str::trim)
        .filter(|fragment| !fragment.is_empty() && seen.insert(*fragment))
        .collect::<Vec<_>>()
        .join(", ")
}
