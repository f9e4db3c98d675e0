//! Hourly crime-probability forecast for one category and calendar day.
//!
//! The yearly incident count is extrapolated with a least-squares line and
//! then spread over the 24 hours using the category's month, day-of-month
//! and hour frequencies.

use anyhow::{Context, Result};
use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use csv::ReaderBuilder;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

const TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M:%S",
    "%d-%m-%Y %H:%M:%S",
    "%d-%m-%Y %H:%M",
    "%m/%d/%Y %H:%M",
];

/// Training skips the busiest year and keeps at most this many after it.
const TRAINING_YEARS: usize = 8;

#[derive(Error, Debug, PartialEq)]
pub enum ForecastError {
    #[error("no incidents recorded for category '{0}'")]
    UnknownCategory(String),

    #[error("not enough yearly history to fit a trend for '{0}'")]
    InsufficientHistory(String),

    #[error("invalid date: month {month}, day {day}")]
    InvalidDate { month: u32, day: u32 },
}

#[derive(Debug, Deserialize)]
struct IncidentLogRow {
    #[serde(rename = "Offence_From_Date")]
    offence_from: String,
    #[serde(rename = "CrimeGroup_Name")]
    crime_group: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoggedIncident {
    pub at: NaiveDateTime,
}

/// Timestamped incidents grouped by crime group.
#[derive(Debug, Default)]
pub struct IncidentLog {
    by_category: HashMap<String, Vec<LoggedIncident>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HourlyForecast {
    pub category: String,
    pub month: u32,
    pub day: u32,
    pub target_year: i32,
    pub predicted_total: f64,
    pub hourly: Vec<f64>,
}

impl IncidentLog {
    pub fn load(path: &Path) -> Result<Self> {
        info!("Loading incident log from {:?}", path);
        let mut rdr = ReaderBuilder::new()
            .flexible(true)
            .from_path(path)
            .with_context(|| format!("Failed to open incident log: {:?}", path))?;

        let mut log = IncidentLog::default();
        let mut skipped = 0usize;
        for result in rdr.deserialize::<IncidentLogRow>() {
            let row = result.context("Failed to read incident log row")?;
            match parse_timestamp(&row.offence_from) {
                Some(at) => log.push(row.crime_group.trim(), at),
                None => skipped += 1,
            }
        }
        if skipped > 0 {
            debug!(skipped, "Skipped incident log rows with unreadable dates");
        }
        info!(categories = log.by_category.len(), "Incident log loaded");
        Ok(log)
    }

    pub fn push(&mut self, category: &str, at: NaiveDateTime) {
        self.by_category
            .entry(category.to_string())
            .or_default()
            .push(LoggedIncident { at });
    }

    pub fn categories(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.by_category.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn forecast(
        &self,
        category: &str,
        month: u32,
        day: u32,
        target_year: i32,
    ) -> Result<HourlyForecast, ForecastError> {
        if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
            return Err(ForecastError::InvalidDate { month, day });
        }
        let incidents = self
            .by_category
            .get(category)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ForecastError::UnknownCategory(category.to_string()))?;

        let months = frequencies(incidents.iter().map(|i| i.at.month()));
        let days = frequencies(incidents.iter().map(|i| i.at.day()));
        let hours = frequencies(incidents.iter().map(|i| i.at.hour()));

        let training = training_years(incidents);
        if training.is_empty() {
            return Err(ForecastError::InsufficientHistory(category.to_string()));
        }
        let predicted_total = fit_line(&training).predict(f64::from(target_year));

        let month_factor = months.share(month);
        let day_factor = days.share(day);
        let hourly = (0..24)
            .map(|hour| predicted_total * month_factor * day_factor * hours.share(hour))
            .collect();

        Ok(HourlyForecast {
            category: category.to_string(),
            month,
            day,
            target_year,
            predicted_total,
            hourly,
        })
    }
}

fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

struct Frequencies {
    counts: HashMap<u32, usize>,
    total: usize,
}

impl Frequencies {
    /// Fraction of incidents with this value, 0 when it never occurs.
    fn share(&self, value: u32) -> f64 {
        match self.counts.get(&value) {
            Some(&n) if self.total > 0 => n as f64 / self.total as f64,
            _ => 0.0,
        }
    }
}

fn frequencies(values: impl Iterator<Item = u32>) -> Frequencies {
    let mut counts = HashMap::new();
    let mut total = 0;
    for v in values {
        *counts.entry(v).or_insert(0) += 1;
        total += 1;
    }
    Frequencies { counts, total }
}

/// Yearly counts ordered busiest first (ties by year), without the busiest
/// year, capped at `TRAINING_YEARS`.
fn training_years(incidents: &[LoggedIncident]) -> Vec<(f64, f64)> {
    let mut per_year: HashMap<i32, usize> = HashMap::new();
    for incident in incidents {
        *per_year.entry(incident.at.year()).or_insert(0) += 1;
    }
    let mut ranked: Vec<(i32, usize)> = per_year.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

    ranked
        .into_iter()
        .skip(1)
        .take(TRAINING_YEARS)
        .map(|(year, count)| (f64::from(year), count as f64))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Line {
    slope: f64,
    intercept: f64,
}

impl Line {
    fn predict(&self, x: f64) -> f64 {
        self.slope * x + self.intercept
    }
}

/// Ordinary least squares. A single point or constant x gives a flat line
/// through the mean.
fn fit_line(points: &[(f64, f64)]) -> Line {
    let n = points.len() as f64;
    let mean_x = points.iter().map(|p| p.0).sum::<f64>() / n;
    let mean_y = points.iter().map(|p| p.1).sum::<f64>() / n;

    let sxx: f64 = points.iter().map(|p| (p.0 - mean_x).powi(2)).sum();
    let sxy: f64 = points.iter().map(|p| (p.0 - mean_x) * (p.1 - mean_y)).sum();

    let slope = if sxx > 0.0 { sxy / sxx } else { 0.0 };
    Line {
        slope,
        intercept: mean_y - slope * mean_x,
    }
}
