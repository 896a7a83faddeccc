//! # Trend windows
//!
//! Parses human-entered relative windows such as `"6 months"` into a lookback horizon
//! and applies it to a subject's measurement history. Month and year lengths are the
//! fixed approximations 31 and 365 days, not calendar arithmetic.

use crate::types::{Biomarker, MeasurementRecord, SubjectId};
use chrono::{Days, NaiveDate};
use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use thiserror::Error;

/// Window used when a caller does not supply one.
pub const DEFAULT_TREND_RANGE: &str = "100years";
/// Maximum number of points returned when a caller does not supply a limit.
pub const DEFAULT_TREND_LIMIT: usize = 20;

const EXPECTED_GRAMMAR: &str =
    "<positive integer><optional whitespace><day|week|month|year>[s], e.g. '6 months'";

/// `<amount><optional whitespace><unit>[s]`, matched against trimmed input.
static TREND_RANGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^([0-9]+)\s*(day|week|month|year)s?$").expect("trend range pattern compiles")
});

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TrendRangeError {
    #[error("Invalid trend range '{input}'. Expected {grammar}.", grammar = EXPECTED_GRAMMAR)]
    Format { input: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrendUnit {
    Day,
    Week,
    Month,
    Year,
}

impl TrendUnit {
    pub fn days(self) -> u64 {
        match self {
            TrendUnit::Day => 1,
            TrendUnit::Week => 7,
            TrendUnit::Month => 31,
            TrendUnit::Year => 365,
        }
    }

    fn label(self) -> &'static str {
        match self {
            TrendUnit::Day => "day",
            TrendUnit::Week => "week",
            TrendUnit::Month => "month",
            TrendUnit::Year => "year",
        }
    }
}

/// A parsed relative window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrendRange {
    pub amount: u32,
    pub unit: TrendUnit,
}

impl TrendRange {
    pub fn parse(text: &str) -> Result<Self, TrendRangeError> {
        let format_error = || TrendRangeError::Format {
            input: text.to_string(),
        };

        let captures = TREND_RANGE_RE
            .captures(text.trim())
            .ok_or_else(format_error)?;
        let amount: u32 = captures[1].parse().map_err(|_| format_error())?;
        if amount == 0 {
            return Err(format_error());
        }
        let unit = match captures[2].to_ascii_lowercase().as_str() {
            "day" => TrendUnit::Day,
            "week" => TrendUnit::Week,
            "month" => TrendUnit::Month,
            "year" => TrendUnit::Year,
            _ => return Err(format_error()),
        };

        Ok(Self { amount, unit })
    }

    pub fn lookback_days(&self) -> u64 {
        u64::from(self.amount) * self.unit.days()
    }

    /// The exclusive lower bound on dates inside this window, counted back from `today`.
    pub fn cutoff(&self, today: NaiveDate) -> NaiveDate {
        today
            .checked_sub_days(Days::new(self.lookback_days()))
            .unwrap_or(NaiveDate::MIN)
    }
}

impl FromStr for TrendRange {
    type Err = TrendRangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for TrendRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let plural = if self.amount == 1 { "" } else { "s" };
        write!(f, "{} {}{}", self.amount, self.unit.label(), plural)
    }
}

/// Parses `text` and returns the lookback horizon in days.
pub fn parse_lookback_days(text: &str) -> Result<u64, TrendRangeError> {
    TrendRange::parse(text).map(|range| range.lookback_days())
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendPoint {
    pub taken_at: NaiveDate,
    pub value: f64,
}

/// One biomarker's history for one subject inside `range`, newest first, at most
/// `limit` points.
pub fn trend_series(
    records: &[MeasurementRecord],
    subject_id: SubjectId,
    biomarker: Biomarker,
    range: &TrendRange,
    limit: usize,
    today: NaiveDate,
) -> Vec<TrendPoint> {
    let cutoff = range.cutoff(today);
    let mut points: Vec<TrendPoint> = records
        .iter()
        .filter(|r| r.subject_id == subject_id && r.biomarker == biomarker && r.taken_at > cutoff)
        .map(|r| TrendPoint {
            taken_at: r.taken_at,
            value: r.value,
        })
        .collect();
    points.sort_by(|a, b| b.taken_at.cmp(&a.taken_at));
    points.truncate(limit);
    points
}
