//! Shared primitive types used across the analytics engine.

use crate::error::{RecoveryError, RecoveryResult};
use chrono::{Datelike, Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier of a debtor account in the raw logs.
pub type AccountId = String;

/// Identifier of a collector (the ranked entity).
pub type CollectorId = String;

/// Normalized series key: `YYYY-MM-DD` for day and week
/// (week keys are the Monday), `YYYY-MM` for month.
pub type PeriodKey = String;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Day,
    Week,
    Month,
}

impl Granularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Day   => "day",
            Self::Week  => "week",
            Self::Month => "month",
        }
    }

    /// The period key an individual date falls into.
    pub fn period_key(&self, date: NaiveDate) -> PeriodKey {
        match self {
            Self::Day   => date.format("%Y-%m-%d").to_string(),
            Self::Week  => week_start(date).format("%Y-%m-%d").to_string(),
            Self::Month => YearMonth::of(date).key(),
        }
    }

    /// SQL expression producing the same key as [`period_key`] for a
    /// `YYYY-MM-DD` text column. `column` must be a static identifier.
    ///
    /// [`period_key`]: Granularity::period_key
    pub fn sql_period(&self, column: &'static str) -> String {
        match self {
            Self::Day   => column.to_string(),
            Self::Month => format!("substr({column}, 1, 7)"),
            Self::Week  => format!(
                "date({column}, '-' || ((CAST(strftime('%w', {column}) AS INTEGER) + 6) % 7) || ' days')"
            ),
        }
    }
}

impl FromStr for Granularity {
    type Err = RecoveryError;

    fn from_str(s: &str) -> RecoveryResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "day" | "daily"     => Ok(Self::Day),
            "week" | "weekly"   => Ok(Self::Week),
            "month" | "monthly" => Ok(Self::Month),
            other => Err(RecoveryError::config(format!("unknown granularity '{other}'"))),
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Monday of the week containing `date`.
pub fn week_start(date: NaiveDate) -> NaiveDate {
    date - Duration::days(date.weekday().num_days_from_monday() as i64)
}

/// A calendar month, the key unit of the monthly rollup.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct YearMonth {
    pub year:  i32,
    pub month: u32,
}

impl YearMonth {
    pub fn new(year: i32, month: u32) -> RecoveryResult<Self> {
        if !(1..=12).contains(&month) {
            return Err(RecoveryError::config(format!("month out of range: {month}")));
        }
        Ok(Self { year, month })
    }

    pub fn of(date: NaiveDate) -> Self {
        Self { year: date.year(), month: date.month() }
    }

    pub fn first_day(&self) -> NaiveDate {
        NaiveDate::from_ymd_opt(self.year, self.month, 1).unwrap_or(NaiveDate::MIN)
    }

    pub fn last_day(&self) -> NaiveDate {
        self.next().first_day().pred_opt().unwrap_or(NaiveDate::MAX)
    }

    pub fn next(&self) -> Self {
        if self.month == 12 {
            Self { year: self.year + 1, month: 1 }
        } else {
            Self { year: self.year, month: self.month + 1 }
        }
    }

    /// The month `n` months before this one.
    pub fn minus(&self, n: u32) -> Self {
        let index = self.year as i64 * 12 + (self.month as i64 - 1) - n as i64;
        Self {
            year:  index.div_euclid(12) as i32,
            month: index.rem_euclid(12) as u32 + 1,
        }
    }

    /// `YYYYMM` as an integer, convenient for range predicates.
    pub fn ordinal(&self) -> i64 {
        self.year as i64 * 100 + self.month as i64
    }

    pub fn key(&self) -> PeriodKey {
        format!("{:04}-{:02}", self.year, self.month)
    }

    /// Parse a `YYYY-MM` key.
    pub fn parse(key: &str) -> RecoveryResult<Self> {
        let (y, m) = key
            .split_once('-')
            .ok_or_else(|| RecoveryError::config(format!("bad month key '{key}'")))?;
        let year = y
            .parse::<i32>()
            .map_err(|e| RecoveryError::config(format!("bad year in '{key}': {e}")))?;
        let month = m
            .parse::<u32>()
            .map_err(|e| RecoveryError::config(format!("bad month in '{key}': {e}")))?;
        Self::new(year, month)
    }

    /// Every month from `from` through `to`, inclusive.
    pub fn span(from: YearMonth, to: YearMonth) -> Vec<YearMonth> {
        let mut out = Vec::new();
        let mut cursor = from;
        while cursor <= to {
            out.push(cursor);
            cursor = cursor.next();
        }
        out
    }
}

impl fmt::Display for YearMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

/// Round to two decimals, the precision of every reported ratio and stat.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Conversion percentage; 0 when the denominator is 0.
pub fn percent(numerator: i64, denominator: i64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        round2(numerator as f64 * 100.0 / denominator as f64)
    }
}
