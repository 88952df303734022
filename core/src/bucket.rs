//! Delinquency bucket classification.
//!
//! A bucket is never stored per event. It is derived from the event's
//! delinquency-day count: the primary field when present, else the legacy
//! fallback. Ranges are inclusive and disjoint:
//!
//!   B1 61–90, B2 91–180, B3 181–360, WRITEOFF 361–9999.
//!
//! ALL applies no filter. Anything outside every range (including both
//! fields null) is unclassified and simply left out of bucketed
//! aggregates.

use crate::error::{RecoveryError, RecoveryResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Bucket {
    #[serde(rename = "1", alias = "b1")]
    B1,
    #[serde(rename = "2", alias = "b2")]
    B2,
    #[serde(rename = "3", alias = "b3")]
    B3,
    #[serde(rename = "wo", alias = "writeoff")]
    WriteOff,
    #[serde(rename = "all")]
    All,
}

impl Bucket {
    /// The buckets that own a delinquency range, in dashboard order.
    pub const CLASSIFIED: [Bucket; 4] = [Bucket::B1, Bucket::B2, Bucket::B3, Bucket::WriteOff];

    /// Inclusive delinquency-day range; `None` for ALL.
    pub fn range(&self) -> Option<RangeInclusive<i64>> {
        match self {
            Self::B1       => Some(61..=90),
            Self::B2       => Some(91..=180),
            Self::B3       => Some(181..=360),
            Self::WriteOff => Some(361..=9999),
            Self::All      => None,
        }
    }

    /// Stable tag used as the rollup key column and in cache keys.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::B1       => "1",
            Self::B2       => "2",
            Self::B3       => "3",
            Self::WriteOff => "wo",
            Self::All      => "all",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "1"   => Some(Self::B1),
            "2"   => Some(Self::B2),
            "3"   => Some(Self::B3),
            "wo"  => Some(Self::WriteOff),
            "all" => Some(Self::All),
            _     => None,
        }
    }

    /// In-memory form of the storage filter.
    pub fn contains(&self, primary: Option<i64>, fallback: Option<i64>) -> bool {
        match self.range() {
            None => true,
            Some(range) => effective_days(primary, fallback).is_some_and(|d| range.contains(&d)),
        }
    }

    pub fn is_classified(&self) -> bool {
        !matches!(self, Self::All)
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::B1       => "B1",
            Self::B2       => "B2",
            Self::B3       => "B3",
            Self::WriteOff => "WRITEOFF",
            Self::All      => "ALL",
        };
        f.write_str(label)
    }
}

impl FromStr for Bucket {
    type Err = RecoveryError;

    fn from_str(s: &str) -> RecoveryResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "1" | "b1"                   => Ok(Self::B1),
            "2" | "b2"                   => Ok(Self::B2),
            "3" | "b3"                   => Ok(Self::B3),
            "wo" | "writeoff" | "write_off" => Ok(Self::WriteOff),
            "all"                        => Ok(Self::All),
            other => Err(RecoveryError::config(format!("unknown bucket '{other}'"))),
        }
    }
}

/// Primary delinquency when present, else the legacy fallback.
pub fn effective_days(primary: Option<i64>, fallback: Option<i64>) -> Option<i64> {
    primary.or(fallback)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Bucketed(Bucket),
    Unclassified,
}

impl Classification {
    pub fn bucket(&self) -> Option<Bucket> {
        match self {
            Self::Bucketed(b)  => Some(*b),
            Self::Unclassified => None,
        }
    }
}

/// Classify a delinquency pair into exactly one bucket or unclassified.
pub fn classify(primary: Option<i64>, fallback: Option<i64>) -> Classification {
    let Some(days) = effective_days(primary, fallback) else {
        return Classification::Unclassified;
    };
    Bucket::CLASSIFIED
        .into_iter()
        .find(|b| b.range().is_some_and(|r| r.contains(&days)))
        .map_or(Classification::Unclassified, Classification::Bucketed)
}

/// Classify, treating "unclassified" as a data-quality gap.
pub fn require_bucket(primary: Option<i64>, fallback: Option<i64>) -> RecoveryResult<Bucket> {
    classify(primary, fallback)
        .bucket()
        .ok_or(RecoveryError::DataQualityGap { primary, fallback })
}
