//! SQLite persistence layer.
//!
//! RULE: Only the store talks to the database.
//! Every statement is prepared with bound parameters; the only text ever
//! spliced into SQL is static column names and `?` placeholders.

use crate::{error::RecoveryResult, types::PeriodKey};
use chrono::NaiveDate;
use rusqlite::Connection;
use serde::Serialize;
use std::time::Duration;

mod events;
mod filter;
mod pool;
mod production;
mod ranking;
mod rollup;

pub use filter::SqlFilter;
pub use pool::StorePool;
pub use production::{CollectorReceiptRow, MonthlyReceiptRow};
pub use ranking::VolumeScope;

pub struct Ledger {
    conn: Connection,
}

impl Ledger {
    pub fn open(path: &str, busy_timeout: Duration) -> RecoveryResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_URI,
        )?;
        // WAL mode only for real files (shared-memory and :memory: ignore it).
        let _ = conn.execute_batch("PRAGMA journal_mode=WAL;");
        conn.busy_timeout(busy_timeout)?;
        Ok(Self { conn })
    }

    /// Open an in-memory database (used in tests).
    pub fn in_memory() -> RecoveryResult<Self> {
        let conn = Connection::open(":memory:")?;
        Ok(Self { conn })
    }

    /// Apply all schema migrations in order.
    pub fn migrate(&self) -> RecoveryResult<()> {
        self.migrate_event_log()?;
        self.conn
            .execute_batch(include_str!("../../../migrations/002_rollups.sql"))?;
        Ok(())
    }

    /// Only the raw log tables. A database prepared this way has no
    /// rollup capability and is served by live scans.
    pub fn migrate_event_log(&self) -> RecoveryResult<()> {
        self.conn
            .execute_batch(include_str!("../../../migrations/001_event_log.sql"))?;
        Ok(())
    }
}

// ── Row types ──────────────────────────────────────────────────────────────

/// One row appended to the attempt log.
#[derive(Debug, Clone)]
pub struct NewCollectionEvent {
    pub account_id:              Option<String>,
    pub delinquency_days:        Option<i64>,
    pub legacy_delinquency_days: Option<i64>,
    pub action_code:             Option<String>,
    pub collector_id:            Option<String>,
    pub event_date:              NaiveDate,
    pub amount:                  Option<f64>,
}

#[derive(Debug, Clone)]
pub struct NewAgreement {
    pub account_id:              String,
    pub delinquency_days:        Option<i64>,
    pub legacy_delinquency_days: Option<i64>,
    pub kind:                    String,
    pub issued_on:               NaiveDate,
    pub total_value:             f64,
}

#[derive(Debug, Clone)]
pub struct NewPayment {
    pub account_id:              Option<String>,
    pub delinquency_days:        Option<i64>,
    pub legacy_delinquency_days: Option<i64>,
    /// Collector credited with the receipt.
    pub collector_id:            Option<String>,
    pub paid_on:                 NaiveDate,
    pub amount_received:         f64,
}

/// Funnel counts over one slice of the attempt log. This is both the
/// shape of a live scan row and of a stored monthly rollup row.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AttemptAggregate {
    pub portfolio:   i64,
    pub contacted:   i64,
    pub responded:   i64,
    pub right_party: i64,
    pub qualified:   i64,
    pub agreements:  i64,
    pub payments:    i64,
    pub attempts:    i64,
    pub amount:      f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PeriodAggregateRow {
    pub period:    PeriodKey,
    pub aggregate: AttemptAggregate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MonthlyRollupRow {
    pub bucket:    String,
    pub year:      i32,
    pub month:     u32,
    pub aggregate: AttemptAggregate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DailyAttemptRow {
    pub day:      NaiveDate,
    pub attempts: i64,
}

/// Count and value of a secondary log (agreements or payments) per period.
#[derive(Debug, Clone, PartialEq)]
pub struct SecondaryRow {
    pub period: PeriodKey,
    pub count:  i64,
    pub value:  f64,
}

/// Reads the nine aggregate columns starting at `offset`.
fn map_attempt_aggregate(row: &rusqlite::Row<'_>, offset: usize) -> rusqlite::Result<AttemptAggregate> {
    Ok(AttemptAggregate {
        portfolio:   row.get(offset)?,
        contacted:   row.get(offset + 1)?,
        responded:   row.get(offset + 2)?,
        right_party: row.get(offset + 3)?,
        qualified:   row.get(offset + 4)?,
        agreements:  row.get(offset + 5)?,
        payments:    row.get(offset + 6)?,
        attempts:    row.get(offset + 7)?,
        amount:      row.get(offset + 8)?,
    })
}

fn map_daily_attempt_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DailyAttemptRow> {
    Ok(DailyAttemptRow {
        day:      row.get(0)?,
        attempts: row.get(1)?,
    })
}

fn map_secondary_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SecondaryRow> {
    Ok(SecondaryRow {
        period: row.get(0)?,
        count:  row.get(1)?,
        value:  row.get(2)?,
    })
}
