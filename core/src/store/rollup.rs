use super::events::{stage_columns, LEGACY_DAYS, PRIMARY_DAYS};
use super::filter::date_value;
use super::{map_attempt_aggregate, map_daily_attempt_row, DailyAttemptRow, Ledger, MonthlyRollupRow, SqlFilter};
use crate::{
    bucket::Bucket,
    config::ActionCodes,
    error::RecoveryResult,
    types::YearMonth,
};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, params_from_iter, types::Value, Transaction, TransactionBehavior};

impl Ledger {
    /// True when both rollup tables exist. Probed once at startup.
    pub fn rollup_tables_present(&self) -> RecoveryResult<bool> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master
             WHERE type = 'table' AND name IN ('monthly_bucket_rollup', 'daily_attempt_rollup')",
            [],
            |r| r.get(0),
        )?;
        Ok(n == 2)
    }

    // ── Monthly rollup ─────────────────────────────────────────────────────

    /// Recompute one (bucket, month) row from a full scan of its slice and
    /// replace the stored row. The scan and the removal of the key's stale
    /// marker commit together under an immediate write lock, so a marker
    /// written by another connection lands after the commit and survives.
    pub fn replace_monthly_rollup(
        &self,
        bucket: Bucket,
        ym: YearMonth,
        actions: &ActionCodes,
    ) -> RecoveryResult<()> {
        let filter = SqlFilter::new()
            .bucket(bucket, PRIMARY_DAYS, LEGACY_DAYS)
            .date_range("event_date", Some(ym.first_day()), Some(ym.last_day()));
        let (columns, column_params) = stage_columns(actions);
        let sql = format!(
            "INSERT OR REPLACE INTO monthly_bucket_rollup
             (bucket, year, month, portfolio, contacted, responded, right_party,
              qualified, agreements, payments, attempts, amount)
             SELECT ?, ?, ?, {columns}
             FROM collection_event{}",
            filter.where_sql()
        );
        let mut leading = vec![
            Value::Text(bucket.tag().to_string()),
            Value::Integer(ym.year as i64),
            Value::Integer(ym.month as i64),
        ];
        leading.extend(column_params);
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
        tx.execute(&sql, params_from_iter(filter.bind_after(leading)))?;
        tx.execute(
            "DELETE FROM rollup_stale_month WHERE bucket = ?1 AND year = ?2 AND month = ?3",
            params![bucket.tag(), ym.year, ym.month],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Stored rows for a bucket within an inclusive month range.
    pub fn monthly_rollups(
        &self,
        bucket: Bucket,
        from: Option<YearMonth>,
        to: Option<YearMonth>,
    ) -> RecoveryResult<Vec<MonthlyRollupRow>> {
        let lo = from.map_or(i64::MIN, |m| m.ordinal());
        let hi = to.map_or(i64::MAX, |m| m.ordinal());
        let mut stmt = self.conn.prepare(
            "SELECT bucket, year, month, portfolio, contacted, responded, right_party,
                    qualified, agreements, payments, attempts, amount
             FROM monthly_bucket_rollup
             WHERE bucket = ?1 AND (year * 100 + month) BETWEEN ?2 AND ?3
             ORDER BY year, month",
        )?;
        let rows = stmt
            .query_map(params![bucket.tag(), lo, hi], |row| {
                Ok(MonthlyRollupRow {
                    bucket:    row.get(0)?,
                    year:      row.get(1)?,
                    month:     row.get(2)?,
                    aggregate: map_attempt_aggregate(row, 3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Months with a stored row for the bucket, ascending.
    pub fn rollup_months(&self, bucket: Bucket) -> RecoveryResult<Vec<YearMonth>> {
        let mut stmt = self.conn.prepare(
            "SELECT year, month FROM monthly_bucket_rollup
             WHERE bucket = ?1 ORDER BY year, month",
        )?;
        let rows = stmt
            .query_map(params![bucket.tag()], |r| {
                Ok(YearMonth { year: r.get(0)?, month: r.get(1)? })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ── Stale markers ──────────────────────────────────────────────────────

    pub fn mark_stale(&self, bucket: Bucket, ym: YearMonth, at: DateTime<Utc>) -> RecoveryResult<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO rollup_stale_month (bucket, year, month, marked_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![bucket.tag(), ym.year, ym.month, at.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn stale_months(&self, bucket: Bucket) -> RecoveryResult<Vec<YearMonth>> {
        let mut stmt = self.conn.prepare(
            "SELECT year, month FROM rollup_stale_month
             WHERE bucket = ?1 ORDER BY year, month",
        )?;
        let rows = stmt
            .query_map(params![bucket.tag()], |r| {
                Ok(YearMonth { year: r.get(0)?, month: r.get(1)? })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ── Daily attempt rollup ───────────────────────────────────────────────

    /// Latest day stored for the bucket.
    pub fn daily_watermark(&self, bucket: Bucket) -> RecoveryResult<Option<NaiveDate>> {
        let day = self.conn.query_row(
            "SELECT MAX(day) FROM daily_attempt_rollup WHERE bucket = ?1",
            params![bucket.tag()],
            |r| r.get(0),
        )?;
        Ok(day)
    }

    /// Write per-day attempt counts for `from..=to` in one upsert.
    /// Returns the number of days written.
    pub fn upsert_daily_attempts(
        &self,
        bucket: Bucket,
        from: NaiveDate,
        to: NaiveDate,
    ) -> RecoveryResult<usize> {
        let filter = SqlFilter::new()
            .bucket(bucket, PRIMARY_DAYS, LEGACY_DAYS)
            .date_range("event_date", Some(from), Some(to));
        let sql = format!(
            "INSERT INTO daily_attempt_rollup (bucket, day, attempts)
             SELECT ?, event_date, COUNT(*)
             FROM collection_event{}
             GROUP BY event_date
             ON CONFLICT(bucket, day) DO UPDATE SET attempts = excluded.attempts",
            filter.where_sql()
        );
        let leading = vec![Value::Text(bucket.tag().to_string())];
        let written = self
            .conn
            .execute(&sql, params_from_iter(filter.bind_after(leading)))?;
        Ok(written)
    }

    pub fn daily_attempts(
        &self,
        bucket: Bucket,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> RecoveryResult<Vec<DailyAttemptRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT day, attempts FROM daily_attempt_rollup
             WHERE bucket = ?1 AND day >= ?2 AND day <= ?3
             ORDER BY day",
        )?;
        let lo = start.map_or(Value::Text(String::new()), date_value);
        let hi = end.map_or(Value::Text("9999-12-31".to_string()), date_value);
        let rows = stmt
            .query_map(params![bucket.tag(), lo, hi], map_daily_attempt_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
