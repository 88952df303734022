use super::filter::{collector_present_sql, placeholders};
use super::{
    map_attempt_aggregate, map_daily_attempt_row, map_secondary_row, DailyAttemptRow, Ledger,
    NewAgreement, NewCollectionEvent, NewPayment, PeriodAggregateRow, SecondaryRow, SqlFilter,
};
use crate::{
    bucket::Bucket,
    config::ActionCodes,
    error::RecoveryResult,
    types::{Granularity, YearMonth},
};
use chrono::NaiveDate;
use rusqlite::{params, params_from_iter, types::Value};

pub(crate) const PRIMARY_DAYS: &str = "delinquency_days";
pub(crate) const LEGACY_DAYS: &str = "legacy_delinquency_days";

/// The nine funnel columns over `collection_event`, in
/// [`AttemptAggregate`](super::AttemptAggregate) order, plus the values
/// their placeholders bind.
pub(crate) fn stage_columns(actions: &ActionCodes) -> (String, Vec<Value>) {
    let collector = collector_present_sql("collector_id");
    let sql = format!(
        "COUNT(DISTINCT CASE WHEN account_id IS NOT NULL AND account_id <> '' THEN account_id END),
         COUNT(DISTINCT CASE WHEN account_id IS NOT NULL AND account_id <> ''
                              AND action_code IS NOT NULL AND action_code <> '' THEN account_id END),
         COUNT(CASE WHEN {collector} THEN 1 END),
         COUNT(CASE WHEN {collector} AND action_code IN ({rp}) THEN 1 END),
         COUNT(CASE WHEN {collector} AND action_code IN ({q}) THEN 1 END),
         COUNT(CASE WHEN {collector} AND action_code = ? THEN 1 END),
         COUNT(CASE WHEN {collector} AND amount > 0 THEN 1 END),
         COUNT(*),
         COALESCE(SUM(CASE WHEN amount > 0 THEN amount END), 0.0)",
        rp = placeholders(actions.right_party.len()),
        q = placeholders(actions.qualified.len()),
    );
    let mut values: Vec<Value> = Vec::new();
    values.extend(actions.right_party.iter().map(|c| Value::Text(c.clone())));
    values.extend(actions.qualified.iter().map(|c| Value::Text(c.clone())));
    values.push(Value::Text(actions.agreement_action.clone()));
    (sql, values)
}

impl Ledger {
    // ── Appends ────────────────────────────────────────────────────────────

    pub fn insert_event(&self, e: &NewCollectionEvent) -> RecoveryResult<i64> {
        self.conn.execute(
            "INSERT INTO collection_event
             (account_id, delinquency_days, legacy_delinquency_days,
              action_code, collector_id, event_date, amount)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                e.account_id,
                e.delinquency_days,
                e.legacy_delinquency_days,
                e.action_code,
                e.collector_id,
                e.event_date,
                e.amount,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Append a batch inside one transaction.
    pub fn insert_events(&self, events: &[NewCollectionEvent]) -> RecoveryResult<usize> {
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO collection_event
                 (account_id, delinquency_days, legacy_delinquency_days,
                  action_code, collector_id, event_date, amount)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for e in events {
                stmt.execute(params![
                    e.account_id,
                    e.delinquency_days,
                    e.legacy_delinquency_days,
                    e.action_code,
                    e.collector_id,
                    e.event_date,
                    e.amount,
                ])?;
            }
        }
        tx.commit()?;
        Ok(events.len())
    }

    pub fn insert_agreement(&self, a: &NewAgreement) -> RecoveryResult<()> {
        self.conn.execute(
            "INSERT INTO agreement
             (account_id, delinquency_days, legacy_delinquency_days, kind, issued_on, total_value)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                a.account_id,
                a.delinquency_days,
                a.legacy_delinquency_days,
                a.kind,
                a.issued_on,
                a.total_value,
            ],
        )?;
        Ok(())
    }

    pub fn insert_payment(&self, p: &NewPayment) -> RecoveryResult<()> {
        self.conn.execute(
            "INSERT INTO payment
             (account_id, delinquency_days, legacy_delinquency_days, collector_id, paid_on, amount_received)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                p.account_id,
                p.delinquency_days,
                p.legacy_delinquency_days,
                p.collector_id,
                p.paid_on,
                p.amount_received,
            ],
        )?;
        Ok(())
    }

    pub fn event_count(&self) -> RecoveryResult<i64> {
        let n = self
            .conn
            .query_row("SELECT COUNT(*) FROM collection_event", [], |r| r.get(0))?;
        Ok(n)
    }

    // ── Live scans ─────────────────────────────────────────────────────────

    /// Funnel counts grouped by period over the attempt log.
    pub fn stage_counts(
        &self,
        bucket: Bucket,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
        granularity: Granularity,
        actions: &ActionCodes,
    ) -> RecoveryResult<Vec<PeriodAggregateRow>> {
        let filter = SqlFilter::new()
            .bucket(bucket, PRIMARY_DAYS, LEGACY_DAYS)
            .date_range("event_date", start, end);
        let (columns, column_params) = stage_columns(actions);
        let sql = format!(
            "SELECT {period} AS period, {columns}
             FROM collection_event{where_sql}
             GROUP BY period ORDER BY period",
            period = granularity.sql_period("event_date"),
            where_sql = filter.where_sql(),
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(filter.bind_after(column_params)), |row| {
                Ok(PeriodAggregateRow {
                    period:    row.get(0)?,
                    aggregate: map_attempt_aggregate(row, 1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Raw attempt counts per day.
    pub fn attempts_by_day(
        &self,
        bucket: Bucket,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> RecoveryResult<Vec<DailyAttemptRow>> {
        let filter = SqlFilter::new()
            .bucket(bucket, PRIMARY_DAYS, LEGACY_DAYS)
            .date_range("event_date", start, end);
        let sql = format!(
            "SELECT event_date, COUNT(*) FROM collection_event{}
             GROUP BY event_date ORDER BY event_date",
            filter.where_sql()
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(filter.params()), map_daily_attempt_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Distinct accounts with an agreement of `kind`, and their total value.
    pub fn agreements_by_period(
        &self,
        bucket: Bucket,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
        granularity: Granularity,
        kind: &str,
    ) -> RecoveryResult<Vec<SecondaryRow>> {
        let filter = SqlFilter::new()
            .text_eq("kind", kind)
            .bucket(bucket, PRIMARY_DAYS, LEGACY_DAYS)
            .date_range("issued_on", start, end);
        let sql = format!(
            "SELECT {period} AS period, COUNT(DISTINCT account_id), COALESCE(SUM(total_value), 0.0)
             FROM agreement{where_sql}
             GROUP BY period ORDER BY period",
            period = granularity.sql_period("issued_on"),
            where_sql = filter.where_sql(),
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(filter.params()), map_secondary_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Count and sum of positive payments.
    pub fn payments_by_period(
        &self,
        bucket: Bucket,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
        granularity: Granularity,
    ) -> RecoveryResult<Vec<SecondaryRow>> {
        let filter = SqlFilter::new()
            .positive("amount_received")
            .bucket(bucket, PRIMARY_DAYS, LEGACY_DAYS)
            .date_range("paid_on", start, end);
        let sql = format!(
            "SELECT {period} AS period, COUNT(*), COALESCE(SUM(amount_received), 0.0)
             FROM payment{where_sql}
             GROUP BY period ORDER BY period",
            period = granularity.sql_period("paid_on"),
            where_sql = filter.where_sql(),
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(filter.params()), map_secondary_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn earliest_event_date(&self, bucket: Bucket) -> RecoveryResult<Option<NaiveDate>> {
        let filter = SqlFilter::new().bucket(bucket, PRIMARY_DAYS, LEGACY_DAYS);
        let sql = format!("SELECT MIN(event_date) FROM collection_event{}", filter.where_sql());
        let first = self
            .conn
            .query_row(&sql, params_from_iter(filter.params()), |r| r.get(0))?;
        Ok(first)
    }

    /// Months that hold at least one event for the bucket, ascending.
    pub fn event_months(&self, bucket: Bucket) -> RecoveryResult<Vec<YearMonth>> {
        let filter = SqlFilter::new().bucket(bucket, PRIMARY_DAYS, LEGACY_DAYS);
        let sql = format!(
            "SELECT DISTINCT substr(event_date, 1, 7) AS ym FROM collection_event{} ORDER BY ym",
            filter.where_sql()
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let keys = stmt
            .query_map(params_from_iter(filter.params()), |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        keys.iter().map(|k| YearMonth::parse(k)).collect()
    }
}
