use super::{Ledger, SqlFilter};
use crate::{error::RecoveryResult, types::CollectorId, types::YearMonth};
use chrono::NaiveDate;
use rusqlite::{params_from_iter, types::Value};

/// Receipts credited to one collector over a date range.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectorReceiptRow {
    pub collector_id: CollectorId,
    pub payments:     i64,
    pub received:     f64,
}

/// One cell of the month × collector receipt pivot.
#[derive(Debug, Clone, PartialEq)]
pub struct MonthlyReceiptRow {
    pub month:        YearMonth,
    pub collector_id: CollectorId,
    pub received:     f64,
}

fn receipts_filter(start: NaiveDate, end: NaiveDate) -> SqlFilter {
    SqlFilter::new()
        .positive("amount_received")
        .date_range("paid_on", Some(start), Some(end))
}

impl Ledger {
    /// The `limit` collectors with the highest received value, highest
    /// first, collector id breaking ties.
    pub fn top_receipts(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        limit: usize,
    ) -> RecoveryResult<Vec<CollectorReceiptRow>> {
        let filter = receipts_filter(start, end).collector_present("collector_id");
        let sql = format!(
            "SELECT collector_id, COUNT(*), SUM(amount_received) AS received
             FROM payment{}
             GROUP BY collector_id
             ORDER BY received DESC, collector_id ASC
             LIMIT ?",
            filter.where_sql()
        );
        let mut params = filter.params().to_vec();
        params.push(Value::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(params), |row| {
                Ok(CollectorReceiptRow {
                    collector_id: row.get(0)?,
                    payments:     row.get(1)?,
                    received:     row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Count and value of every positive receipt in the range, credited or not.
    pub fn receipt_totals(&self, start: NaiveDate, end: NaiveDate) -> RecoveryResult<(i64, f64)> {
        let filter = receipts_filter(start, end);
        let sql = format!(
            "SELECT COUNT(*), COALESCE(SUM(amount_received), 0.0) FROM payment{}",
            filter.where_sql()
        );
        let totals = self
            .conn
            .query_row(&sql, params_from_iter(filter.params()), |r| Ok((r.get(0)?, r.get(1)?)))?;
        Ok(totals)
    }

    /// Distinct calendar months holding at least one positive receipt.
    pub fn receipt_month_count(&self, start: NaiveDate, end: NaiveDate) -> RecoveryResult<i64> {
        let filter = receipts_filter(start, end);
        let sql = format!(
            "SELECT COUNT(DISTINCT substr(paid_on, 1, 7)) FROM payment{}",
            filter.where_sql()
        );
        let n = self
            .conn
            .query_row(&sql, params_from_iter(filter.params()), |r| r.get(0))?;
        Ok(n)
    }

    /// Received value per month for the given collectors, months ascending.
    pub fn monthly_receipts(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        collectors: &[CollectorId],
    ) -> RecoveryResult<Vec<MonthlyReceiptRow>> {
        if collectors.is_empty() {
            return Ok(Vec::new());
        }
        let filter = receipts_filter(start, end).text_in("collector_id", collectors);
        let sql = format!(
            "SELECT substr(paid_on, 1, 7) AS ym, collector_id, SUM(amount_received)
             FROM payment{}
             GROUP BY ym, collector_id
             ORDER BY ym ASC, collector_id ASC",
            filter.where_sql()
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let raw = stmt
            .query_map(params_from_iter(filter.params()), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, f64>(2)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        raw.into_iter()
            .map(|(ym, collector_id, received)| {
                Ok(MonthlyReceiptRow { month: YearMonth::parse(&ym)?, collector_id, received })
            })
            .collect()
    }
}
