//! Async access to the materialized rollups.

use crate::{
    bucket::Bucket,
    config::ActionCodes,
    error::RecoveryResult,
    store::{DailyAttemptRow, MonthlyRollupRow, StorePool},
    types::YearMonth,
};
use chrono::{DateTime, NaiveDate, Utc};
use std::sync::Arc;

#[derive(Clone)]
pub struct RollupStore {
    pool:    StorePool,
    actions: Arc<ActionCodes>,
}

/// Stored monthly rows plus the months currently flagged for recompute.
#[derive(Debug, Clone, Default)]
pub struct MonthlySnapshot {
    pub rows:  Vec<MonthlyRollupRow>,
    pub stale: Vec<YearMonth>,
}

impl MonthlySnapshot {
    /// A stored, non-stale row for `ym`.
    pub fn usable(&self, ym: YearMonth) -> Option<&MonthlyRollupRow> {
        if self.stale.contains(&ym) {
            return None;
        }
        self.rows
            .iter()
            .find(|r| r.year == ym.year && r.month == ym.month)
    }
}

impl RollupStore {
    pub fn new(pool: StorePool, actions: Arc<ActionCodes>) -> Self {
        Self { pool, actions }
    }

    /// Capability probe: do the rollup tables exist in this database?
    pub async fn available(&self) -> RecoveryResult<bool> {
        self.pool.call(|l| l.rollup_tables_present()).await
    }

    pub async fn monthly(
        &self,
        bucket: Bucket,
        from: Option<YearMonth>,
        to: Option<YearMonth>,
    ) -> RecoveryResult<MonthlySnapshot> {
        self.pool
            .call(move |l| {
                Ok(MonthlySnapshot {
                    rows:  l.monthly_rollups(bucket, from, to)?,
                    stale: l.stale_months(bucket)?,
                })
            })
            .await
    }

    pub async fn stored_months(&self, bucket: Bucket) -> RecoveryResult<Vec<YearMonth>> {
        self.pool.call(move |l| l.rollup_months(bucket)).await
    }

    pub async fn stale_months(&self, bucket: Bucket) -> RecoveryResult<Vec<YearMonth>> {
        self.pool.call(move |l| l.stale_months(bucket)).await
    }

    pub async fn mark_stale(&self, bucket: Bucket, ym: YearMonth, at: DateTime<Utc>) -> RecoveryResult<()> {
        self.pool.call(move |l| l.mark_stale(bucket, ym, at)).await
    }

    /// Replace one monthly row from a fresh full scan of its slice.
    pub async fn replace_month(&self, bucket: Bucket, ym: YearMonth) -> RecoveryResult<()> {
        let actions = Arc::clone(&self.actions);
        self.pool
            .call(move |l| l.replace_monthly_rollup(bucket, ym, &actions))
            .await
    }

    pub async fn daily_watermark(&self, bucket: Bucket) -> RecoveryResult<Option<NaiveDate>> {
        self.pool.call(move |l| l.daily_watermark(bucket)).await
    }

    pub async fn daily(
        &self,
        bucket: Bucket,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> RecoveryResult<Vec<DailyAttemptRow>> {
        self.pool.call(move |l| l.daily_attempts(bucket, start, end)).await
    }

    pub async fn extend_daily(&self, bucket: Bucket, from: NaiveDate, to: NaiveDate) -> RecoveryResult<usize> {
        self.pool
            .call(move |l| l.upsert_daily_attempts(bucket, from, to))
            .await
    }
}
