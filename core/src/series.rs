//! Date-keyed funnel series per bucket.
//!
//! Three independent sources feed one series: the attempt log (or its
//! rollups), the agreement log and the payment log. They are fetched
//! concurrently and merged by period key; a key missing from a source
//! contributes zeros.
//!
//! Source selection for the attempt side:
//!   - month, rollup-backed: closed months fully inside the range come from
//!     the monthly rollup unless missing or stale; everything else (edge
//!     months, the current month, gaps) is scanned live.
//!   - day, rollup-backed: stage counts are live; attempts come from the
//!     daily rollup up to its watermark and from a live scan after it, which
//!     always covers today.
//!   - week, the ALL bucket, or live strategy: one live scan.

use crate::{
    bucket::Bucket,
    clock::Clock,
    config::ActionCodes,
    error::{RecoveryError, RecoveryResult},
    rollup::RollupStore,
    store::{AttemptAggregate, PeriodAggregateRow, SecondaryRow, StorePool},
    types::{percent, Granularity, PeriodKey, YearMonth},
};
use chrono::{Duration, NaiveDate};
use futures::future::try_join_all;
use log::debug;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Chosen once at startup from a capability probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SeriesStrategy {
    RollupBacked,
    LiveScan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeriesRequest {
    pub bucket:      Bucket,
    pub start:       Option<NaiveDate>,
    pub end:         Option<NaiveDate>,
    pub granularity: Granularity,
}

impl SeriesRequest {
    pub fn validate(&self) -> RecoveryResult<()> {
        if let (Some(s), Some(e)) = (self.start, self.end) {
            if s > e {
                return Err(RecoveryError::config(format!("start {s} is after end {e}")));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StageCounts {
    pub portfolio:   i64,
    pub contacted:   i64,
    pub responded:   i64,
    pub right_party: i64,
    pub qualified:   i64,
    pub agreed:      i64,
    pub paid:        i64,
}

/// Each stage as a percentage of the stage before it.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StageConversions {
    pub contacted_pct:   f64,
    pub responded_pct:   f64,
    pub right_party_pct: f64,
    pub qualified_pct:   f64,
    pub agreed_pct:      f64,
    pub paid_pct:        f64,
}

impl StageConversions {
    pub fn of(s: &StageCounts) -> Self {
        Self {
            contacted_pct:   percent(s.contacted, s.portfolio),
            responded_pct:   percent(s.responded, s.contacted),
            right_party_pct: percent(s.right_party, s.responded),
            qualified_pct:   percent(s.qualified, s.right_party),
            agreed_pct:      percent(s.agreed, s.qualified),
            paid_pct:        percent(s.paid, s.agreed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SeriesPoint {
    pub period:       PeriodKey,
    pub attempts:     i64,
    /// Positive amounts recorded on attempt rows.
    pub amount:       f64,
    pub agreed_value: f64,
    pub paid_amount:  f64,
    pub stages:       StageCounts,
    pub conversions:  StageConversions,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BucketSeries {
    pub bucket:          Bucket,
    pub granularity:     Granularity,
    pub start:           Option<NaiveDate>,
    pub end:             Option<NaiveDate>,
    pub points:          Vec<SeriesPoint>,
    /// Periods whose attempt side was served from a rollup.
    pub rollup_periods:  usize,
}

impl BucketSeries {
    pub fn total_attempts(&self) -> i64 {
        self.points.iter().map(|p| p.attempts).sum()
    }

    pub fn point(&self, period: &str) -> Option<&SeriesPoint> {
        self.points.iter().find(|p| p.period == period)
    }
}

/// One contiguous date range scanned live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LiveSegment {
    start: Option<NaiveDate>,
    end:   Option<NaiveDate>,
}

pub struct TimeSeriesAggregator {
    pool:     StorePool,
    rollups:  RollupStore,
    clock:    Arc<dyn Clock>,
    actions:  Arc<ActionCodes>,
    strategy: SeriesStrategy,
}

impl TimeSeriesAggregator {
    pub fn new(
        pool: StorePool,
        rollups: RollupStore,
        clock: Arc<dyn Clock>,
        actions: Arc<ActionCodes>,
        strategy: SeriesStrategy,
    ) -> Self {
        Self { pool, rollups, clock, actions, strategy }
    }

    pub fn strategy(&self) -> SeriesStrategy {
        self.strategy
    }

    pub async fn get_series(&self, req: SeriesRequest) -> RecoveryResult<BucketSeries> {
        req.validate()?;
        let ((attempt_rows, rollup_periods), agreements, payments) = tokio::try_join!(
            self.attempt_side(&req),
            self.agreement_side(&req),
            self.payment_side(&req),
        )?;
        debug!(
            "series {} {} {:?}..{:?}: {} attempt periods ({} from rollup)",
            req.bucket,
            req.granularity,
            req.start,
            req.end,
            attempt_rows.len(),
            rollup_periods
        );
        Ok(BucketSeries {
            bucket: req.bucket,
            granularity: req.granularity,
            start: req.start,
            end: req.end,
            points: merge_sources(attempt_rows, agreements, payments),
            rollup_periods,
        })
    }

    // ── Attempt log ────────────────────────────────────────────────────────

    async fn attempt_side(&self, req: &SeriesRequest) -> RecoveryResult<(Vec<PeriodAggregateRow>, usize)> {
        let rollups = self.strategy == SeriesStrategy::RollupBacked && req.bucket.is_classified();
        match (req.granularity, rollups) {
            (Granularity::Month, true) => self.months_with_rollups(req).await,
            (Granularity::Day, true) => self.days_with_rollups(req).await,
            _ => {
                let rows = self.live_stage_counts(req.bucket, req.start, req.end, req.granularity).await?;
                Ok((rows, 0))
            }
        }
    }

    async fn live_stage_counts(
        &self,
        bucket: Bucket,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
        granularity: Granularity,
    ) -> RecoveryResult<Vec<PeriodAggregateRow>> {
        let actions = Arc::clone(&self.actions);
        self.pool
            .call(move |l| l.stage_counts(bucket, start, end, granularity, &actions))
            .await
    }

    async fn months_with_rollups(&self, req: &SeriesRequest) -> RecoveryResult<(Vec<PeriodAggregateRow>, usize)> {
        let bucket = req.bucket;
        let today = self.clock.today();
        let lower = match req.start {
            Some(s) => Some(s),
            None => self.pool.call(move |l| l.earliest_event_date(bucket)).await?,
        };
        let upper = req.end.unwrap_or(today);
        let Some(lower) = lower.filter(|l| *l <= upper) else {
            let rows = self.live_stage_counts(bucket, req.start, req.end, Granularity::Month).await?;
            return Ok((rows, 0));
        };

        let months = YearMonth::span(YearMonth::of(lower), YearMonth::of(upper));
        let (first, last) = (months[0], months[months.len() - 1]);
        let snapshot = self.rollups.monthly(bucket, Some(first), Some(last)).await?;
        let current = YearMonth::of(today);

        let mut rows = Vec::new();
        let mut live_months = Vec::new();
        for ym in &months {
            let closed = *ym < current;
            let covered = req.start.map_or(true, |s| s <= ym.first_day())
                && req.end.map_or(true, |e| e >= ym.last_day());
            match snapshot.usable(*ym) {
                Some(row) if closed && covered => rows.push(PeriodAggregateRow {
                    period:    ym.key(),
                    aggregate: row.aggregate.clone(),
                }),
                _ => live_months.push(*ym),
            }
        }
        let from_rollup = rows.len();

        let segments = live_segments(&live_months, first, last, req.start, req.end);
        let scans = segments.into_iter().map(|seg| {
            self.live_stage_counts(bucket, seg.start, seg.end, Granularity::Month)
        });
        for live in try_join_all(scans).await? {
            rows.extend(live);
        }
        rows.sort_by(|a, b| a.period.cmp(&b.period));
        Ok((rows, from_rollup))
    }

    async fn days_with_rollups(&self, req: &SeriesRequest) -> RecoveryResult<(Vec<PeriodAggregateRow>, usize)> {
        let (mut rows, attempts) = tokio::try_join!(
            self.live_stage_counts(req.bucket, req.start, req.end, Granularity::Day),
            self.daily_attempts(req),
        )?;
        let (attempts, from_rollup) = attempts;
        let mut by_day: HashMap<PeriodKey, i64> = attempts;
        for row in &mut rows {
            if let Some(n) = by_day.remove(&row.period) {
                row.aggregate.attempts = n;
            }
        }
        for (period, n) in by_day {
            rows.push(PeriodAggregateRow {
                period,
                aggregate: AttemptAggregate { attempts: n, ..AttemptAggregate::default() },
            });
        }
        rows.sort_by(|a, b| a.period.cmp(&b.period));
        Ok((rows, from_rollup))
    }

    /// Attempts per day: rollup through the watermark (never past
    /// yesterday), live after it.
    async fn daily_attempts(&self, req: &SeriesRequest) -> RecoveryResult<(HashMap<PeriodKey, i64>, usize)> {
        let bucket = req.bucket;
        let yesterday = self.clock.today() - Duration::days(1);
        let watermark = self.rollups.daily_watermark(bucket).await?;
        let cutoff = watermark.map(|w| w.min(yesterday));

        let mut by_day = HashMap::new();
        let mut from_rollup = 0;
        if let Some(cutoff) = cutoff {
            let end = Some(req.end.map_or(cutoff, |e| e.min(cutoff)));
            for row in self.rollups.daily(bucket, req.start, end).await? {
                by_day.insert(Granularity::Day.period_key(row.day), row.attempts);
                from_rollup += 1;
            }
        }

        let live_start = match (cutoff, req.start) {
            (Some(c), Some(s)) => Some(s.max(c + Duration::days(1))),
            (Some(c), None) => Some(c + Duration::days(1)),
            (None, s) => s,
        };
        let live_end = req.end;
        let live = self
            .pool
            .call(move |l| l.attempts_by_day(bucket, live_start, live_end))
            .await?;
        for row in live {
            by_day.insert(Granularity::Day.period_key(row.day), row.attempts);
        }
        Ok((by_day, from_rollup))
    }

    // ── Secondary logs ─────────────────────────────────────────────────────

    async fn agreement_side(&self, req: &SeriesRequest) -> RecoveryResult<Vec<SecondaryRow>> {
        let SeriesRequest { bucket, start, end, granularity } = *req;
        let kind = self.actions.agreement_kind.clone();
        self.pool
            .call(move |l| l.agreements_by_period(bucket, start, end, granularity, &kind))
            .await
    }

    async fn payment_side(&self, req: &SeriesRequest) -> RecoveryResult<Vec<SecondaryRow>> {
        let SeriesRequest { bucket, start, end, granularity } = *req;
        self.pool
            .call(move |l| l.payments_by_period(bucket, start, end, granularity))
            .await
    }
}

/// Coalesce adjacent live months into date ranges. The first and last
/// month of the span keep the request's own bounds.
fn live_segments(
    live_months: &[YearMonth],
    first: YearMonth,
    last: YearMonth,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
) -> Vec<LiveSegment> {
    let bound_start = |ym: YearMonth| if ym == first { start } else { Some(ym.first_day()) };
    let bound_end = |ym: YearMonth| if ym == last { end } else { Some(ym.last_day()) };

    let mut segments = Vec::new();
    let mut run: Option<(YearMonth, YearMonth)> = None;
    for &ym in live_months {
        run = match run {
            Some((a, b)) if b.next() == ym => Some((a, ym)),
            Some((a, b)) => {
                segments.push(LiveSegment { start: bound_start(a), end: bound_end(b) });
                Some((ym, ym))
            }
            None => Some((ym, ym)),
        };
    }
    if let Some((a, b)) = run {
        segments.push(LiveSegment { start: bound_start(a), end: bound_end(b) });
    }
    segments
}

/// Union of period keys across the three sources; missing values are 0.
fn merge_sources(
    attempts: Vec<PeriodAggregateRow>,
    agreements: Vec<SecondaryRow>,
    payments: Vec<SecondaryRow>,
) -> Vec<SeriesPoint> {
    let mut points: BTreeMap<PeriodKey, SeriesPoint> = BTreeMap::new();
    let blank = |period: &PeriodKey| SeriesPoint { period: period.clone(), ..SeriesPoint::default() };

    for row in attempts {
        let a = row.aggregate;
        let point = points.entry(row.period.clone()).or_insert_with(|| blank(&row.period));
        point.attempts = a.attempts;
        point.amount = a.amount;
        point.stages.portfolio = a.portfolio;
        point.stages.contacted = a.contacted;
        point.stages.responded = a.responded;
        point.stages.right_party = a.right_party;
        point.stages.qualified = a.qualified;
    }
    for row in agreements {
        let point = points.entry(row.period.clone()).or_insert_with(|| blank(&row.period));
        point.stages.agreed = row.count;
        point.agreed_value = row.value;
    }
    for row in payments {
        let point = points.entry(row.period.clone()).or_insert_with(|| blank(&row.period));
        point.stages.paid = row.count;
        point.paid_amount = row.value;
    }

    points
        .into_values()
        .map(|mut p| {
            p.conversions = StageConversions::of(&p.stages);
            p
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ym(y: i32, m: u32) -> YearMonth {
        YearMonth::new(y, m).unwrap()
    }

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn adjacent_live_months_share_one_scan() {
        let live = [ym(2024, 1), ym(2024, 2), ym(2024, 5)];
        let segs = live_segments(&live, ym(2024, 1), ym(2024, 6), Some(d(2024, 1, 15)), None);
        assert_eq!(
            segs,
            vec![
                LiveSegment { start: Some(d(2024, 1, 15)), end: Some(d(2024, 2, 29)) },
                LiveSegment { start: Some(d(2024, 5, 1)), end: Some(d(2024, 5, 31)) },
            ]
        );
    }

    #[test]
    fn last_live_month_keeps_open_end() {
        let segs = live_segments(&[ym(2024, 6)], ym(2024, 1), ym(2024, 6), None, None);
        assert_eq!(segs, vec![LiveSegment { start: Some(d(2024, 6, 1)), end: None }]);
    }

    #[test]
    fn secondary_only_periods_appear_with_zero_attempts() {
        let points = merge_sources(
            vec![],
            vec![SecondaryRow { period: "2025-01".into(), count: 2, value: 500.0 }],
            vec![],
        );
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].attempts, 0);
        assert_eq!(points[0].stages.agreed, 2);
        assert_eq!(points[0].conversions.agreed_pct, 0.0);
    }
}
