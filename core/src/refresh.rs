//! Refresh reconciler: keeps the rollup tables in step with the raw log.
//!
//! Design:
//!   - Startup: per bucket, months present in the raw log but missing from
//!     the monthly rollup, plus months flagged stale, are rebuilt.
//!   - Periodic: every raw month in the trailing window (current month
//!     included) is rebuilt, plus stale months in the window. Older months
//!     are treated as closed.
//!   - On demand: both of the above.
//!   - Daily attempts: (watermark + 1) ..= yesterday, or from the bucket's
//!     first raw day when nothing is stored yet. Today is never written.
//!   - A unit is one (bucket, month) or one (bucket, day range). Units fail
//!     alone: the failure is logged and reported, siblings carry on.
//!     Buckets run concurrently.

use crate::{
    bucket::Bucket,
    cache::Invalidate,
    clock::Clock,
    config::RefreshConfig,
    error::{RecoveryError, RecoveryResult},
    rollup::RollupStore,
    store::StorePool,
    types::YearMonth,
};
use chrono::{Duration, NaiveDate};
use futures::future::join_all;
use log::{debug, info, warn};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshMode {
    Startup,
    Periodic,
    OnDemand,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshUnit {
    /// Deciding which months need work.
    Planning,
    Month(YearMonth),
    Days { from: NaiveDate, to: NaiveDate },
}

impl fmt::Display for RefreshUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Planning => f.write_str("planning"),
            Self::Month(ym) => write!(f, "month {ym}"),
            Self::Days { from, to } => write!(f, "days {from}..={to}"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UnitFailure {
    pub bucket:    Bucket,
    pub unit:      RefreshUnit,
    pub reason:    String,
    pub transient: bool,
}

impl UnitFailure {
    fn new(bucket: Bucket, unit: RefreshUnit, err: &RecoveryError) -> Self {
        Self {
            bucket,
            unit,
            reason: err.to_string(),
            transient: err.is_transient(),
        }
    }

    pub fn to_error(&self) -> RecoveryError {
        RecoveryError::ReconciliationUnit {
            bucket: self.bucket.to_string(),
            unit:   self.unit.to_string(),
            reason: self.reason.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshReport {
    pub mode:           RefreshMode,
    pub months_rebuilt: Vec<(Bucket, YearMonth)>,
    pub days_written:   usize,
    pub failures:       Vec<UnitFailure>,
}

impl RefreshReport {
    fn empty(mode: RefreshMode) -> Self {
        Self {
            mode,
            months_rebuilt: Vec::new(),
            days_written: 0,
            failures: Vec::new(),
        }
    }

    fn absorb(&mut self, other: RefreshReport) {
        self.months_rebuilt.extend(other.months_rebuilt);
        self.days_written += other.days_written;
        self.failures.extend(other.failures);
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn wrote_rows(&self) -> bool {
        !self.months_rebuilt.is_empty() || self.days_written > 0
    }
}

/// Months to rebuild for one bucket.
///
/// Without a window: raw months missing from the rollup, plus stale months.
/// With a window: every raw or stale month inside it.
pub fn plan_months(
    raw: &[YearMonth],
    stored: &[YearMonth],
    stale: &[YearMonth],
    window: Option<(YearMonth, YearMonth)>,
) -> Vec<YearMonth> {
    let mut plan: Vec<YearMonth> = match window {
        None => raw
            .iter()
            .filter(|m| !stored.contains(m))
            .chain(stale.iter())
            .copied()
            .collect(),
        Some((from, to)) => raw
            .iter()
            .chain(stale.iter())
            .filter(|m| **m >= from && **m <= to)
            .copied()
            .collect(),
    };
    plan.sort();
    plan.dedup();
    plan
}

pub struct RefreshReconciler {
    rollups:     RollupStore,
    pool:        StorePool,
    clock:       Arc<dyn Clock>,
    config:      RefreshConfig,
    invalidator: Option<(Arc<dyn Invalidate>, Vec<&'static str>)>,
}

impl RefreshReconciler {
    pub fn new(rollups: RollupStore, pool: StorePool, clock: Arc<dyn Clock>, config: RefreshConfig) -> Self {
        Self {
            rollups,
            pool,
            clock,
            config,
            invalidator: None,
        }
    }

    /// Cache prefixes to drop after any run that wrote rollup rows.
    pub fn with_invalidator(mut self, cache: Arc<dyn Invalidate>, prefixes: Vec<&'static str>) -> Self {
        self.invalidator = Some((cache, prefixes));
        self
    }

    pub async fn run(&self, mode: RefreshMode) -> RefreshReport {
        let per_bucket = join_all(
            Bucket::CLASSIFIED
                .iter()
                .map(|b| self.reconcile_bucket(*b, mode)),
        )
        .await;

        let mut report = RefreshReport::empty(mode);
        for r in per_bucket {
            report.absorb(r);
        }

        if report.wrote_rows() {
            if let Some((cache, prefixes)) = &self.invalidator {
                let dropped: usize = prefixes.iter().map(|p| cache.invalidate_prefix(p)).sum();
                debug!("refresh invalidated {dropped} cached views");
            }
        }
        info!(
            "refresh {:?}: {} months rebuilt, {} days written, {} failures",
            mode,
            report.months_rebuilt.len(),
            report.days_written,
            report.failures.len()
        );
        report
    }

    async fn reconcile_bucket(&self, bucket: Bucket, mode: RefreshMode) -> RefreshReport {
        let mut report = RefreshReport::empty(mode);

        match self.plan(bucket, mode).await {
            Ok(months) => {
                for ym in months {
                    match self.rollups.replace_month(bucket, ym).await {
                        Ok(()) => {
                            debug!("rollup {bucket} {ym} rebuilt");
                            report.months_rebuilt.push((bucket, ym));
                        }
                        Err(e) => {
                            warn!("rollup {bucket} {ym} failed: {e}");
                            report.failures.push(UnitFailure::new(bucket, RefreshUnit::Month(ym), &e));
                        }
                    }
                }
            }
            Err(e) => {
                warn!("rollup planning for {bucket} failed: {e}");
                report.failures.push(UnitFailure::new(bucket, RefreshUnit::Planning, &e));
            }
        }

        match self.daily_range(bucket).await {
            Ok(Some((from, to))) => match self.rollups.extend_daily(bucket, from, to).await {
                Ok(written) => {
                    debug!("daily attempts {bucket} {from}..={to}: {written} days");
                    report.days_written += written;
                }
                Err(e) => {
                    warn!("daily attempts {bucket} {from}..={to} failed: {e}");
                    report
                        .failures
                        .push(UnitFailure::new(bucket, RefreshUnit::Days { from, to }, &e));
                }
            },
            Ok(None) => {}
            Err(e) => {
                warn!("daily watermark for {bucket} failed: {e}");
                report.failures.push(UnitFailure::new(bucket, RefreshUnit::Planning, &e));
            }
        }

        report
    }

    async fn plan(&self, bucket: Bucket, mode: RefreshMode) -> RecoveryResult<Vec<YearMonth>> {
        let raw = self.pool.call(move |l| l.event_months(bucket)).await?;
        let stored = self.rollups.stored_months(bucket).await?;
        let stale = self.rollups.stale_months(bucket).await?;

        let current = YearMonth::of(self.clock.today());
        let window = (current.minus(self.config.trailing_months.saturating_sub(1)), current);

        let plan = match mode {
            RefreshMode::Startup => plan_months(&raw, &stored, &stale, None),
            RefreshMode::Periodic => plan_months(&raw, &stored, &stale, Some(window)),
            RefreshMode::OnDemand => {
                let mut all = plan_months(&raw, &stored, &stale, None);
                all.extend(plan_months(&raw, &stored, &stale, Some(window)));
                all.sort();
                all.dedup();
                all
            }
        };
        Ok(plan)
    }

    /// Days still to append for the bucket, if any.
    async fn daily_range(&self, bucket: Bucket) -> RecoveryResult<Option<(NaiveDate, NaiveDate)>> {
        let yesterday = self.clock.today() - Duration::days(1);
        let from = match self.rollups.daily_watermark(bucket).await? {
            Some(w) => w + Duration::days(1),
            None => match self.pool.call(move |l| l.earliest_event_date(bucket)).await? {
                Some(first) => first,
                None => return Ok(None),
            },
        };
        Ok((from <= yesterday).then_some((from, yesterday)))
    }

    // ── Background loop ────────────────────────────────────────────────────

    /// Start the periodic loop. The first periodic pass runs one interval
    /// from now; startup reconciliation is the caller's job.
    pub fn spawn(self: Arc<Self>) -> RefreshHandle {
        let (tx, rx) = mpsc::channel::<RefreshSignal>(8);
        let task = tokio::spawn(self.refresh_loop(rx));
        RefreshHandle { tx, task }
    }

    async fn refresh_loop(self: Arc<Self>, mut rx: mpsc::Receiver<RefreshSignal>) {
        let period = std::time::Duration::from_secs(self.config.interval_secs);
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run(RefreshMode::Periodic).await;
                }
                msg = rx.recv() => {
                    match msg {
                        Some(RefreshSignal::RunNow(reply)) => {
                            let report = self.run(RefreshMode::OnDemand).await;
                            let _ = reply.send(report);
                        }
                        Some(RefreshSignal::Shutdown) | None => {
                            info!("refresh loop shutting down");
                            break;
                        }
                    }
                }
            }
        }
    }
}

enum RefreshSignal {
    RunNow(oneshot::Sender<RefreshReport>),
    Shutdown,
}

pub struct RefreshHandle {
    tx:   mpsc::Sender<RefreshSignal>,
    task: JoinHandle<()>,
}

impl RefreshHandle {
    /// Run an on-demand pass inside the loop and wait for its report.
    /// `None` once the loop has stopped.
    pub async fn trigger(&self) -> Option<RefreshReport> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(RefreshSignal::RunNow(reply)).await.ok()?;
        rx.await.ok()
    }

    pub async fn shutdown(self) {
        let _ = self.tx.send(RefreshSignal::Shutdown).await;
        let _ = self.task.await;
    }
}
