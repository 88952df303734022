//! Analytics facade: the operations the API layer calls.
//!
//! Build wires the store, cache, aggregator and reconciler together and
//! probes the database once to decide whether rollups can be used.
//!
//! RULE: Only successful results are cached. Every storage error reaches
//! the caller unchanged.

use crate::{
    bucket::Bucket,
    cache::{cache_key, Invalidate, QueryCache},
    clock::Clock,
    config::RecoveryConfig,
    error::{RecoveryError, RecoveryResult},
    production::{top_collectors, TopCollectors, DEFAULT_LOOKBACK_MONTHS},
    quartile::{rank_quartiles, trajectory, QuartileReport, TrajectoryPoint, VolumeMeasure},
    refresh::{RefreshHandle, RefreshMode, RefreshReconciler, RefreshReport},
    rollup::RollupStore,
    series::{BucketSeries, SeriesRequest, SeriesStrategy, TimeSeriesAggregator},
    store::{StorePool, VolumeScope},
    types::{CollectorId, Granularity, YearMonth},
};
use chrono::{Months, NaiveDate};
use futures::future::try_join_all;
use log::{info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;

pub const SERIES_PREFIX: &str = "series";
pub const DASHBOARD_PREFIX: &str = "dashboard";
pub const QUARTILE_PREFIX: &str = "quartiles";
pub const TRAJECTORY_PREFIX: &str = "trajectory";
pub const PRODUCTION_PREFIX: &str = "production";

/// Everything the facade keeps in its cache.
#[derive(Debug, Clone)]
pub enum CachedView {
    Series(Arc<BucketSeries>),
    Dashboard(Arc<Dashboard>),
    Quartiles(Arc<QuartileReport>),
    Trajectory(Arc<Vec<TrajectoryPoint>>),
    Production(Arc<TopCollectors>),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BucketTotals {
    pub bucket:       Bucket,
    pub attempts:     i64,
    pub amount:       f64,
    pub agreed:       i64,
    pub agreed_value: f64,
    pub paid:         i64,
    pub paid_amount:  f64,
}

impl BucketTotals {
    fn of(series: &BucketSeries) -> Self {
        let mut t = Self {
            bucket:       series.bucket,
            attempts:     0,
            amount:       0.0,
            agreed:       0,
            agreed_value: 0.0,
            paid:         0,
            paid_amount:  0.0,
        };
        for p in &series.points {
            t.attempts += p.attempts;
            t.amount += p.amount;
            t.agreed += p.stages.agreed;
            t.agreed_value += p.agreed_value;
            t.paid += p.stages.paid;
            t.paid_amount += p.paid_amount;
        }
        t
    }
}

/// The four classified buckets side by side.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Dashboard {
    pub granularity: Granularity,
    pub start:       Option<NaiveDate>,
    pub end:         Option<NaiveDate>,
    pub buckets:     Vec<BucketSeries>,
    pub totals:      Vec<BucketTotals>,
}

/// One labelled date range of a period comparison.
#[derive(Debug, Clone, PartialEq)]
pub struct NamedPeriod {
    /// Defaults to `Period N`, counting from one.
    pub name:  Option<String>,
    pub start: NaiveDate,
    pub end:   NaiveDate,
}

impl NamedPeriod {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { name: None, start, end }
    }

    pub fn named(name: impl Into<String>, start: NaiveDate, end: NaiveDate) -> Self {
        Self { name: Some(name.into()), start, end }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeriodSeries {
    pub name:   String,
    pub start:  NaiveDate,
    pub end:    NaiveDate,
    pub series: BucketSeries,
    pub totals: BucketTotals,
}

/// The same bucket metrics over several date ranges, in request order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeriodComparison {
    pub bucket:      Bucket,
    pub granularity: Granularity,
    pub periods:     Vec<PeriodSeries>,
}

#[derive(Debug, Clone, Default)]
pub struct QuartileQuery {
    pub start:         Option<NaiveDate>,
    pub end:           Option<NaiveDate>,
    /// `None` ranks across every bucket.
    pub bucket:        Option<Bucket>,
    /// `None` uses the configured measure.
    pub measure:       Option<VolumeMeasure>,
    /// Rank only these collectors.
    pub collectors:    Option<Vec<CollectorId>>,
    pub force_refresh: bool,
}

fn date_part(d: Option<NaiveDate>) -> String {
    d.map_or_else(|| "-".to_string(), |d| d.format("%Y-%m-%d").to_string())
}

/// Collector ids as a JSON array, so no id can forge a separator.
fn ids_part(ids: Option<&[CollectorId]>) -> RecoveryResult<String> {
    match ids {
        None => Ok("*".to_string()),
        Some(ids) => {
            let mut sorted: Vec<&str> = ids.iter().map(String::as_str).collect();
            sorted.sort_unstable();
            sorted.dedup();
            Ok(serde_json::to_string(&sorted)?)
        }
    }
}

pub struct RecoveryAnalytics {
    config:       RecoveryConfig,
    clock:        Arc<dyn Clock>,
    pool:         StorePool,
    cache:        Arc<QueryCache<CachedView>>,
    rollups:      RollupStore,
    series:       TimeSeriesAggregator,
    reconciler:   Option<Arc<RefreshReconciler>>,
    refresh_loop: Mutex<Option<RefreshHandle>>,
}

impl RecoveryAnalytics {
    /// Open the configured database and build on it.
    pub async fn open(config: RecoveryConfig, clock: Arc<dyn Clock>) -> RecoveryResult<Self> {
        config.validate()?;
        let pool = StorePool::open(&config.database)?;
        Self::build(config, pool, clock).await
    }

    pub async fn build(config: RecoveryConfig, pool: StorePool, clock: Arc<dyn Clock>) -> RecoveryResult<Self> {
        config.validate()?;
        let actions = Arc::new(config.actions.clone());
        let rollups = RollupStore::new(pool.clone(), Arc::clone(&actions));

        let has_rollups = rollups.available().await?;
        let strategy = if has_rollups && config.series.prefer_rollups {
            SeriesStrategy::RollupBacked
        } else {
            SeriesStrategy::LiveScan
        };
        if !has_rollups {
            warn!("rollup tables not found; series served from live scans, refresh disabled");
        }
        info!("analytics strategy: {strategy:?}");

        let cache = Arc::new(QueryCache::new(config.cache.default_ttl(), Arc::clone(&clock)));
        let reconciler = has_rollups.then(|| {
            let invalidator: Arc<dyn Invalidate> = cache.clone();
            Arc::new(
                RefreshReconciler::new(rollups.clone(), pool.clone(), Arc::clone(&clock), config.refresh.clone())
                    .with_invalidator(invalidator, vec![SERIES_PREFIX, DASHBOARD_PREFIX]),
            )
        });
        let series = TimeSeriesAggregator::new(
            pool.clone(),
            rollups.clone(),
            Arc::clone(&clock),
            actions,
            strategy,
        );

        Ok(Self {
            config,
            clock,
            pool,
            cache,
            rollups,
            series,
            reconciler,
            refresh_loop: Mutex::new(None),
        })
    }

    pub fn strategy(&self) -> SeriesStrategy {
        self.series.strategy()
    }

    pub fn cache(&self) -> &Arc<QueryCache<CachedView>> {
        &self.cache
    }

    pub fn pool(&self) -> &StorePool {
        &self.pool
    }

    // ── Lifecycle ──────────────────────────────────────────────────────────

    /// Startup reconciliation (when configured), then the cache sweeper and
    /// the periodic refresh loop. Must run inside a tokio runtime.
    pub async fn start(&self) -> Option<RefreshReport> {
        let report = match &self.reconciler {
            Some(r) if self.config.refresh.run_on_startup => Some(r.run(RefreshMode::Startup).await),
            _ => None,
        };
        self.cache.start(self.config.cache.sweep_interval());
        if let (Some(r), true) = (&self.reconciler, self.config.refresh.enabled) {
            let mut slot = self.refresh_loop.lock();
            if slot.is_none() {
                *slot = Some(Arc::clone(r).spawn());
            }
        }
        report
    }

    pub async fn shutdown(&self) {
        let handle = self.refresh_loop.lock().take();
        if let Some(h) = handle {
            h.shutdown().await;
        }
        self.cache.shutdown().await;
        info!("analytics shut down");
    }

    // ── Series ─────────────────────────────────────────────────────────────

    pub async fn get_bucket_series(
        &self,
        bucket: Bucket,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
        granularity: Granularity,
    ) -> RecoveryResult<Arc<BucketSeries>> {
        self.get_bucket_series_with(SeriesRequest { bucket, start, end, granularity }, false)
            .await
    }

    pub async fn get_bucket_series_with(
        &self,
        req: SeriesRequest,
        force_refresh: bool,
    ) -> RecoveryResult<Arc<BucketSeries>> {
        req.validate()?;
        let key = cache_key(
            SERIES_PREFIX,
            &[req.bucket.tag(), req.granularity.as_str(), date_part(req.start).as_str(), date_part(req.end).as_str()],
        );
        if force_refresh {
            self.cache.clear(Some(&key));
        } else if let Some(CachedView::Series(hit)) = self.cache.get(&key) {
            return Ok(hit);
        }
        let series = Arc::new(self.series.get_series(req).await?);
        self.cache.set(key, CachedView::Series(Arc::clone(&series)), None);
        Ok(series)
    }

    /// All four classified buckets, fetched concurrently. Any failure
    /// fails the whole dashboard.
    pub async fn get_dashboard(
        &self,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
        granularity: Granularity,
    ) -> RecoveryResult<Arc<Dashboard>> {
        let key = cache_key(
            DASHBOARD_PREFIX,
            &[granularity.as_str(), date_part(start).as_str(), date_part(end).as_str()],
        );
        if let Some(CachedView::Dashboard(hit)) = self.cache.get(&key) {
            return Ok(hit);
        }
        let buckets = try_join_all(
            Bucket::CLASSIFIED
                .iter()
                .map(|b| self.get_bucket_series(*b, start, end, granularity)),
        )
        .await?;
        let totals = buckets.iter().map(|s| BucketTotals::of(s)).collect();
        let buckets = buckets.iter().map(|s| BucketSeries::clone(s)).collect();
        let dashboard = Arc::new(Dashboard { granularity, start, end, buckets, totals });
        self.cache.set(key, CachedView::Dashboard(Arc::clone(&dashboard)), None);
        Ok(dashboard)
    }

    /// One bucket over several named date ranges, fetched concurrently.
    /// Any failing period fails the comparison.
    pub async fn get_period_comparison(
        &self,
        periods: Vec<NamedPeriod>,
        bucket: Bucket,
        granularity: Granularity,
    ) -> RecoveryResult<PeriodComparison> {
        if periods.is_empty() {
            return Err(RecoveryError::config("period comparison needs at least one period"));
        }
        let series = try_join_all(
            periods
                .iter()
                .map(|p| self.get_bucket_series(bucket, Some(p.start), Some(p.end), granularity)),
        )
        .await?;
        let periods = periods
            .into_iter()
            .zip(series)
            .enumerate()
            .map(|(i, (period, series))| PeriodSeries {
                name:   period.name.unwrap_or_else(|| format!("Period {}", i + 1)),
                start:  period.start,
                end:    period.end,
                totals: BucketTotals::of(&series),
                series: BucketSeries::clone(&series),
            })
            .collect();
        Ok(PeriodComparison { bucket, granularity, periods })
    }

    // ── Production ─────────────────────────────────────────────────────────

    /// The `limit` collectors with the highest received value. A missing
    /// end means today; a missing start goes back two calendar months
    /// from the end.
    pub async fn get_top_collectors(
        &self,
        limit: usize,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> RecoveryResult<Arc<TopCollectors>> {
        if limit == 0 {
            return Err(RecoveryError::config("top collector limit must be positive"));
        }
        let end = end.unwrap_or_else(|| self.clock.today());
        let start = match start {
            Some(s) => s,
            None => end
                .checked_sub_months(Months::new(DEFAULT_LOOKBACK_MONTHS))
                .ok_or_else(|| RecoveryError::config(format!("no default start before {end}")))?,
        };
        check_range(Some(start), Some(end))?;
        let key = cache_key(
            PRODUCTION_PREFIX,
            &[limit.to_string().as_str(), date_part(Some(start)).as_str(), date_part(Some(end)).as_str()],
        );
        if let Some(CachedView::Production(hit)) = self.cache.get(&key) {
            return Ok(hit);
        }

        let report = self
            .pool
            .call(move |l| {
                let top = l.top_receipts(start, end, limit)?;
                let ids: Vec<CollectorId> = top.iter().map(|r| r.collector_id.clone()).collect();
                let monthly = l.monthly_receipts(start, end, &ids)?;
                let months = l.receipt_month_count(start, end)?;
                let totals = l.receipt_totals(start, end)?;
                Ok(top_collectors(start, end, months, totals, top, monthly))
            })
            .await?;
        let report = Arc::new(report);
        self.cache.set(key, CachedView::Production(Arc::clone(&report)), None);
        Ok(report)
    }

    // ── Quartiles ──────────────────────────────────────────────────────────

    pub async fn get_quartiles(
        &self,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
        entity_subset: Option<Vec<CollectorId>>,
    ) -> RecoveryResult<Arc<QuartileReport>> {
        self.get_quartiles_with(QuartileQuery {
            start,
            end,
            collectors: entity_subset,
            ..QuartileQuery::default()
        })
        .await
    }

    pub async fn get_quartiles_with(&self, query: QuartileQuery) -> RecoveryResult<Arc<QuartileReport>> {
        check_range(query.start, query.end)?;
        let bucket = query.bucket.unwrap_or(Bucket::All);
        let measure = query.measure.unwrap_or(self.config.ranking.measure);
        let key = cache_key(
            QUARTILE_PREFIX,
            &[
                bucket.tag(),
                measure.as_str(),
                date_part(query.start).as_str(),
                date_part(query.end).as_str(),
                ids_part(query.collectors.as_deref())?.as_str(),
            ],
        );
        if query.force_refresh {
            self.cache.clear(Some(&key));
        } else if let Some(CachedView::Quartiles(hit)) = self.cache.get(&key) {
            return Ok(hit);
        }

        let agreement_action = self.config.actions.agreement_action.clone();
        let QuartileQuery { start, end, collectors, .. } = query;
        let ttl = collectors.as_ref().map(|_| self.config.cache.filtered_ttl());
        let volumes = self
            .pool
            .call(move |l| {
                l.collector_volumes(&VolumeScope {
                    bucket,
                    start,
                    end,
                    measure,
                    agreement_action: &agreement_action,
                    collectors: collectors.as_deref(),
                })
            })
            .await?;

        let report = Arc::new(rank_quartiles(volumes));
        self.cache.set(key, CachedView::Quartiles(Arc::clone(&report)), ttl);
        Ok(report)
    }

    /// Day-by-day quartile of each collector. Both ends of the range are
    /// required. Each day ranks its full population; `entity_filter` only
    /// limits the rows returned.
    pub async fn get_quartile_trajectory(
        &self,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
        entity_filter: Option<Vec<CollectorId>>,
    ) -> RecoveryResult<Arc<Vec<TrajectoryPoint>>> {
        let (Some(start), Some(end)) = (start, end) else {
            return Err(RecoveryError::config("trajectory requires both start and end dates"));
        };
        check_range(Some(start), Some(end))?;
        let measure = self.config.ranking.measure;
        let key = cache_key(
            TRAJECTORY_PREFIX,
            &[
                measure.as_str(),
                date_part(Some(start)).as_str(),
                date_part(Some(end)).as_str(),
                ids_part(entity_filter.as_deref())?.as_str(),
            ],
        );
        if let Some(CachedView::Trajectory(hit)) = self.cache.get(&key) {
            return Ok(hit);
        }

        let agreement_action = self.config.actions.agreement_action.clone();
        let days = self
            .pool
            .call(move |l| {
                l.collector_volumes_by_day(&VolumeScope {
                    bucket: Bucket::All,
                    start: Some(start),
                    end: Some(end),
                    measure,
                    agreement_action: &agreement_action,
                    collectors: None,
                })
            })
            .await?;

        let ttl = entity_filter.as_ref().map(|_| self.config.cache.filtered_ttl());
        let filter: Option<HashSet<CollectorId>> = entity_filter.map(|ids| ids.into_iter().collect());
        let points = Arc::new(trajectory(days, filter.as_ref()));
        self.cache.set(key, CachedView::Trajectory(Arc::clone(&points)), ttl);
        Ok(points)
    }

    // ── Maintenance ────────────────────────────────────────────────────────

    /// Run a full on-demand reconciliation now.
    pub async fn refresh_now(&self) -> RecoveryResult<RefreshReport> {
        let reconciler = self
            .reconciler
            .as_ref()
            .ok_or_else(|| RecoveryError::config("rollup tables not available; nothing to refresh"))?;
        Ok(reconciler.run(RefreshMode::OnDemand).await)
    }

    /// Drop cached views whose key starts with `prefix`.
    pub fn cache_invalidate(&self, prefix: &str) -> usize {
        self.cache.clear_by_prefix(prefix)
    }

    /// Flag a month for recompute on the next refresh, and drop cached
    /// views that may include it.
    pub async fn mark_month_stale(&self, bucket: Bucket, ym: YearMonth) -> RecoveryResult<()> {
        if !bucket.is_classified() {
            return Err(RecoveryError::config("only classified buckets have rollups"));
        }
        if self.reconciler.is_none() {
            return Err(RecoveryError::config("rollup tables not available"));
        }
        self.rollups.mark_stale(bucket, ym, self.clock.now()).await?;
        self.cache.clear_by_prefix(SERIES_PREFIX);
        self.cache.clear_by_prefix(DASHBOARD_PREFIX);
        Ok(())
    }
}

fn check_range(start: Option<NaiveDate>, end: Option<NaiveDate>) -> RecoveryResult<()> {
    match (start, end) {
        (Some(s), Some(e)) if s > e => Err(RecoveryError::config(format!("start {s} is after end {e}"))),
        _ => Ok(()),
    }
}
