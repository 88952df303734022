//! Integration tests for the bucket time series.
//!
//! Tests verify:
//! 1. The two-collector example: one day row with 13 attempts
//! 2. Stage counts and conversion percentages on a hand-built day
//! 3. Agreement and payment logs merge by period; missing keys are zero
//! 4. Week keys are Mondays
//! 5. Rollup-backed and live series agree over closed months and days
//! 6. Partial edge months are scanned live, inner months come from rollups
//! 7. Stale months are served live until rebuilt
//! 8. Today is always live
//! 9. Missing rollup tables select the live strategy
//! 10. Dashboard returns the four classified buckets
//! 11. Bad ranges are configuration errors
//! 12. A storage failure in one bucket fails the dashboard and caches nothing
//! 13. Period comparisons keep request order and label unnamed periods

use chrono::NaiveDate;
use recovery_core::{
    analytics::{NamedPeriod, RecoveryAnalytics, DASHBOARD_PREFIX},
    bucket::Bucket,
    clock::ManualClock,
    config::RecoveryConfig,
    error::RecoveryError,
    series::{SeriesRequest, SeriesStrategy},
    store::{Ledger, NewAgreement, NewCollectionEvent, NewPayment, StorePool},
    synth::{self, LogProfile},
    types::{Granularity, YearMonth},
};
use std::path::PathBuf;
use std::sync::Arc;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
}

fn event(account: &str, collector: &str, action: &str, date: NaiveDate, days: i64, amount: Option<f64>) -> NewCollectionEvent {
    NewCollectionEvent {
        account_id:              Some(account.to_string()),
        delinquency_days:        Some(days),
        legacy_delinquency_days: None,
        action_code:             Some(action.to_string()),
        collector_id:            Some(collector.to_string()),
        event_date:              date,
        amount,
    }
}

fn pool() -> StorePool {
    StorePool::open(&RecoveryConfig::default_test().database).unwrap()
}

/// Build analytics over `pool` with the clock pinned to `today`.
async fn build(pool: StorePool, today: NaiveDate, prefer_rollups: bool) -> RecoveryAnalytics {
    init_logging();
    let mut config = RecoveryConfig::default_test();
    config.series.prefer_rollups = prefer_rollups;
    RecoveryAnalytics::build(config, pool, Arc::new(ManualClock::on(today)))
        .await
        .unwrap()
}

fn seed_synthetic(pool: &StorePool, seed: u64, start: NaiveDate, end: NaiveDate) {
    let profile = LogProfile { attempts_per_day: 60, accounts: 250, ..LogProfile::default() };
    let log = synth::generate(seed, &profile, start, end);
    pool.with_ledger(|l| log.write(l)).unwrap();
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 1: two collectors on one day
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn two_collector_example_sums_to_thirteen() {
    let pool = pool();
    pool.with_ledger(|l: &Ledger| {
        for i in 0..10 {
            l.insert_event(&event(&format!("a7-{i}"), "7", "CSA", d(2025, 1, 5), 70, None))?;
        }
        for i in 0..3 {
            l.insert_event(&event(&format!("a9-{i}"), "9", "CSA", d(2025, 1, 5), 70, None))?;
        }
        Ok(())
    })
    .unwrap();

    let analytics = build(pool, d(2025, 2, 10), true).await;
    let live = analytics
        .get_bucket_series(Bucket::B1, Some(d(2025, 1, 1)), Some(d(2025, 1, 31)), Granularity::Day)
        .await
        .unwrap();
    assert_eq!(live.points.len(), 1);
    assert_eq!(live.points[0].period, "2025-01-05");
    assert_eq!(live.points[0].attempts, 13);

    // Same answer once the daily rollup holds the day.
    let report = analytics.refresh_now().await.unwrap();
    assert!(report.is_clean(), "refresh failures: {:?}", report.failures);
    let rolled = analytics
        .get_bucket_series(Bucket::B1, Some(d(2025, 1, 1)), Some(d(2025, 1, 31)), Granularity::Day)
        .await
        .unwrap();
    assert_eq!(rolled.points[0].attempts, 13);
    assert_eq!(rolled.rollup_periods, 1);

    // Other buckets see nothing.
    let b2 = analytics
        .get_bucket_series(Bucket::B2, Some(d(2025, 1, 1)), Some(d(2025, 1, 31)), Granularity::Day)
        .await
        .unwrap();
    assert!(b2.points.is_empty());
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 2: stage definitions and conversions
// ─────────────────────────────────────────────────────────────────────────────

fn funnel_fixture(l: &Ledger) -> recovery_core::error::RecoveryResult<()> {
    let day = d(2025, 1, 8);
    l.insert_event(&event("A", "C1", "CSA", day, 100, None))?;
    l.insert_event(&event("B", "C1", "EIO", day, 100, None))?;
    l.insert_event(&event("C", "0", "", day, 100, None))?;
    l.insert_event(&event("D", "C2", "DDA", day, 100, Some(300.0)))?;
    l.insert_agreement(&NewAgreement {
        account_id:              "D".into(),
        delinquency_days:        Some(100),
        legacy_delinquency_days: None,
        kind:                    "NOV".into(),
        issued_on:               day,
        total_value:             1200.0,
    })?;
    l.insert_agreement(&NewAgreement {
        account_id:              "B".into(),
        delinquency_days:        Some(100),
        legacy_delinquency_days: None,
        kind:                    "REN".into(),
        issued_on:               day,
        total_value:             900.0,
    })?;
    l.insert_payment(&NewPayment {
        account_id:              Some("D".into()),
        delinquency_days:        None,
        legacy_delinquency_days: Some(100),
        collector_id:            Some("C2".into()),
        paid_on:                 day,
        amount_received:         150.0,
    })?;
    l.insert_payment(&NewPayment {
        account_id:              Some("A".into()),
        delinquency_days:        Some(100),
        legacy_delinquency_days: None,
        collector_id:            None,
        paid_on:                 day,
        amount_received:         0.0,
    })?;
    // An agreement on a day with no attempts.
    l.insert_agreement(&NewAgreement {
        account_id:              "E".into(),
        delinquency_days:        Some(120),
        legacy_delinquency_days: None,
        kind:                    "NOV".into(),
        issued_on:               d(2025, 1, 9),
        total_value:             500.0,
    })?;
    Ok(())
}

#[tokio::test]
async fn stage_counts_and_conversions() {
    let pool = pool();
    pool.with_ledger(funnel_fixture).unwrap();
    let analytics = build(pool, d(2025, 3, 1), false).await;

    let series = analytics
        .get_bucket_series(Bucket::B2, Some(d(2025, 1, 1)), Some(d(2025, 1, 31)), Granularity::Day)
        .await
        .unwrap();
    let p = series.point("2025-01-08").expect("day row present");

    assert_eq!(p.stages.portfolio, 4);
    assert_eq!(p.stages.contacted, 3, "blank action is not a contact");
    assert_eq!(p.stages.responded, 3, "collector '0' is not a response");
    assert_eq!(p.stages.right_party, 3);
    assert_eq!(p.stages.qualified, 2, "EIO is right-party but not qualified");
    assert_eq!(p.stages.agreed, 1, "only NOV agreements count");
    assert_eq!(p.stages.paid, 1, "zero payments do not count");
    assert_eq!(p.attempts, 4);
    assert_eq!(p.amount, 300.0);
    assert_eq!(p.agreed_value, 1200.0);
    assert_eq!(p.paid_amount, 150.0);

    assert_eq!(p.conversions.contacted_pct, 75.0);
    assert_eq!(p.conversions.responded_pct, 100.0);
    assert_eq!(p.conversions.right_party_pct, 100.0);
    assert_eq!(p.conversions.qualified_pct, 66.67);
    assert_eq!(p.conversions.agreed_pct, 50.0);
    assert_eq!(p.conversions.paid_pct, 100.0);
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 3: secondary-only periods
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn secondary_only_period_defaults_to_zero() {
    let pool = pool();
    pool.with_ledger(funnel_fixture).unwrap();
    let analytics = build(pool, d(2025, 3, 1), false).await;

    let series = analytics
        .get_bucket_series(Bucket::B2, Some(d(2025, 1, 1)), Some(d(2025, 1, 31)), Granularity::Day)
        .await
        .unwrap();
    let keys: Vec<&str> = series.points.iter().map(|p| p.period.as_str()).collect();
    assert_eq!(keys, vec!["2025-01-08", "2025-01-09"]);

    let p = series.point("2025-01-09").unwrap();
    assert_eq!(p.attempts, 0);
    assert_eq!(p.stages.portfolio, 0);
    assert_eq!(p.stages.agreed, 1);
    assert_eq!(p.conversions.contacted_pct, 0.0);
    assert_eq!(p.conversions.agreed_pct, 0.0);
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 4: week keys
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn week_series_keys_on_monday() {
    let pool = pool();
    pool.with_ledger(|l| {
        l.insert_event(&event("A", "C1", "CSA", d(2025, 1, 5), 70, None))?; // Sunday
        l.insert_event(&event("B", "C1", "CSA", d(2025, 1, 6), 70, None))?; // Monday
        l.insert_event(&event("C", "C1", "CSA", d(2025, 1, 12), 70, None))?; // Sunday
        Ok(())
    })
    .unwrap();
    let analytics = build(pool, d(2025, 3, 1), true).await;

    let series = analytics
        .get_bucket_series(Bucket::B1, None, None, Granularity::Week)
        .await
        .unwrap();
    let weeks: Vec<(&str, i64)> = series.points.iter().map(|p| (p.period.as_str(), p.attempts)).collect();
    assert_eq!(weeks, vec![("2024-12-30", 1), ("2025-01-06", 2)]);
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 5: rollup-backed equals live
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn rollup_and_live_series_agree() {
    let today = d(2025, 4, 15);
    let pool = pool();
    seed_synthetic(&pool, 11, d(2024, 11, 1), today);

    let rolled = build(pool.clone(), today, true).await;
    let live = build(pool, today, false).await;
    assert_eq!(rolled.strategy(), SeriesStrategy::RollupBacked);
    assert_eq!(live.strategy(), SeriesStrategy::LiveScan);
    let report = rolled.refresh_now().await.unwrap();
    assert!(report.is_clean());

    for bucket in Bucket::CLASSIFIED {
        let closed = SeriesRequest {
            bucket,
            start: Some(d(2024, 11, 1)),
            end: Some(d(2025, 3, 31)),
            granularity: Granularity::Month,
        };
        let a = rolled.get_bucket_series_with(closed, false).await.unwrap();
        let b = live.get_bucket_series_with(closed, false).await.unwrap();
        assert_eq!(a.rollup_periods, 5, "{bucket}: all closed months from rollup");
        assert_eq!(b.rollup_periods, 0);
        assert_eq!(a.points, b.points, "{bucket}: monthly series diverged");

        let open = SeriesRequest { start: None, end: None, ..closed };
        let a = rolled.get_bucket_series_with(open, false).await.unwrap();
        let b = live.get_bucket_series_with(open, false).await.unwrap();
        assert_eq!(a.points, b.points, "{bucket}: open-ended monthly series diverged");
        assert!(a.point("2025-04").is_some(), "{bucket}: current month present");

        let days = SeriesRequest {
            bucket,
            start: Some(d(2025, 1, 1)),
            end: Some(today),
            granularity: Granularity::Day,
        };
        let a = rolled.get_bucket_series_with(days, false).await.unwrap();
        let b = live.get_bucket_series_with(days, false).await.unwrap();
        assert!(a.rollup_periods > 0, "{bucket}: daily attempts from rollup");
        assert_eq!(a.points, b.points, "{bucket}: daily series diverged");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 6: partial edge months
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn partial_edge_months_are_live() {
    let today = d(2025, 4, 15);
    let pool = pool();
    seed_synthetic(&pool, 12, d(2024, 11, 1), today);
    let rolled = build(pool.clone(), today, true).await;
    let live = build(pool, today, false).await;
    rolled.refresh_now().await.unwrap();

    let req = SeriesRequest {
        bucket: Bucket::B3,
        start: Some(d(2024, 12, 15)),
        end: Some(d(2025, 2, 10)),
        granularity: Granularity::Month,
    };
    let a = rolled.get_bucket_series_with(req, false).await.unwrap();
    let b = live.get_bucket_series_with(req, false).await.unwrap();
    assert_eq!(a.rollup_periods, 1, "only January is fully inside the range");
    assert_eq!(a.points, b.points);
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 7: stale months
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn stale_month_served_live_until_rebuilt() {
    let today = d(2025, 4, 15);
    let pool = pool();
    seed_synthetic(&pool, 13, d(2024, 11, 1), today);
    let analytics = build(pool, today, true).await;
    analytics.refresh_now().await.unwrap();

    let req = SeriesRequest {
        bucket: Bucket::B1,
        start: Some(d(2024, 12, 1)),
        end: Some(d(2024, 12, 31)),
        granularity: Granularity::Month,
    };
    let before = analytics.get_bucket_series_with(req, false).await.unwrap();
    let base = before.point("2024-12").map_or(0, |p| p.attempts);

    // A late arrival for a closed month is invisible to the stored rollup.
    analytics
        .pool()
        .with_ledger(|l| l.insert_event(&event("late", "C01", "CSA", d(2024, 12, 20), 75, None)))
        .unwrap();
    let cached_rollup = analytics.get_bucket_series_with(req, true).await.unwrap();
    assert_eq!(cached_rollup.rollup_periods, 1);
    assert_eq!(cached_rollup.point("2024-12").unwrap().attempts, base);

    analytics
        .mark_month_stale(Bucket::B1, YearMonth::new(2024, 12).unwrap())
        .await
        .unwrap();
    let stale = analytics.get_bucket_series_with(req, false).await.unwrap();
    assert_eq!(stale.rollup_periods, 0, "stale month must not come from the rollup");
    assert_eq!(stale.point("2024-12").unwrap().attempts, base + 1);

    let report = analytics.refresh_now().await.unwrap();
    assert!(report
        .months_rebuilt
        .contains(&(Bucket::B1, YearMonth::new(2024, 12).unwrap())));
    let rebuilt = analytics.get_bucket_series_with(req, false).await.unwrap();
    assert_eq!(rebuilt.rollup_periods, 1);
    assert_eq!(rebuilt.point("2024-12").unwrap().attempts, base + 1);
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 8: today is live
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn today_is_always_live() {
    let today = d(2025, 4, 15);
    let pool = pool();
    seed_synthetic(&pool, 14, d(2025, 3, 1), today);
    let analytics = build(pool, today, true).await;
    analytics.refresh_now().await.unwrap();

    let watermark = analytics
        .pool()
        .call(|l| l.daily_watermark(Bucket::B2))
        .await
        .unwrap()
        .expect("daily rollup populated");
    assert!(watermark < today, "daily rollup must never hold today");

    let req = SeriesRequest {
        bucket: Bucket::B2,
        start: Some(today),
        end: Some(today),
        granularity: Granularity::Day,
    };
    let before = analytics.get_bucket_series_with(req, false).await.unwrap();
    let base = before.point("2025-04-15").map_or(0, |p| p.attempts);

    analytics
        .pool()
        .with_ledger(|l| l.insert_event(&event("now", "C02", "CSA", today, 150, None)))
        .unwrap();
    let after = analytics.get_bucket_series_with(req, true).await.unwrap();
    assert_eq!(after.point("2025-04-15").unwrap().attempts, base + 1);
    assert_eq!(after.rollup_periods, 0);
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 9: capability probe
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn missing_rollup_tables_select_live_scans() {
    init_logging();
    let ledger = Ledger::in_memory().unwrap();
    ledger.migrate_event_log().unwrap();
    ledger
        .insert_event(&event("A", "C1", "CSA", d(2025, 1, 5), 70, None))
        .unwrap();
    let pool = StorePool::from_ledger(ledger);

    let analytics = build(pool, d(2025, 2, 1), true).await;
    assert_eq!(analytics.strategy(), SeriesStrategy::LiveScan);

    let series = analytics
        .get_bucket_series(Bucket::B1, None, None, Granularity::Month)
        .await
        .unwrap();
    assert_eq!(series.point("2025-01").unwrap().attempts, 1);
    assert!(matches!(analytics.refresh_now().await, Err(RecoveryError::Configuration(_))));
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 10: dashboard
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn dashboard_covers_four_buckets() {
    let today = d(2025, 4, 15);
    let pool = pool();
    seed_synthetic(&pool, 15, d(2025, 1, 1), today);
    let analytics = build(pool, today, true).await;
    analytics.refresh_now().await.unwrap();

    let dash = analytics
        .get_dashboard(Some(d(2025, 1, 1)), Some(today), Granularity::Month)
        .await
        .unwrap();
    let order: Vec<Bucket> = dash.buckets.iter().map(|s| s.bucket).collect();
    assert_eq!(order, Bucket::CLASSIFIED.to_vec());
    assert_eq!(dash.totals.len(), 4);
    for (series, totals) in dash.buckets.iter().zip(&dash.totals) {
        assert_eq!(series.total_attempts(), totals.attempts);
    }

    let all = analytics
        .get_bucket_series(Bucket::All, Some(d(2025, 1, 1)), Some(today), Granularity::Month)
        .await
        .unwrap();
    let bucketed: i64 = dash.totals.iter().map(|t| t.attempts).sum();
    assert!(
        all.total_attempts() >= bucketed,
        "ALL ({}) must include every bucketed attempt ({bucketed})",
        all.total_attempts()
    );
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 11: bad ranges
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn inverted_range_is_rejected() {
    let analytics = build(pool(), d(2025, 2, 1), true).await;
    let err = analytics
        .get_bucket_series(Bucket::B1, Some(d(2025, 2, 1)), Some(d(2025, 1, 1)), Granularity::Day)
        .await
        .unwrap_err();
    assert!(matches!(err, RecoveryError::Configuration(_)), "got {err}");
    assert!(analytics.cache().is_empty(), "errors are never cached");
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 12: storage failures
// ─────────────────────────────────────────────────────────────────────────────

/// A database file removed on drop.
struct TempDb {
    path: PathBuf,
}

impl TempDb {
    fn new(name: &str) -> Self {
        let path = std::env::temp_dir().join(format!("recovery-{name}-{}.db", std::process::id()));
        let db = Self { path };
        db.remove();
        db
    }

    fn path(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }

    fn remove(&self) {
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{suffix}", self.path()));
        }
    }
}

impl Drop for TempDb {
    fn drop(&mut self) {
        self.remove();
    }
}

#[tokio::test]
async fn storage_failure_fails_whole_dashboard() {
    init_logging();
    let db = TempDb::new("dashboard-failure");
    let mut config = RecoveryConfig::default_test();
    config.database.path = db.path();
    let pool = StorePool::open(&config.database).unwrap();
    pool.with_ledger(funnel_fixture).unwrap();
    let analytics = RecoveryAnalytics::build(config, pool, Arc::new(ManualClock::on(d(2025, 3, 1))))
        .await
        .unwrap();

    let (start, end) = (Some(d(2025, 1, 1)), Some(d(2025, 1, 31)));
    analytics
        .get_bucket_series(Bucket::B1, start, end, Granularity::Day)
        .await
        .unwrap();
    assert_eq!(analytics.cache().len(), 1);

    {
        let raw = rusqlite::Connection::open(db.path()).unwrap();
        raw.execute_batch("DROP TABLE payment;").unwrap();
    }

    let err = analytics
        .get_dashboard(start, end, Granularity::Day)
        .await
        .unwrap_err();
    assert!(matches!(err, RecoveryError::Database(_)), "got {err}");
    assert_eq!(analytics.cache().len(), 1, "only the earlier B1 series stays cached");
    assert_eq!(analytics.cache_invalidate(DASHBOARD_PREFIX), 0, "no dashboard was stored");

    let again = analytics
        .get_bucket_series(Bucket::B2, start, end, Granularity::Day)
        .await
        .unwrap_err();
    assert!(matches!(again, RecoveryError::Database(_)), "errors reach every caller, got {again}");
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 13: period comparison
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn period_comparison_keeps_request_order() {
    let pool = pool();
    pool.with_ledger(funnel_fixture).unwrap();
    let analytics = build(pool, d(2025, 3, 1), false).await;

    let comparison = analytics
        .get_period_comparison(
            vec![
                NamedPeriod::named("funnel day", d(2025, 1, 8), d(2025, 1, 8)),
                NamedPeriod::new(d(2025, 1, 9), d(2025, 1, 9)),
            ],
            Bucket::B2,
            Granularity::Day,
        )
        .await
        .unwrap();

    let names: Vec<&str> = comparison.periods.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, vec!["funnel day", "Period 2"]);

    let first = &comparison.periods[0].totals;
    assert_eq!(first.attempts, 4);
    assert_eq!(first.agreed_value, 1200.0);
    assert_eq!(first.paid_amount, 150.0);

    let second = &comparison.periods[1];
    assert_eq!(second.totals.attempts, 0);
    assert_eq!(second.totals.agreed, 1);
    assert_eq!(second.totals.agreed_value, 500.0);
    assert_eq!(second.series.points.len(), 1);
    assert_eq!(analytics.cache().len(), 2, "each period is cached as its own series");
}

#[tokio::test]
async fn period_comparison_rejects_bad_input() {
    let analytics = build(pool(), d(2025, 3, 1), false).await;
    let empty = analytics
        .get_period_comparison(Vec::new(), Bucket::B1, Granularity::Month)
        .await
        .unwrap_err();
    assert!(matches!(empty, RecoveryError::Configuration(_)), "got {empty}");

    let inverted = analytics
        .get_period_comparison(
            vec![
                NamedPeriod::new(d(2025, 1, 1), d(2025, 1, 31)),
                NamedPeriod::new(d(2025, 2, 28), d(2025, 2, 1)),
            ],
            Bucket::B1,
            Granularity::Month,
        )
        .await
        .unwrap_err();
    assert!(matches!(inverted, RecoveryError::Configuration(_)), "got {inverted}");
}
