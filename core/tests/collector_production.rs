//! Integration tests for collector production.
//!
//! Tests verify:
//! 1. Top collectors rank by received value and honour the limit
//! 2. Monthly average divides by months that saw any receipt
//! 3. The per-month pivot only carries the top collectors
//! 4. Uncredited and zero receipts never rank, but count in the summary
//! 5. Missing dates default to a trailing window ending today
//! 6. Bad limits and ranges are configuration errors

use chrono::NaiveDate;
use recovery_core::{
    analytics::RecoveryAnalytics,
    clock::ManualClock,
    config::RecoveryConfig,
    error::RecoveryError,
    store::{NewPayment, StorePool},
    types::YearMonth,
};
use std::sync::Arc;

fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
}

fn receipt(collector: Option<&str>, paid_on: NaiveDate, amount: f64) -> NewPayment {
    NewPayment {
        account_id:              Some("acct".to_string()),
        delinquency_days:        Some(100),
        legacy_delinquency_days: None,
        collector_id:            collector.map(str::to_string),
        paid_on,
        amount_received:         amount,
    }
}

/// C2 leads on one large receipt, C1 follows on two smaller ones.
async fn build() -> RecoveryAnalytics {
    let _ = env_logger::builder().is_test(true).try_init();
    let config = RecoveryConfig::default_test();
    let pool = StorePool::open(&config.database).unwrap();
    pool.with_ledger(|l| {
        l.insert_payment(&receipt(Some("C1"), d(2025, 1, 10), 500.0))?;
        l.insert_payment(&receipt(Some("C1"), d(2025, 2, 3), 300.0))?;
        l.insert_payment(&receipt(Some("C1"), d(2025, 2, 4), 0.0))?;
        l.insert_payment(&receipt(Some("C2"), d(2025, 1, 20), 1000.0))?;
        l.insert_payment(&receipt(Some("C2"), d(2025, 4, 2), 9999.0))?;
        l.insert_payment(&receipt(Some("C3"), d(2025, 2, 15), 100.0))?;
        l.insert_payment(&receipt(Some("0"), d(2025, 1, 5), 5000.0))?;
        l.insert_payment(&receipt(None, d(2025, 2, 1), 50.0))?;
        Ok(())
    })
    .unwrap();
    RecoveryAnalytics::build(config, pool, Arc::new(ManualClock::on(d(2025, 3, 15))))
        .await
        .unwrap()
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 1–4: explicit range
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn top_collectors_rank_by_received_value() {
    let analytics = build().await;
    let report = analytics
        .get_top_collectors(2, Some(d(2025, 1, 1)), Some(d(2025, 3, 31)))
        .await
        .unwrap();

    let ranked: Vec<(&str, i64, f64)> = report
        .collectors
        .iter()
        .map(|c| (c.collector_id.as_str(), c.payments, c.received))
        .collect();
    assert_eq!(ranked, vec![("C2", 1, 1000.0), ("C1", 2, 800.0)]);

    assert_eq!(report.months, 2, "March saw no receipts");
    assert_eq!(report.collectors[0].monthly_average, 500.0);
    assert_eq!(report.collectors[1].monthly_average, 400.0);
    assert_eq!(report.collectors[1].per_payment, 400.0);
}

#[tokio::test]
async fn monthly_pivot_covers_top_collectors_only() {
    let analytics = build().await;
    let report = analytics
        .get_top_collectors(2, Some(d(2025, 1, 1)), Some(d(2025, 3, 31)))
        .await
        .unwrap();

    let months: Vec<YearMonth> = report.by_month.iter().map(|m| m.month).collect();
    assert_eq!(months, vec![YearMonth::new(2025, 1).unwrap(), YearMonth::new(2025, 2).unwrap()]);

    let jan = &report.by_month[0].received;
    assert_eq!(jan.get("C1"), Some(&500.0));
    assert_eq!(jan.get("C2"), Some(&1000.0));
    let feb = &report.by_month[1].received;
    assert_eq!(feb.get("C1"), Some(&300.0));
    assert!(!feb.contains_key("C3"), "C3 is outside the top two");
}

#[tokio::test]
async fn uncredited_receipts_count_in_summary_only() {
    let analytics = build().await;
    let report = analytics
        .get_top_collectors(10, Some(d(2025, 1, 1)), Some(d(2025, 3, 31)))
        .await
        .unwrap();

    let ids: Vec<&str> = report.collectors.iter().map(|c| c.collector_id.as_str()).collect();
    assert_eq!(ids, vec!["C2", "C1", "C3"]);
    assert_eq!(report.summary.payments, 6);
    assert_eq!(report.summary.received, 6950.0);
    assert_eq!(report.summary.per_payment, 1158.33);
}

#[tokio::test]
async fn empty_range_reports_nobody() {
    let analytics = build().await;
    let report = analytics
        .get_top_collectors(5, Some(d(2024, 6, 1)), Some(d(2024, 6, 30)))
        .await
        .unwrap();
    assert!(report.collectors.is_empty());
    assert!(report.by_month.is_empty());
    assert_eq!(report.months, 1);
    assert_eq!(report.summary.received, 0.0);
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 5–6: defaults and validation
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn missing_dates_default_to_trailing_window() {
    let analytics = build().await;
    let report = analytics.get_top_collectors(5, None, None).await.unwrap();
    assert_eq!((report.start, report.end), (d(2025, 1, 15), d(2025, 3, 15)));

    let ranked: Vec<(&str, f64)> = report
        .collectors
        .iter()
        .map(|c| (c.collector_id.as_str(), c.received))
        .collect();
    assert_eq!(ranked, vec![("C2", 1000.0), ("C1", 300.0), ("C3", 100.0)]);

    let again = analytics.get_top_collectors(5, None, None).await.unwrap();
    assert!(Arc::ptr_eq(&report, &again), "second call is served from cache");
}

#[tokio::test]
async fn bad_limit_and_range_are_rejected() {
    let analytics = build().await;
    let zero = analytics.get_top_collectors(0, None, None).await.unwrap_err();
    assert!(matches!(zero, RecoveryError::Configuration(_)), "got {zero}");

    let inverted = analytics
        .get_top_collectors(5, Some(d(2025, 3, 1)), Some(d(2025, 1, 1)))
        .await
        .unwrap_err();
    assert!(matches!(inverted, RecoveryError::Configuration(_)), "got {inverted}");
    assert!(analytics.cache().is_empty());
}
