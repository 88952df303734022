//! Collector production: who brought money in, and when.
//!
//! Production is measured on the payment log, not the attempt log. A
//! receipt counts when its amount is positive and it is credited to a
//! collector (`NULL`, `''` and `'0'` are uncredited).

use crate::{
    store::{CollectorReceiptRow, MonthlyReceiptRow},
    types::{round2, CollectorId, YearMonth},
};
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::BTreeMap;

pub const DEFAULT_TOP_LIMIT: usize = 5;
/// Months before `end` covered when no start is given.
pub const DEFAULT_LOOKBACK_MONTHS: u32 = 2;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectorProduction {
    pub collector_id:    CollectorId,
    pub payments:        i64,
    pub received:        f64,
    /// Received value over the months in the range that saw any receipt.
    pub monthly_average: f64,
    pub per_payment:     f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonthlyProduction {
    pub month:    YearMonth,
    /// Top collectors with a receipt that month. Absent means nothing received.
    pub received: BTreeMap<CollectorId, f64>,
}

/// Receipts across every collector in the range.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProductionSummary {
    pub payments:    i64,
    pub received:    f64,
    pub per_payment: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopCollectors {
    pub start:      NaiveDate,
    pub end:        NaiveDate,
    /// Divisor of `monthly_average`, never below one.
    pub months:     i64,
    pub summary:    ProductionSummary,
    pub collectors: Vec<CollectorProduction>,
    pub by_month:   Vec<MonthlyProduction>,
}

fn per(value: f64, count: i64) -> f64 {
    if count > 0 {
        round2(value / count as f64)
    } else {
        0.0
    }
}

/// Build the report from the store rows. `top` arrives ranked.
pub fn top_collectors(
    start: NaiveDate,
    end: NaiveDate,
    active_months: i64,
    totals: (i64, f64),
    top: Vec<CollectorReceiptRow>,
    monthly: Vec<MonthlyReceiptRow>,
) -> TopCollectors {
    let months = active_months.max(1);
    let collectors = top
        .into_iter()
        .map(|row| CollectorProduction {
            monthly_average: per(row.received, months),
            per_payment:     per(row.received, row.payments),
            received:        round2(row.received),
            payments:        row.payments,
            collector_id:    row.collector_id,
        })
        .collect();

    let mut by_month: Vec<MonthlyProduction> = Vec::new();
    for row in monthly {
        match by_month.last_mut() {
            Some(current) if current.month == row.month => {
                current.received.insert(row.collector_id, round2(row.received));
            }
            _ => by_month.push(MonthlyProduction {
                month:    row.month,
                received: BTreeMap::from([(row.collector_id, round2(row.received))]),
            }),
        }
    }

    let (payments, received) = totals;
    TopCollectors {
        start,
        end,
        months,
        summary: ProductionSummary {
            payments,
            received: round2(received),
            per_payment: per(received, payments),
        },
        collectors,
        by_month,
    }
}
