//! recovery-runner: headless runner for the collection-recovery analytics.
//!
//! Usage:
//!   recovery-runner --db recovery.db --view dashboard --granularity month
//!   recovery-runner --demo-seed 42 --demo-days 120 --view quartiles
//!   recovery-runner --db recovery.db --view trajectory --start 2025-01-01 --end 2025-01-31
//!   recovery-runner --demo-seed 42 --view top --limit 10
//!   recovery-runner --db recovery.db --view compare --bucket 2 --periods 2025-01-01:2025-01-31,2025-02-01:2025-02-28
//!   recovery-runner --db recovery.db --config recovery.json --serve

use anyhow::{anyhow, Result};
use chrono::{Duration, NaiveDate};
use recovery_core::{
    analytics::{NamedPeriod, RecoveryAnalytics},
    bucket::Bucket,
    clock::{Clock, SystemClock},
    config::RecoveryConfig,
    production::DEFAULT_TOP_LIMIT,
    store::StorePool,
    synth::{self, LogProfile},
    types::Granularity,
};
use std::env;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let db = flag(&args, "--db").unwrap_or(":memory:");
    let view = flag(&args, "--view").unwrap_or("dashboard");
    let serve = args.iter().any(|a| a == "--serve");
    let demo_seed = flag(&args, "--demo-seed").map(str::parse::<u64>).transpose()?;
    let demo_days = parse_arg(&args, "--demo-days", 90i64);
    let bucket: Bucket = flag(&args, "--bucket").unwrap_or("1").parse()?;
    let granularity: Granularity = flag(&args, "--granularity").unwrap_or("month").parse()?;
    let start = flag(&args, "--start").map(parse_date).transpose()?;
    let end = flag(&args, "--end").map(parse_date).transpose()?;
    let limit = parse_arg(&args, "--limit", DEFAULT_TOP_LIMIT);
    let collectors = flag(&args, "--collectors")
        .map(|list| list.split(',').map(|c| c.trim().to_string()).collect::<Vec<_>>());

    let mut config = match flag(&args, "--config") {
        Some(path) => RecoveryConfig::load(path)?,
        None => RecoveryConfig::default(),
    };

    // For :memory: use SQLite shared-memory URI so every pooled
    // connection sees the same in-memory database.
    config.database.path = if db == ":memory:" {
        format!("file:recovery_{}?mode=memory&cache=shared", unix_secs())
    } else {
        db.to_string()
    };
    if !serve {
        config.refresh.enabled = false;
    }

    eprintln!("recovery-runner");
    eprintln!("  db:          {db}");
    eprintln!("  view:        {view}");
    eprintln!("  bucket:      {bucket}");
    eprintln!("  granularity: {granularity}");
    eprintln!();

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let pool = StorePool::open(&config.database)?;

    if let Some(seed) = demo_seed {
        let today = clock.today();
        let demo = synth::generate(seed, &LogProfile::default(), today - Duration::days(demo_days), today);
        let written = pool.with_ledger(|l| demo.write(l))?;
        log::info!("seeded {written} demo attempts (seed {seed})");
    }

    let analytics = RecoveryAnalytics::build(config, pool, clock).await?;
    if let Some(report) = analytics.start().await {
        eprintln!(
            "startup refresh: {} months rebuilt, {} days written, {} failures",
            report.months_rebuilt.len(),
            report.days_written,
            report.failures.len()
        );
    }

    let output = match view {
        "series" => serde_json::to_value(&*analytics.get_bucket_series(bucket, start, end, granularity).await?)?,
        "dashboard" => serde_json::to_value(&*analytics.get_dashboard(start, end, granularity).await?)?,
        "quartiles" => serde_json::to_value(&*analytics.get_quartiles(start, end, collectors).await?)?,
        "trajectory" => {
            serde_json::to_value(&*analytics.get_quartile_trajectory(start, end, collectors).await?)?
        }
        "top" => serde_json::to_value(&*analytics.get_top_collectors(limit, start, end).await?)?,
        "compare" => {
            let periods = parse_periods(flag(&args, "--periods").unwrap_or_default())?;
            serde_json::to_value(analytics.get_period_comparison(periods, bucket, granularity).await?)?
        }
        "refresh" => serde_json::to_value(analytics.refresh_now().await?)?,
        other => return Err(anyhow!("unknown view '{other}'")),
    };
    println!("{}", serde_json::to_string_pretty(&output)?);

    if serve {
        eprintln!("serving; refresh loop running, Ctrl-C to stop");
        tokio::signal::ctrl_c().await?;
    }
    analytics.shutdown().await;
    Ok(())
}

fn flag<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
    args.windows(2)
        .find(|w| w[0] == name)
        .map(|w| w[1].as_str())
}

fn parse_arg<T: std::str::FromStr + Copy>(args: &[String], name: &str, default: T) -> T {
    flag(args, name)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| anyhow!("bad date '{s}': {e}"))
}

/// `start:end` pairs separated by commas.
fn parse_periods(s: &str) -> Result<Vec<NamedPeriod>> {
    s.split(',')
        .filter(|p| !p.is_empty())
        .map(|p| {
            let (start, end) = p
                .split_once(':')
                .ok_or_else(|| anyhow!("bad period '{p}', expected start:end"))?;
            Ok(NamedPeriod::named(p, parse_date(start)?, parse_date(end)?))
        })
        .collect()
}

fn unix_secs() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
