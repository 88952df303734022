//! Collection-recovery analytics: bucket classification, rollup
//! maintenance, date-keyed funnel series and volume-share quartiles over
//! an append-only collection log.

pub mod analytics;
pub mod bucket;
pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod production;
pub mod quartile;
pub mod refresh;
pub mod rollup;
pub mod series;
pub mod store;
pub mod synth;
pub mod types;
