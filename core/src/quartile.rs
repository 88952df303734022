//! Volume-proportional quartile ranking.
//!
//! Collectors are ranked by volume (descending) and cut into four
//! contiguous groups whose cumulative volume lands as close as possible to
//! 25/50/75/100% of the total. A few outsized producers therefore sit in
//! group 1 on their own instead of being diluted by count.
//!
//! The cut search is a local-minimum heuristic: for each target it scans
//! forward from the previous cut and stops as soon as the running total is
//! past the target and the distance stops shrinking. Ties in distance keep
//! the earlier index.
//!
//! With four or fewer collectors, or zero total volume, the split is by
//! count instead, with the remainder going to the earlier groups.

use crate::types::{round2, CollectorId};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

const TARGET_SHARES: [f64; 3] = [0.25, 0.50, 0.75];

/// What a collector's volume counts.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum VolumeMeasure {
    /// Every attempt row.
    #[default]
    Attempts,
    /// Rows carrying the agreement action.
    Agreements,
    /// Amount on rows carrying the agreement action.
    AgreementValue,
}

impl VolumeMeasure {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Attempts       => "attempts",
            Self::Agreements     => "agreements",
            Self::AgreementValue => "agreement_value",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectorVolume {
    pub collector_id: CollectorId,
    pub volume:       f64,
}

impl CollectorVolume {
    pub fn new(collector_id: impl Into<CollectorId>, volume: f64) -> Self {
        Self { collector_id: collector_id.into(), volume }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QuartileStats {
    pub count: usize,
    pub min:   f64,
    pub max:   f64,
    pub mean:  f64,
    pub total: f64,
}

impl QuartileStats {
    fn of(members: &[CollectorVolume]) -> Self {
        if members.is_empty() {
            return Self::default();
        }
        let total: f64 = members.iter().map(|m| m.volume).sum();
        let min = members.iter().map(|m| m.volume).fold(f64::INFINITY, f64::min);
        let max = members.iter().map(|m| m.volume).fold(f64::NEG_INFINITY, f64::max);
        Self {
            count: members.len(),
            min:   round2(min),
            max:   round2(max),
            mean:  round2(total / members.len() as f64),
            total: round2(total),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuartileGroup {
    /// 1 is the top group.
    pub quartile: u8,
    pub members:  Vec<CollectorVolume>,
    pub stats:    QuartileStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitMethod {
    VolumeShare,
    EqualCount,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuartileReport {
    pub groups:         Vec<QuartileGroup>,
    pub total_entities: usize,
    pub total_volume:   f64,
    pub no_data:        bool,
    pub method:         SplitMethod,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuartileAssignment {
    pub collector_id: CollectorId,
    pub quartile:     u8,
}

impl QuartileReport {
    pub fn group(&self, quartile: u8) -> Option<&QuartileGroup> {
        self.groups.iter().find(|g| g.quartile == quartile)
    }

    /// Flattened collector → group view, in rank order.
    pub fn assignments(&self) -> Vec<QuartileAssignment> {
        self.groups
            .iter()
            .flat_map(|g| {
                g.members.iter().map(move |m| QuartileAssignment {
                    collector_id: m.collector_id.clone(),
                    quartile:     g.quartile,
                })
            })
            .collect()
    }
}

/// Split `ranked` into four quartile groups.
///
/// Input is stable-sorted by volume descending first, so callers may pass
/// an already ranked list and ties keep their given order.
pub fn rank_quartiles(mut ranked: Vec<CollectorVolume>) -> QuartileReport {
    ranked.sort_by(|a, b| b.volume.total_cmp(&a.volume));
    let volumes: Vec<f64> = ranked.iter().map(|c| c.volume.max(0.0)).collect();
    let total: f64 = volumes.iter().sum();
    let n = ranked.len();

    let (cuts, method) = if n <= 4 || total <= 0.0 {
        (equal_count_cuts(n), SplitMethod::EqualCount)
    } else {
        (volume_share_cuts(&volumes, total), SplitMethod::VolumeShare)
    };

    let bounds = [0, cuts[0], cuts[1], cuts[2], n];
    let groups = (0..4)
        .map(|g| {
            let members = ranked[bounds[g]..bounds[g + 1]].to_vec();
            let stats = QuartileStats::of(&members);
            QuartileGroup { quartile: g as u8 + 1, members, stats }
        })
        .collect();

    QuartileReport {
        groups,
        total_entities: n,
        total_volume: round2(total),
        no_data: n == 0,
        method,
    }
}

/// Exclusive end index of groups 1–3 for a count split.
pub fn equal_count_cuts(n: usize) -> [usize; 3] {
    let base = n / 4;
    let extra = n % 4;
    let mut cuts = [0usize; 3];
    let mut end = 0;
    for (g, cut) in cuts.iter_mut().enumerate() {
        end += base + usize::from(g < extra);
        *cut = end;
    }
    cuts
}

/// Exclusive end index of groups 1–3 for a volume-share split.
/// Requires `volumes.len() >= 4`, sorted descending.
pub fn volume_share_cuts(volumes: &[f64], total: f64) -> [usize; 3] {
    let n = volumes.len();
    let mut prefix = Vec::with_capacity(n + 1);
    prefix.push(0.0);
    for v in volumes {
        let last = prefix[prefix.len() - 1];
        prefix.push(last + v);
    }

    let mut cuts = [0usize; 3];
    let mut start = 0usize;
    for (k, share) in TARGET_SHARES.iter().enumerate() {
        let target = total * share;
        let mut best_end = start + 1;
        let mut best_distance = f64::INFINITY;
        for end in (start + 1)..=n {
            let running = prefix[end];
            let distance = (running - target).abs();
            if distance < best_distance {
                best_distance = distance;
                best_end = end;
            } else if running >= target {
                break;
            }
        }
        // Leave at least one collector for every later group.
        let remaining_groups = 3 - k;
        let cut = best_end.clamp(start + 1, n - remaining_groups);
        cuts[k] = cut;
        start = cut;
    }
    cuts
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrajectoryPoint {
    pub date:         NaiveDate,
    pub collector_id: CollectorId,
    pub quartile:     u8,
}

/// Rank each day independently. Every collector active on a day is part
/// of that day's ranking; `filter` only limits which rows are returned.
pub fn trajectory(
    days: Vec<(NaiveDate, Vec<CollectorVolume>)>,
    filter: Option<&HashSet<CollectorId>>,
) -> Vec<TrajectoryPoint> {
    let mut points = Vec::new();
    for (date, volumes) in days {
        let report = rank_quartiles(volumes);
        for a in report.assignments() {
            if filter.map_or(true, |f| f.contains(&a.collector_id)) {
                points.push(TrajectoryPoint {
                    date,
                    collector_id: a.collector_id,
                    quartile: a.quartile,
                });
            }
        }
    }
    points.sort_by(|a, b| a.date.cmp(&b.date));
    points
}
