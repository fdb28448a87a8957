use crate::model::{
    saturating_sum, Direction, LineCrossingRecord, RegionalCountRecord, LINE_COUNT, REGION_COUNT,
};
use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Hour,
    Day,
}

impl Granularity {
    pub const ALL: [Granularity; 2] = [Granularity::Hour, Granularity::Day];

    pub fn width(self) -> Duration {
        match self {
            Self::Hour => Duration::hours(1),
            Self::Day => Duration::days(1),
        }
    }

    /// Start of the UTC bucket containing `ts`.
    pub fn bucket_start(self, ts: DateTime<Utc>) -> DateTime<Utc> {
        ts.duration_trunc(self.width()).unwrap_or(ts)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hour => "hour",
            Self::Day => "day",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegionStat {
    pub average: f64,
    pub maximum: i64,
}

/// Aggregates derived from one bucket's raw rows. Pure function of those rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollupMetrics {
    pub total_entries: i64,
    pub total_exits: i64,
    pub net_flow: i64,
    pub passing_traffic: i64,
    pub capture_rate: f64,
    pub dominant_direction: Option<Direction>,
    pub line_distribution: [f64; LINE_COUNT],
    /// Absent when the bucket has no regional samples.
    pub regions: Option<[Option<RegionStat>; REGION_COUNT]>,
    /// Raw rows folded in. A bucket whose current row counts differ from
    /// these is stale regardless of insert timestamps.
    pub row_count: i64,
    pub regional_count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rollup {
    pub sensor_id: String,
    pub store_id: Uuid,
    pub granularity: Granularity,
    pub bucket_start: DateTime<Utc>,
    pub metrics: RollupMetrics,
    pub computed_at: DateTime<Utc>,
}

/// Folds a bucket's rows into metrics. Returns `None` for a bucket with no
/// line-crossing rows so callers never write an empty rollup.
pub fn compute_metrics(
    rows: &[LineCrossingRecord],
    regional: &[RegionalCountRecord],
) -> Option<RollupMetrics> {
    if rows.is_empty() {
        return None;
    }

    // Order by the natural key so every run folds in the same sequence.
    let mut ordered: Vec<&LineCrossingRecord> = rows.iter().collect();
    ordered.sort_by(|a, b| {
        a.interval_start
            .cmp(&b.interval_start)
            .then_with(|| a.sensor_id.cmp(&b.sensor_id))
    });

    let total_entries = saturating_sum(ordered.iter().map(|row| row.entries()));
    let total_exits = saturating_sum(ordered.iter().map(|row| row.exits()));
    let passing_traffic = saturating_sum(ordered.iter().map(|row| row.passing()));

    let mut line_totals = [0i64; LINE_COUNT];
    for row in &ordered {
        for (total, line) in line_totals.iter_mut().zip(row.lines.iter()) {
            *total = total.saturating_add(line.total());
        }
    }

    Some(RollupMetrics {
        total_entries,
        total_exits,
        net_flow: total_entries.saturating_sub(total_exits),
        passing_traffic,
        capture_rate: capture_rate(total_entries, passing_traffic),
        dominant_direction: dominant_direction(ordered.iter().map(|row| row.direction)),
        line_distribution: line_distribution(&line_totals),
        regions: region_stats(regional),
        row_count: ordered.len() as i64,
        regional_count: regional.len() as i64,
    })
}

pub fn capture_rate(entries: i64, passing: i64) -> f64 {
    if passing <= 0 {
        return 0.0;
    }
    entries.max(0) as f64 / passing as f64
}

/// Most frequent tag; ties go to the tag seen first.
pub fn dominant_direction<I>(tags: I) -> Option<Direction>
where
    I: IntoIterator<Item = Option<Direction>>,
{
    let mut tally: Vec<(Direction, usize)> = Vec::new();
    for tag in tags.into_iter().flatten() {
        match tally.iter_mut().find(|(seen, _)| *seen == tag) {
            Some((_, count)) => *count += 1,
            None => tally.push((tag, 1)),
        }
    }
    let mut best: Option<(Direction, usize)> = None;
    for (tag, count) in tally {
        if best.map_or(true, |(_, best_count)| count > best_count) {
            best = Some((tag, count));
        }
    }
    best.map(|(tag, _)| tag)
}

pub fn line_distribution(line_totals: &[i64; LINE_COUNT]) -> [f64; LINE_COUNT] {
    let sum = saturating_sum(line_totals.iter().copied());
    if sum <= 0 {
        return [0.0; LINE_COUNT];
    }
    line_totals.map(|total| total as f64 / sum as f64)
}

fn region_stats(regional: &[RegionalCountRecord]) -> Option<[Option<RegionStat>; REGION_COUNT]> {
    if regional.is_empty() {
        return None;
    }
    let mut ordered: Vec<&RegionalCountRecord> = regional.iter().collect();
    ordered.sort_by_key(|row| row.timestamp);

    let mut stats = [None; REGION_COUNT];
    for (index, slot) in stats.iter_mut().enumerate() {
        let samples: Vec<i64> = ordered.iter().filter_map(|row| row.regions[index]).collect();
        let Some(maximum) = samples.iter().copied().max() else {
            continue;
        };
        let sum = saturating_sum(samples.iter().copied());
        *slot = Some(RegionStat {
            average: sum as f64 / samples.len() as f64,
            maximum,
        });
    }
    Some(stats)
}
