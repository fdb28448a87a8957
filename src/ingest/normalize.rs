//! Parser for the vendor "dataloader" CSV report.
//!
//! Column layout (0-indexed): 0 = interval start, 1 = interval end (both
//! sensor-local, slash-delimited), 5/6, 8/9, 11/12 and 14/15 = line 1..4
//! in/out. Rows shorter than [`MIN_COLUMNS`] are discarded.

use crate::model::{LineCount, LineCrossingRecord, LINE_COUNT, MAX_COUNTER};
use crate::time::{parse_report_local, resolve_local_interval, IntervalError, SensorZone};
use serde::Serialize;

pub const MIN_COLUMNS: usize = 17;
const LINE_COLUMNS: [(usize, usize); LINE_COUNT] = [(5, 6), (8, 9), (11, 12), (14, 15)];

/// Row-level accounting for one report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ParseStats {
    pub rows: u64,
    pub parsed: u64,
    pub short_row: u64,
    pub bad_timestamp: u64,
    pub bad_interval: u64,
    pub unreadable: u64,
}

impl ParseStats {
    pub fn merge(&mut self, other: &ParseStats) {
        self.rows += other.rows;
        self.parsed += other.parsed;
        self.short_row += other.short_row;
        self.bad_timestamp += other.bad_timestamp;
        self.bad_interval += other.bad_interval;
        self.unreadable += other.unreadable;
    }

    pub fn skipped(&self) -> u64 {
        self.short_row + self.bad_timestamp + self.bad_interval + self.unreadable
    }

    /// True when the report carried data rows but none of them were usable.
    pub fn all_rows_invalid(&self) -> bool {
        self.rows > 0 && self.parsed == 0
    }
}

#[derive(Debug, Clone, Default)]
pub struct ParsedReport {
    pub records: Vec<LineCrossingRecord>,
    pub stats: ParseStats,
}

pub fn parse_report(body: &str, sensor_id: &str, zone: &SensorZone) -> ParsedReport {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(body.as_bytes());

    let mut report = ParsedReport::default();
    for row in reader.records() {
        report.stats.rows += 1;
        let row = match row {
            Ok(row) => row,
            Err(err) => {
                tracing::debug!(sensor = %sensor_id, error = %err, "unreadable report row");
                report.stats.unreadable += 1;
                continue;
            }
        };
        if row.len() < MIN_COLUMNS {
            report.stats.short_row += 1;
            continue;
        }

        let (Some(start_local), Some(end_local)) = (
            row.get(0).and_then(parse_report_local),
            row.get(1).and_then(parse_report_local),
        ) else {
            report.stats.bad_timestamp += 1;
            continue;
        };

        let (interval_start, interval_end) =
            match resolve_local_interval(zone, start_local, end_local) {
                Ok(bounds) => bounds,
                Err(IntervalError::Nonexistent) => {
                    report.stats.bad_timestamp += 1;
                    continue;
                }
                Err(IntervalError::NotIncreasing) => {
                    report.stats.bad_interval += 1;
                    continue;
                }
            };

        let lines = LINE_COLUMNS.map(|(in_col, out_col)| {
            LineCount::new(counter(row.get(in_col)), counter(row.get(out_col)))
        });
        report.records.push(LineCrossingRecord::new(
            sensor_id,
            interval_start,
            interval_end,
            lines,
        ));
        report.stats.parsed += 1;
    }

    if report.stats.skipped() > 0 {
        tracing::debug!(
            sensor = %sensor_id,
            rows = report.stats.rows,
            short_row = report.stats.short_row,
            bad_timestamp = report.stats.bad_timestamp,
            bad_interval = report.stats.bad_interval,
            "skipped invalid report rows"
        );
    }
    report
}

/// Missing, blank, negative and non-numeric counters all read as zero; values
/// above [`MAX_COUNTER`] are clamped to it.
fn counter(field: Option<&str>) -> i64 {
    let Some(raw) = field.map(str::trim).filter(|value| !value.is_empty()) else {
        return 0;
    };
    let value = raw
        .parse::<i64>()
        .ok()
        .or_else(|| raw.parse::<f64>().ok().filter(|v| v.is_finite()).map(|v| v as i64))
        .unwrap_or(0);
    value.clamp(0, MAX_COUNTER)
}
