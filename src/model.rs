use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Number of virtual lines a sensor reports.
pub const LINE_COUNT: usize = 4;
/// Lines 1..=3 count store entries; the last line counts passers-by.
pub const ENTRY_LINES: usize = 3;
pub const PASSING_LINE: usize = 3;
pub const REGION_COUNT: usize = 4;
/// Ceiling for a single counter value. Sums over a day of rows stay far below
/// `i64::MAX` with every counter at this value.
pub const MAX_COUNTER: i64 = 1_000_000_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorAddress {
    pub host: String,
    pub port: u16,
    pub path_template: Option<String>,
}

#[derive(Clone, PartialEq, Eq)]
pub struct SensorCredentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for SensorCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SensorCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Store and organization a sensor's readings belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Ownership {
    pub store_id: Uuid,
    pub organization_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorDescriptor {
    pub id: String,
    pub owner: Ownership,
    pub address: SensorAddress,
    pub credentials: Option<SensorCredentials>,
    pub active: bool,
    /// IANA zone name or fixed `±HH:MM` offset the device reports local time in.
    pub timezone: Option<String>,
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LineCount {
    #[serde(rename = "in")]
    pub inbound: i64,
    #[serde(rename = "out")]
    pub outbound: i64,
}

impl LineCount {
    pub fn new(inbound: i64, outbound: i64) -> Self {
        Self { inbound, outbound }
    }

    pub fn total(&self) -> i64 {
        self.inbound.saturating_add(self.outbound)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::In => "in",
            Self::Out => "out",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "in" => Some(Self::In),
            "out" => Some(Self::Out),
            _ => None,
        }
    }
}

/// One sensor's line-crossing counts for a reporting interval.
///
/// Identity is `(sensor_id, interval_start)`; records are never updated once
/// persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LineCrossingRecord {
    pub sensor_id: String,
    pub interval_start: DateTime<Utc>,
    pub interval_end: DateTime<Utc>,
    pub lines: [LineCount; LINE_COUNT],
    pub direction: Option<Direction>,
}

impl LineCrossingRecord {
    /// Builds a record and derives its direction tag from the entry lines.
    pub fn new(
        sensor_id: impl Into<String>,
        interval_start: DateTime<Utc>,
        interval_end: DateTime<Utc>,
        lines: [LineCount; LINE_COUNT],
    ) -> Self {
        let mut record = Self {
            sensor_id: sensor_id.into(),
            interval_start,
            interval_end,
            lines,
            direction: None,
        };
        record.direction = record.derive_direction();
        record
    }

    pub fn entries(&self) -> i64 {
        saturating_sum(self.lines[..ENTRY_LINES].iter().map(|line| line.inbound))
    }

    pub fn exits(&self) -> i64 {
        saturating_sum(self.lines[..ENTRY_LINES].iter().map(|line| line.outbound))
    }

    pub fn passing(&self) -> i64 {
        self.lines[PASSING_LINE].total()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.iter().all(|line| line.inbound == 0 && line.outbound == 0)
    }

    fn derive_direction(&self) -> Option<Direction> {
        let (entries, exits) = (self.entries(), self.exits());
        match entries.cmp(&exits) {
            std::cmp::Ordering::Greater => Some(Direction::In),
            std::cmp::Ordering::Less => Some(Direction::Out),
            std::cmp::Ordering::Equal => None,
        }
    }
}

pub(crate) fn saturating_sum(values: impl Iterator<Item = i64>) -> i64 {
    values.fold(0, i64::saturating_add)
}

/// Occupancy sample for up to four named regions of a sensor's field of view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegionalCountRecord {
    pub sensor_id: String,
    pub timestamp: DateTime<Utc>,
    pub regions: [Option<i64>; REGION_COUNT],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeatmapRecord {
    pub sensor_id: String,
    pub timestamp: DateTime<Utc>,
    pub cells: Vec<Vec<i64>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VcaAlarmRecord {
    pub sensor_id: String,
    pub timestamp: DateTime<Utc>,
    pub rule_name: String,
    pub event_type: String,
    pub object_count: Option<i64>,
}

/// Result of an insert keyed by a natural dedup key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Duplicate,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(lines: [LineCount; LINE_COUNT]) -> LineCrossingRecord {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        LineCrossingRecord::new("s1", start, start + chrono::Duration::minutes(15), lines)
    }

    #[test]
    fn entry_lines_exclude_passing_line() {
        let rec = record([
            LineCount::new(2, 1),
            LineCount::new(3, 0),
            LineCount::new(0, 4),
            LineCount::new(10, 12),
        ]);
        assert_eq!(rec.entries(), 5);
        assert_eq!(rec.exits(), 5);
        assert_eq!(rec.passing(), 22);
        assert_eq!(rec.direction, None);
    }

    #[test]
    fn direction_follows_entry_balance() {
        let rec = record([
            LineCount::new(4, 1),
            LineCount::default(),
            LineCount::default(),
            LineCount::new(0, 50),
        ]);
        assert_eq!(rec.direction, Some(Direction::In));
        assert!(!rec.is_empty());
        assert!(record([LineCount::default(); LINE_COUNT]).is_empty());
    }

    #[test]
    fn oversized_counters_saturate() {
        let rec = record([
            LineCount::new(i64::MAX, 0),
            LineCount::new(1, 0),
            LineCount::default(),
            LineCount::new(i64::MAX, i64::MAX),
        ]);
        assert_eq!(rec.entries(), i64::MAX);
        assert_eq!(rec.passing(), i64::MAX);
        assert_eq!(rec.direction, Some(Direction::In));
    }
}
