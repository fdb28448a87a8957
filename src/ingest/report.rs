use super::filter::FilterCounts;
use super::normalize::ParseStats;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorStatus {
    Succeeded,
    Malformed,
    TransientError,
    PersistenceFailed,
    Misconfigured,
    NotAttempted,
}

impl SensorStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Malformed => "malformed",
            Self::TransientError => "transient_error",
            Self::PersistenceFailed => "persistence_failed",
            Self::Misconfigured => "misconfigured",
            Self::NotAttempted => "not_attempted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SensorOutcome {
    pub sensor_id: String,
    pub status: SensorStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub counts: FilterCounts,
    pub parse: ParseStats,
    /// The fetch succeeded but the sensor's last-seen stamp was not written.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub last_seen_failed: bool,
}

impl SensorOutcome {
    pub fn new(sensor_id: impl Into<String>, status: SensorStatus) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            status,
            detail: None,
            counts: FilterCounts::default(),
            parse: ParseStats::default(),
            last_seen_failed: false,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Summary of one ingestion run, logged at the end and returned to the trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub skipped_locked: bool,
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub not_attempted: u64,
    pub last_seen_failed: u64,
    pub totals: FilterCounts,
    pub parse: ParseStats,
    pub sensors: Vec<SensorOutcome>,
}

impl RunReport {
    pub fn from_outcomes(
        run_id: Uuid,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        window: (DateTime<Utc>, DateTime<Utc>),
        mut sensors: Vec<SensorOutcome>,
    ) -> Self {
        sensors.sort_by(|a, b| a.sensor_id.cmp(&b.sensor_id));
        let mut report = Self {
            run_id,
            started_at,
            finished_at,
            window_start: window.0,
            window_end: window.1,
            skipped_locked: false,
            attempted: 0,
            succeeded: 0,
            failed: 0,
            not_attempted: 0,
            last_seen_failed: 0,
            totals: FilterCounts::default(),
            parse: ParseStats::default(),
            sensors: Vec::new(),
        };
        for outcome in &sensors {
            report.totals.merge(&outcome.counts);
            report.parse.merge(&outcome.parse);
            if outcome.last_seen_failed {
                report.last_seen_failed += 1;
            }
            match outcome.status {
                SensorStatus::NotAttempted => report.not_attempted += 1,
                SensorStatus::Succeeded => {
                    report.attempted += 1;
                    report.succeeded += 1;
                }
                _ => {
                    report.attempted += 1;
                    report.failed += 1;
                }
            }
        }
        report.sensors = sensors;
        report
    }

    /// Report for a trigger that found another run in progress.
    pub fn locked(run_id: Uuid, now: DateTime<Utc>, window: (DateTime<Utc>, DateTime<Utc>)) -> Self {
        let mut report = Self::from_outcomes(run_id, now, now, window, Vec::new());
        report.skipped_locked = true;
        report
    }
}
