use crate::model::LineCrossingRecord;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterDecision {
    Accept,
    SkippedFuture,
    SkippedOld,
    SkippedDuplicate,
    SkippedEmpty,
}

/// Decides whether a parsed record may be inserted. Rules apply in order and
/// the first match wins.
pub fn evaluate(
    record: &LineCrossingRecord,
    now: DateTime<Utc>,
    last_persisted_start: Option<DateTime<Utc>>,
    horizon: Duration,
) -> FilterDecision {
    if record.interval_start > now {
        return FilterDecision::SkippedFuture;
    }
    if now - record.interval_start > horizon {
        return FilterDecision::SkippedOld;
    }
    if last_persisted_start.is_some_and(|last| record.interval_start <= last) {
        return FilterDecision::SkippedDuplicate;
    }
    if record.is_empty() {
        return FilterDecision::SkippedEmpty;
    }
    FilterDecision::Accept
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FilterCounts {
    pub inserted: u64,
    pub skipped_future: u64,
    pub skipped_old: u64,
    pub skipped_duplicate: u64,
    pub skipped_empty: u64,
}

impl FilterCounts {
    pub fn record(&mut self, decision: FilterDecision) {
        match decision {
            // Accepted records only count once the insert lands.
            FilterDecision::Accept => {}
            FilterDecision::SkippedFuture => self.skipped_future += 1,
            FilterDecision::SkippedOld => self.skipped_old += 1,
            FilterDecision::SkippedDuplicate => self.skipped_duplicate += 1,
            FilterDecision::SkippedEmpty => self.skipped_empty += 1,
        }
    }

    pub fn merge(&mut self, other: &FilterCounts) {
        self.inserted += other.inserted;
        self.skipped_future += other.skipped_future;
        self.skipped_old += other.skipped_old;
        self.skipped_duplicate += other.skipped_duplicate;
        self.skipped_empty += other.skipped_empty;
    }

    pub fn skipped(&self) -> u64 {
        self.skipped_future + self.skipped_old + self.skipped_duplicate + self.skipped_empty
    }
}

/// Splits a batch into insert candidates and skip counts.
pub fn partition(
    records: Vec<LineCrossingRecord>,
    now: DateTime<Utc>,
    last_persisted_start: Option<DateTime<Utc>>,
    horizon: Duration,
) -> (Vec<LineCrossingRecord>, FilterCounts) {
    let mut counts = FilterCounts::default();
    let mut accepted = Vec::with_capacity(records.len());
    for record in records {
        let decision = evaluate(&record, now, last_persisted_start, horizon);
        if decision == FilterDecision::Accept {
            accepted.push(record);
        } else {
            counts.record(decision);
        }
    }
    (accepted, counts)
}
