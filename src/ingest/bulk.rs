//! Push-style ingestion for field collectors that upload typed batches.
//!
//! The batch kind is a closed set; an unknown `data_type` fails request
//! decoding. Individual records are decoded one at a time so a bad record
//! only bumps its kind's error count. Records stamped after the time of the
//! push are rejected: a future row would become the sensor's newest interval
//! and shadow every pulled row until that time.

use crate::error::StoreError;
use crate::model::{
    HeatmapRecord, InsertOutcome, LineCount, LineCrossingRecord, Ownership, RegionalCountRecord,
    VcaAlarmRecord, LINE_COUNT, MAX_COUNTER,
};
use crate::store::TrafficStore;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkKind {
    PeopleCounting,
    RegionalCounting,
    Heatmap,
    VcaAlarm,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BulkBatch {
    pub data_type: BulkKind,
    #[serde(default)]
    pub records: Vec<JsonValue>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BulkIngestRequest {
    pub sensor_id: String,
    pub batches: Vec<BulkBatch>,
}

#[derive(Debug, Deserialize)]
struct PeopleCountingRow {
    interval_start: DateTime<Utc>,
    interval_end: DateTime<Utc>,
    #[serde(default)]
    lines: Vec<LineCount>,
}

#[derive(Debug, Deserialize)]
struct RegionalRow {
    timestamp: DateTime<Utc>,
    region1: Option<i64>,
    region2: Option<i64>,
    region3: Option<i64>,
    region4: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct HeatmapRow {
    timestamp: DateTime<Utc>,
    cells: Vec<Vec<i64>>,
}

#[derive(Debug, Deserialize)]
struct VcaAlarmRow {
    timestamp: DateTime<Utc>,
    rule_name: String,
    event_type: String,
    object_count: Option<i64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct KindCounts {
    pub received: u64,
    pub inserted: u64,
    pub duplicates: u64,
    pub errors: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BulkIngestReport {
    pub sensor_id: String,
    pub kinds: BTreeMap<BulkKind, KindCounts>,
}

#[derive(Debug, thiserror::Error)]
pub enum BulkError {
    #[error("unknown sensor {0}")]
    UnknownSensor(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, thiserror::Error)]
enum RecordError {
    #[error("undecodable record: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("invalid record: {0}")]
    Invalid(&'static str),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone)]
pub struct BulkIngestor {
    store: Arc<dyn TrafficStore>,
}

impl BulkIngestor {
    pub fn new(store: Arc<dyn TrafficStore>) -> Self {
        Self { store }
    }

    pub async fn ingest(&self, request: BulkIngestRequest) -> Result<BulkIngestReport, BulkError> {
        self.ingest_at(request, Utc::now()).await
    }

    pub async fn ingest_at(
        &self,
        request: BulkIngestRequest,
        now: DateTime<Utc>,
    ) -> Result<BulkIngestReport, BulkError> {
        let sensor = self
            .store
            .sensor(&request.sensor_id)
            .await?
            .filter(|sensor| sensor.active)
            .ok_or_else(|| BulkError::UnknownSensor(request.sensor_id.clone()))?;
        let owner = sensor.owner;

        let mut kinds: BTreeMap<BulkKind, KindCounts> = BTreeMap::new();
        for batch in request.batches {
            let counts = kinds.entry(batch.data_type).or_default();
            for raw in batch.records {
                counts.received += 1;
                match self.insert_one(&sensor.id, &owner, batch.data_type, raw, now).await {
                    Ok(InsertOutcome::Inserted) => counts.inserted += 1,
                    Ok(InsertOutcome::Duplicate) => counts.duplicates += 1,
                    Err(err) => {
                        tracing::debug!(
                            sensor = %sensor.id,
                            kind = ?batch.data_type,
                            error = %err,
                            "bulk record rejected"
                        );
                        counts.errors += 1;
                    }
                }
            }
        }

        for (kind, counts) in &kinds {
            if counts.errors > 0 {
                tracing::warn!(
                    sensor = %sensor.id,
                    kind = ?kind,
                    errors = counts.errors,
                    received = counts.received,
                    "bulk batch had rejected records"
                );
            }
        }
        Ok(BulkIngestReport {
            sensor_id: sensor.id,
            kinds,
        })
    }

    async fn insert_one(
        &self,
        sensor_id: &str,
        owner: &Ownership,
        kind: BulkKind,
        raw: JsonValue,
        now: DateTime<Utc>,
    ) -> Result<InsertOutcome, RecordError> {
        let outcome = match kind {
            BulkKind::PeopleCounting => {
                let record = people_counting(sensor_id, decode(raw)?)?;
                not_after(record.interval_start, now)?;
                self.store.insert_line_crossing(owner, &record).await?
            }
            BulkKind::RegionalCounting => {
                let record = regional(sensor_id, decode(raw)?)?;
                not_after(record.timestamp, now)?;
                self.store.insert_regional_count(owner, &record).await?
            }
            BulkKind::Heatmap => {
                let record = heatmap(sensor_id, decode(raw)?)?;
                not_after(record.timestamp, now)?;
                self.store.insert_heatmap(owner, &record).await?
            }
            BulkKind::VcaAlarm => {
                let record = vca_alarm(sensor_id, decode(raw)?)?;
                not_after(record.timestamp, now)?;
                self.store.insert_vca_alarm(owner, &record).await?
            }
        };
        Ok(outcome)
    }
}

fn not_after(timestamp: DateTime<Utc>, now: DateTime<Utc>) -> Result<(), RecordError> {
    if timestamp > now {
        return Err(RecordError::Invalid("timestamp is in the future"));
    }
    Ok(())
}

fn in_counter_range(value: i64) -> bool {
    (0..=MAX_COUNTER).contains(&value)
}

fn decode<T: DeserializeOwned>(raw: JsonValue) -> Result<T, RecordError> {
    Ok(serde_json::from_value(raw)?)
}

fn people_counting(
    sensor_id: &str,
    row: PeopleCountingRow,
) -> Result<LineCrossingRecord, RecordError> {
    if row.interval_end <= row.interval_start {
        return Err(RecordError::Invalid("interval end must follow start"));
    }
    if row.lines.len() > LINE_COUNT {
        return Err(RecordError::Invalid("too many lines"));
    }
    let mut lines = [LineCount::default(); LINE_COUNT];
    for (slot, line) in lines.iter_mut().zip(row.lines) {
        if !in_counter_range(line.inbound) || !in_counter_range(line.outbound) {
            return Err(RecordError::Invalid("line counter out of range"));
        }
        *slot = line;
    }
    Ok(LineCrossingRecord::new(
        sensor_id,
        row.interval_start,
        row.interval_end,
        lines,
    ))
}

fn regional(sensor_id: &str, row: RegionalRow) -> Result<RegionalCountRecord, RecordError> {
    let regions = [row.region1, row.region2, row.region3, row.region4];
    if regions.iter().flatten().any(|value| !in_counter_range(*value)) {
        return Err(RecordError::Invalid("region count out of range"));
    }
    Ok(RegionalCountRecord {
        sensor_id: sensor_id.to_string(),
        timestamp: row.timestamp,
        regions,
    })
}

fn heatmap(sensor_id: &str, row: HeatmapRow) -> Result<HeatmapRecord, RecordError> {
    if row.cells.iter().flatten().any(|value| *value < 0) {
        return Err(RecordError::Invalid("negative heatmap cell"));
    }
    Ok(HeatmapRecord {
        sensor_id: sensor_id.to_string(),
        timestamp: row.timestamp,
        cells: row.cells,
    })
}

fn vca_alarm(sensor_id: &str, row: VcaAlarmRow) -> Result<VcaAlarmRecord, RecordError> {
    if row.rule_name.trim().is_empty() {
        return Err(RecordError::Invalid("missing rule name"));
    }
    if row.object_count.is_some_and(|count| count < 0) {
        return Err(RecordError::Invalid("negative object count"));
    }
    Ok(VcaAlarmRecord {
        sensor_id: sensor_id.to_string(),
        timestamp: row.timestamp,
        rule_name: row.rule_name,
        event_type: row.event_type,
        object_count: row.object_count,
    })
}
