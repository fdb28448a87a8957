use super::TrafficStore;
use crate::alerts::{AlertCategory, AlertEvent, StoreThresholds};
use crate::error::StoreError;
use crate::model::{
    HeatmapRecord, InsertOutcome, LineCrossingRecord, Ownership, RegionalCountRecord,
    SensorDescriptor, VcaAlarmRecord,
};
use crate::rollup::{Granularity, Rollup};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

type SensorKey = (String, DateTime<Utc>);

#[derive(Default)]
struct BucketWrites {
    newest: u64,
    line_rows: i64,
    regional_rows: i64,
}

/// Process-local store. Staleness is tracked with a write sequence instead of
/// wall-clock timestamps so tests are not sensitive to clock resolution.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    sensors: BTreeMap<String, SensorDescriptor>,
    line_crossings: BTreeMap<SensorKey, (LineCrossingRecord, u64)>,
    regional: BTreeMap<SensorKey, (RegionalCountRecord, u64)>,
    heatmaps: HashMap<SensorKey, HeatmapRecord>,
    vca_alarms: HashMap<(String, DateTime<Utc>, String), VcaAlarmRecord>,
    rollups: BTreeMap<(Granularity, String, DateTime<Utc>), (Rollup, u64)>,
    overrides: HashMap<Uuid, StoreThresholds>,
    alerts: Vec<AlertEvent>,
    failing_sensors: HashSet<String>,
    failing_seen: HashSet<String>,
    fail_rollup_writes: bool,
    insert_delay: Option<Duration>,
    run_locked: bool,
    seq: u64,
}

impl MemoryState {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn check_writable(&self, sensor_id: &str) -> Result<(), StoreError> {
        if self.failing_sensors.contains(sensor_id) {
            return Err(StoreError::Unavailable(format!(
                "writes for sensor {sensor_id} are failing"
            )));
        }
        Ok(())
    }
}

impl MemoryStore {
    pub fn with_sensors(sensors: impl IntoIterator<Item = SensorDescriptor>) -> Self {
        let state = MemoryState {
            sensors: sensors
                .into_iter()
                .map(|sensor| (sensor.id.clone(), sensor))
                .collect(),
            ..MemoryState::default()
        };
        Self {
            state: Mutex::new(state),
        }
    }

    /// Makes every raw insert for the sensor fail until cleared.
    pub async fn fail_writes_for(&self, sensor_id: &str) {
        self.state
            .lock()
            .await
            .failing_sensors
            .insert(sensor_id.to_string());
    }

    pub async fn fail_seen_updates_for(&self, sensor_id: &str) {
        self.state
            .lock()
            .await
            .failing_seen
            .insert(sensor_id.to_string());
    }

    /// Every line-crossing insert sleeps this long before taking the lock.
    pub async fn delay_inserts(&self, delay: Duration) {
        self.state.lock().await.insert_delay = Some(delay);
    }

    pub async fn fail_rollup_writes(&self, failing: bool) {
        self.state.lock().await.fail_rollup_writes = failing;
    }

    pub async fn set_threshold_override(&self, store_id: Uuid, thresholds: StoreThresholds) {
        self.state.lock().await.overrides.insert(store_id, thresholds);
    }

    pub async fn line_crossings(&self, sensor_id: &str) -> Vec<LineCrossingRecord> {
        self.state
            .lock()
            .await
            .line_crossings
            .values()
            .filter(|(record, _)| record.sensor_id == sensor_id)
            .map(|(record, _)| record.clone())
            .collect()
    }

    pub async fn line_crossing_count(&self) -> usize {
        self.state.lock().await.line_crossings.len()
    }

    pub async fn heatmap_count(&self) -> usize {
        self.state.lock().await.heatmaps.len()
    }

    pub async fn vca_alarm_count(&self) -> usize {
        self.state.lock().await.vca_alarms.len()
    }

    pub async fn rollup(
        &self,
        granularity: Granularity,
        sensor_id: &str,
        bucket_start: DateTime<Utc>,
    ) -> Option<Rollup> {
        self.state
            .lock()
            .await
            .rollups
            .get(&(granularity, sensor_id.to_string(), bucket_start))
            .map(|(rollup, _)| rollup.clone())
    }

    pub async fn alerts(&self) -> Vec<AlertEvent> {
        self.state.lock().await.alerts.clone()
    }

    pub async fn sensor_last_seen(&self, sensor_id: &str) -> Option<DateTime<Utc>> {
        self.state
            .lock()
            .await
            .sensors
            .get(sensor_id)
            .and_then(|sensor| sensor.last_seen)
    }
}

#[async_trait]
impl TrafficStore for MemoryStore {
    async fn active_sensors(&self) -> Result<Vec<SensorDescriptor>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .sensors
            .values()
            .filter(|sensor| sensor.active)
            .cloned()
            .collect())
    }

    async fn sensor(&self, sensor_id: &str) -> Result<Option<SensorDescriptor>, StoreError> {
        Ok(self.state.lock().await.sensors.get(sensor_id).cloned())
    }

    async fn mark_sensor_seen(&self, sensor_id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.failing_seen.contains(sensor_id) {
            return Err(StoreError::Unavailable(format!(
                "last_seen updates for sensor {sensor_id} are failing"
            )));
        }
        if let Some(sensor) = state.sensors.get_mut(sensor_id) {
            sensor.last_seen = Some(at);
        }
        Ok(())
    }

    async fn latest_interval_start(
        &self,
        sensor_id: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .line_crossings
            .keys()
            .filter(|(id, _)| id == sensor_id)
            .map(|(_, start)| *start)
            .max())
    }

    async fn insert_line_crossing(
        &self,
        _owner: &Ownership,
        record: &LineCrossingRecord,
    ) -> Result<InsertOutcome, StoreError> {
        let delay = self.state.lock().await.insert_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock().await;
        state.check_writable(&record.sensor_id)?;
        let key = (record.sensor_id.clone(), record.interval_start);
        if state.line_crossings.contains_key(&key) {
            return Ok(InsertOutcome::Duplicate);
        }
        let seq = state.next_seq();
        state.line_crossings.insert(key, (record.clone(), seq));
        Ok(InsertOutcome::Inserted)
    }

    async fn insert_regional_count(
        &self,
        _owner: &Ownership,
        record: &RegionalCountRecord,
    ) -> Result<InsertOutcome, StoreError> {
        let mut state = self.state.lock().await;
        state.check_writable(&record.sensor_id)?;
        let key = (record.sensor_id.clone(), record.timestamp);
        if state.regional.contains_key(&key) {
            return Ok(InsertOutcome::Duplicate);
        }
        let seq = state.next_seq();
        state.regional.insert(key, (record.clone(), seq));
        Ok(InsertOutcome::Inserted)
    }

    async fn insert_heatmap(
        &self,
        _owner: &Ownership,
        record: &HeatmapRecord,
    ) -> Result<InsertOutcome, StoreError> {
        let mut state = self.state.lock().await;
        state.check_writable(&record.sensor_id)?;
        let key = (record.sensor_id.clone(), record.timestamp);
        if state.heatmaps.contains_key(&key) {
            return Ok(InsertOutcome::Duplicate);
        }
        state.heatmaps.insert(key, record.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn insert_vca_alarm(
        &self,
        _owner: &Ownership,
        record: &VcaAlarmRecord,
    ) -> Result<InsertOutcome, StoreError> {
        let mut state = self.state.lock().await;
        state.check_writable(&record.sensor_id)?;
        let key = (
            record.sensor_id.clone(),
            record.timestamp,
            record.rule_name.clone(),
        );
        if state.vca_alarms.contains_key(&key) {
            return Ok(InsertOutcome::Duplicate);
        }
        state.vca_alarms.insert(key, record.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn stale_buckets(
        &self,
        sensor_id: &str,
        granularity: Granularity,
        since: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>, StoreError> {
        let state = self.state.lock().await;
        let first_bucket = granularity.bucket_start(since);
        let mut buckets: BTreeMap<DateTime<Utc>, BucketWrites> = BTreeMap::new();
        let line_rows = state
            .line_crossings
            .iter()
            .map(|((id, start), (_, seq))| (id, *start, *seq, true));
        let regional_rows = state
            .regional
            .iter()
            .map(|((id, ts), (_, seq))| (id, *ts, *seq, false));
        for (id, ts, seq, is_line) in line_rows.chain(regional_rows) {
            let bucket = granularity.bucket_start(ts);
            if id != sensor_id || bucket < first_bucket {
                continue;
            }
            let writes = buckets.entry(bucket).or_default();
            writes.newest = writes.newest.max(seq);
            if is_line {
                writes.line_rows += 1;
            } else {
                writes.regional_rows += 1;
            }
        }

        let stale: BTreeSet<DateTime<Utc>> = buckets
            .into_iter()
            .filter(|(bucket, writes)| {
                match state
                    .rollups
                    .get(&(granularity, sensor_id.to_string(), *bucket))
                {
                    Some((rollup, computed_seq)) => {
                        writes.newest > *computed_seq
                            || writes.line_rows != rollup.metrics.row_count
                            || writes.regional_rows != rollup.metrics.regional_count
                    }
                    None => true,
                }
            })
            .map(|(bucket, _)| bucket)
            .collect();
        Ok(stale.into_iter().collect())
    }

    async fn line_crossings_in(
        &self,
        sensor_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<LineCrossingRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .line_crossings
            .range((sensor_id.to_string(), start)..(sensor_id.to_string(), end))
            .map(|(_, (record, _))| record.clone())
            .collect())
    }

    async fn regional_counts_in(
        &self,
        sensor_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RegionalCountRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .regional
            .range((sensor_id.to_string(), start)..(sensor_id.to_string(), end))
            .map(|(_, (record, _))| record.clone())
            .collect())
    }

    async fn upsert_rollup(&self, rollup: &Rollup) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.fail_rollup_writes {
            return Err(StoreError::Unavailable("rollup writes are failing".to_string()));
        }
        let seq = state.next_seq();
        state.rollups.insert(
            (rollup.granularity, rollup.sensor_id.clone(), rollup.bucket_start),
            (rollup.clone(), seq),
        );
        Ok(())
    }

    async fn store_rollups(
        &self,
        store_id: Uuid,
        granularity: Granularity,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Rollup>, StoreError> {
        let state = self.state.lock().await;
        let mut rollups: Vec<Rollup> = state
            .rollups
            .values()
            .map(|(rollup, _)| rollup)
            .filter(|rollup| {
                rollup.store_id == store_id
                    && rollup.granularity == granularity
                    && rollup.bucket_start >= start
                    && rollup.bucket_start <= end
            })
            .cloned()
            .collect();
        rollups.sort_by(|a, b| {
            a.bucket_start
                .cmp(&b.bucket_start)
                .then_with(|| a.sensor_id.cmp(&b.sensor_id))
        });
        Ok(rollups)
    }

    async fn threshold_overrides(&self) -> Result<HashMap<Uuid, StoreThresholds>, StoreError> {
        Ok(self.state.lock().await.overrides.clone())
    }

    async fn open_alert(
        &self,
        store_id: Uuid,
        category: AlertCategory,
    ) -> Result<Option<AlertEvent>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .alerts
            .iter()
            .find(|alert| {
                alert.store_id == store_id
                    && alert.category == category
                    && alert.resolved_at.is_none()
            })
            .cloned())
    }

    async fn insert_alert(&self, alert: &AlertEvent) -> Result<(), StoreError> {
        self.state.lock().await.alerts.push(alert.clone());
        Ok(())
    }

    async fn resolve_alert(&self, alert_id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if let Some(alert) = state
            .alerts
            .iter_mut()
            .find(|alert| alert.id == alert_id && alert.resolved_at.is_none())
        {
            alert.resolved_at = Some(at);
        }
        Ok(())
    }

    async fn try_acquire_run_lock(&self) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        if state.run_locked {
            return Ok(false);
        }
        state.run_locked = true;
        Ok(true)
    }

    async fn release_run_lock(&self) -> Result<(), StoreError> {
        self.state.lock().await.run_locked = false;
        Ok(())
    }
}
