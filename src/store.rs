//! Persistence seam. The pipeline only talks to [`TrafficStore`]; the
//! PostgreSQL implementation lives in [`pg`] and an in-memory one in
//! [`memory`] backs the scenario tests.

use crate::alerts::{AlertCategory, AlertEvent, StoreThresholds};
use crate::error::StoreError;
use crate::model::{
    HeatmapRecord, InsertOutcome, LineCrossingRecord, Ownership, RegionalCountRecord,
    SensorDescriptor, VcaAlarmRecord,
};
use crate::rollup::{Granularity, Rollup};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use uuid::Uuid;

pub mod memory;
pub mod pg;

pub use memory::MemoryStore;
pub use pg::PgStore;

#[async_trait]
pub trait TrafficStore: Send + Sync {
    /// Active sensors joined to their owning store.
    async fn active_sensors(&self) -> Result<Vec<SensorDescriptor>, StoreError>;

    async fn sensor(&self, sensor_id: &str) -> Result<Option<SensorDescriptor>, StoreError>;

    async fn mark_sensor_seen(&self, sensor_id: &str, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Newest persisted interval start for the sensor.
    async fn latest_interval_start(
        &self,
        sensor_id: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Insert keyed by `(sensor_id, interval_start)`. A key conflict is
    /// reported as [`InsertOutcome::Duplicate`], never as an error.
    async fn insert_line_crossing(
        &self,
        owner: &Ownership,
        record: &LineCrossingRecord,
    ) -> Result<InsertOutcome, StoreError>;

    async fn insert_regional_count(
        &self,
        owner: &Ownership,
        record: &RegionalCountRecord,
    ) -> Result<InsertOutcome, StoreError>;

    async fn insert_heatmap(
        &self,
        owner: &Ownership,
        record: &HeatmapRecord,
    ) -> Result<InsertOutcome, StoreError>;

    async fn insert_vca_alarm(
        &self,
        owner: &Ownership,
        record: &VcaAlarmRecord,
    ) -> Result<InsertOutcome, StoreError>;

    /// Buckets from the one containing `since` onwards whose raw rows are newer
    /// than their rollup, whose raw row counts no longer match it, or that have
    /// no rollup at all.
    async fn stale_buckets(
        &self,
        sensor_id: &str,
        granularity: Granularity,
        since: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>, StoreError>;

    /// Line-crossing rows with `start <= interval_start < end`.
    async fn line_crossings_in(
        &self,
        sensor_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<LineCrossingRecord>, StoreError>;

    async fn regional_counts_in(
        &self,
        sensor_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RegionalCountRecord>, StoreError>;

    /// Upsert keyed by `(sensor_id, bucket_start)` within the granularity.
    async fn upsert_rollup(&self, rollup: &Rollup) -> Result<(), StoreError>;

    /// Rollups of every sensor in the store with `start <= bucket_start <= end`.
    async fn store_rollups(
        &self,
        store_id: Uuid,
        granularity: Granularity,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Rollup>, StoreError>;

    async fn threshold_overrides(&self) -> Result<HashMap<Uuid, StoreThresholds>, StoreError>;

    async fn open_alert(
        &self,
        store_id: Uuid,
        category: AlertCategory,
    ) -> Result<Option<AlertEvent>, StoreError>;

    async fn insert_alert(&self, alert: &AlertEvent) -> Result<(), StoreError>;

    async fn resolve_alert(&self, alert_id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Cross-process run lock. Returns false when another run holds it.
    async fn try_acquire_run_lock(&self) -> Result<bool, StoreError>;

    async fn release_run_lock(&self) -> Result<(), StoreError>;
}
