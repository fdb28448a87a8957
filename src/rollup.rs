mod compute;

pub use compute::{
    capture_rate, compute_metrics, dominant_direction, line_distribution, Granularity, RegionStat,
    Rollup, RollupMetrics,
};

use crate::error::StoreError;
use crate::model::SensorDescriptor;
use crate::store::TrafficStore;
use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Copy)]
pub struct RollupSettings {
    /// Raw rows older than this are never re-aggregated.
    pub lookback: Duration,
    pub max_concurrency: usize,
}

impl Default for RollupSettings {
    fn default() -> Self {
        Self {
            lookback: Duration::hours(48),
            max_concurrency: 8,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RollupReport {
    pub sensors: u64,
    pub sensors_failed: u64,
    pub buckets_written: u64,
    pub buckets_skipped: u64,
    pub buckets_failed: u64,
    pub hourly: u64,
    pub daily: u64,
}

impl RollupReport {
    fn merge(&mut self, other: &RollupReport) {
        self.sensors += other.sensors;
        self.sensors_failed += other.sensors_failed;
        self.buckets_written += other.buckets_written;
        self.buckets_skipped += other.buckets_skipped;
        self.buckets_failed += other.buckets_failed;
        self.hourly += other.hourly;
        self.daily += other.daily;
    }
}

/// Recomputes stale hourly and daily buckets wholesale and upserts them.
#[derive(Clone)]
pub struct RollupAggregator {
    store: Arc<dyn TrafficStore>,
    settings: RollupSettings,
}

impl RollupAggregator {
    pub fn new(store: Arc<dyn TrafficStore>, settings: RollupSettings) -> Self {
        Self { store, settings }
    }

    pub async fn run(&self, now: DateTime<Utc>) -> Result<RollupReport, StoreError> {
        let sensors = self.store.active_sensors().await?;
        let since = now - self.settings.lookback;

        let outcomes: Vec<RollupReport> = stream::iter(sensors)
            .map(|sensor| async move { self.roll_sensor(&sensor, since).await })
            .buffer_unordered(self.settings.max_concurrency.max(1))
            .collect()
            .await;

        let mut report = RollupReport::default();
        for outcome in &outcomes {
            report.merge(outcome);
        }
        tracing::info!(
            sensors = report.sensors,
            written = report.buckets_written,
            skipped = report.buckets_skipped,
            failed = report.buckets_failed,
            "rollup pass finished"
        );
        Ok(report)
    }

    async fn roll_sensor(&self, sensor: &SensorDescriptor, since: DateTime<Utc>) -> RollupReport {
        let mut report = RollupReport {
            sensors: 1,
            ..RollupReport::default()
        };

        for granularity in Granularity::ALL {
            let buckets = match self
                .store
                .stale_buckets(&sensor.id, granularity, since)
                .await
            {
                Ok(buckets) => buckets,
                Err(err) => {
                    tracing::warn!(
                        sensor = %sensor.id,
                        granularity = granularity.as_str(),
                        error = %err,
                        "failed to list stale buckets"
                    );
                    report.sensors_failed += 1;
                    continue;
                }
            };

            for bucket_start in buckets {
                match self.roll_bucket(sensor, granularity, bucket_start).await {
                    Ok(Some(_)) => {
                        report.buckets_written += 1;
                        match granularity {
                            Granularity::Hour => report.hourly += 1,
                            Granularity::Day => report.daily += 1,
                        }
                    }
                    Ok(None) => report.buckets_skipped += 1,
                    Err(err) => {
                        tracing::warn!(
                            sensor = %sensor.id,
                            granularity = granularity.as_str(),
                            bucket = %bucket_start,
                            error = %err,
                            "rollup bucket failed"
                        );
                        report.buckets_failed += 1;
                    }
                }
            }
        }
        report
    }

    /// Recomputes one bucket from its raw rows. `None` when the bucket holds
    /// no line-crossing rows.
    pub async fn roll_bucket(
        &self,
        sensor: &SensorDescriptor,
        granularity: Granularity,
        bucket_start: DateTime<Utc>,
    ) -> Result<Option<Rollup>, StoreError> {
        // Taken before reading so rows landing mid-computation keep the bucket stale.
        let computed_at = Utc::now();
        let bucket_end = bucket_start + granularity.width();
        let rows = self
            .store
            .line_crossings_in(&sensor.id, bucket_start, bucket_end)
            .await?;
        let regional = self
            .store
            .regional_counts_in(&sensor.id, bucket_start, bucket_end)
            .await?;

        let Some(metrics) = compute_metrics(&rows, &regional) else {
            return Ok(None);
        };
        let rollup = Rollup {
            sensor_id: sensor.id.clone(),
            store_id: sensor.owner.store_id,
            granularity,
            bucket_start,
            metrics,
            computed_at,
        };
        self.store.upsert_rollup(&rollup).await?;
        Ok(Some(rollup))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        LineCount, LineCrossingRecord, Ownership, RegionalCountRecord, SensorAddress,
        LINE_COUNT,
    };
    use crate::store::MemoryStore;
    use chrono::TimeZone;
    use uuid::Uuid;

    fn sensor(id: &str, store_id: Uuid) -> SensorDescriptor {
        SensorDescriptor {
            id: id.to_string(),
            owner: Ownership {
                store_id,
                organization_id: Uuid::nil(),
            },
            address: SensorAddress {
                host: "10.0.0.1".to_string(),
                port: 80,
                path_template: None,
            },
            credentials: None,
            active: true,
            timezone: None,
            last_seen: None,
        }
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, h, m, 0).unwrap()
    }

    fn row(sensor_id: &str, start: DateTime<Utc>, inbound: i64, outbound: i64) -> LineCrossingRecord {
        let mut lines = [LineCount::default(); LINE_COUNT];
        lines[0] = LineCount::new(inbound, outbound);
        LineCrossingRecord::new(sensor_id, start, start + Duration::minutes(15), lines)
    }

    async fn seeded() -> (Arc<MemoryStore>, SensorDescriptor) {
        let target = sensor("s1", Uuid::new_v4());
        let store = Arc::new(MemoryStore::with_sensors([target.clone()]));
        for record in [row("s1", at(10, 0), 5, 2), row("s1", at(10, 15), 3, 1)] {
            store.insert_line_crossing(&target.owner, &record).await.unwrap();
        }
        (store, target)
    }

    #[tokio::test]
    async fn writes_hourly_and_daily_buckets() {
        let (store, _) = seeded().await;
        let aggregator = RollupAggregator::new(store.clone(), RollupSettings::default());
        let report = aggregator.run(at(11, 0)).await.unwrap();

        assert_eq!(report.hourly, 1);
        assert_eq!(report.daily, 1);
        assert_eq!(report.buckets_failed, 0);

        let hourly = store.rollup(Granularity::Hour, "s1", at(10, 0)).await.unwrap();
        assert_eq!(hourly.metrics.total_entries, 8);
        assert_eq!(hourly.metrics.total_exits, 3);
        assert_eq!(hourly.metrics.net_flow, 5);
        let daily = store.rollup(Granularity::Day, "s1", at(0, 0)).await.unwrap();
        assert_eq!(daily.metrics, hourly.metrics);
    }

    #[tokio::test]
    async fn fresh_buckets_are_not_recomputed() {
        let (store, _) = seeded().await;
        let aggregator = RollupAggregator::new(store.clone(), RollupSettings::default());
        aggregator.run(at(11, 0)).await.unwrap();
        let second = aggregator.run(at(11, 5)).await.unwrap();
        assert_eq!(second.buckets_written, 0);
    }

    #[tokio::test]
    async fn late_row_makes_bucket_stale_again() {
        let (store, target) = seeded().await;
        let aggregator = RollupAggregator::new(store.clone(), RollupSettings::default());
        aggregator.run(at(11, 0)).await.unwrap();

        store
            .insert_line_crossing(&target.owner, &row("s1", at(10, 30), 4, 0))
            .await
            .unwrap();
        let report = aggregator.run(at(11, 5)).await.unwrap();
        assert_eq!(report.hourly, 1);
        let hourly = store.rollup(Granularity::Hour, "s1", at(10, 0)).await.unwrap();
        assert_eq!(hourly.metrics.total_entries, 12);
    }

    #[tokio::test]
    async fn rollup_missing_a_committed_row_is_recomputed() {
        let (store, target) = seeded().await;
        // Written after both inserts but computed from only one of them.
        let partial = compute_metrics(&[row("s1", at(10, 0), 5, 2)], &[]).unwrap();
        store
            .upsert_rollup(&Rollup {
                sensor_id: "s1".to_string(),
                store_id: target.owner.store_id,
                granularity: Granularity::Hour,
                bucket_start: at(10, 0),
                metrics: partial,
                computed_at: at(11, 0),
            })
            .await
            .unwrap();

        let aggregator = RollupAggregator::new(store.clone(), RollupSettings::default());
        let report = aggregator.run(at(11, 5)).await.unwrap();
        assert_eq!(report.hourly, 1);
        let hourly = store.rollup(Granularity::Hour, "s1", at(10, 0)).await.unwrap();
        assert_eq!(hourly.metrics.row_count, 2);
        assert_eq!(hourly.metrics.total_entries, 8);
    }

    #[tokio::test]
    async fn recomputation_yields_identical_metrics() {
        let (store, target) = seeded().await;
        let aggregator = RollupAggregator::new(store.clone(), RollupSettings::default());
        let first = aggregator
            .roll_bucket(&target, Granularity::Hour, at(10, 0))
            .await
            .unwrap()
            .unwrap();
        let second = aggregator
            .roll_bucket(&target, Granularity::Hour, at(10, 0))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            serde_json::to_string(&first.metrics).unwrap(),
            serde_json::to_string(&second.metrics).unwrap()
        );
    }

    #[tokio::test]
    async fn regional_only_bucket_is_skipped() {
        let target = sensor("s2", Uuid::new_v4());
        let store = Arc::new(MemoryStore::with_sensors([target.clone()]));
        store
            .insert_regional_count(
                &target.owner,
                &RegionalCountRecord {
                    sensor_id: "s2".to_string(),
                    timestamp: at(9, 10),
                    regions: [Some(3), None, None, None],
                },
            )
            .await
            .unwrap();
        let report = RollupAggregator::new(store.clone(), RollupSettings::default())
            .run(at(11, 0))
            .await
            .unwrap();
        assert_eq!(report.buckets_written, 0);
        assert_eq!(report.buckets_skipped, 2);
        assert!(store.rollup(Granularity::Hour, "s2", at(9, 0)).await.is_none());
    }

    #[tokio::test]
    async fn failed_bucket_write_is_counted_and_retried_next_pass() {
        let (store, _) = seeded().await;
        store.fail_rollup_writes(true).await;
        let aggregator = RollupAggregator::new(store.clone(), RollupSettings::default());
        let report = aggregator.run(at(11, 0)).await.unwrap();
        assert_eq!(report.buckets_failed, 2);
        assert_eq!(report.buckets_written, 0);

        store.fail_rollup_writes(false).await;
        let retry = aggregator.run(at(11, 5)).await.unwrap();
        assert_eq!(retry.buckets_written, 2);
    }

    #[tokio::test]
    async fn rows_outside_lookback_are_ignored() {
        let (store, _) = seeded().await;
        let aggregator = RollupAggregator::new(store.clone(), RollupSettings::default());
        let report = aggregator.run(at(10, 0) + Duration::days(3)).await.unwrap();
        assert_eq!(report.buckets_written, 0);
    }
}
