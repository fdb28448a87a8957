use super::TrafficStore;
use crate::alerts::{AlertCategory, AlertEvent, Severity, StoreThresholds};
use crate::error::StoreError;
use crate::model::{
    Direction, HeatmapRecord, InsertOutcome, LineCount, LineCrossingRecord, Ownership,
    RegionalCountRecord, SensorAddress, SensorCredentials, SensorDescriptor, VcaAlarmRecord,
    LINE_COUNT, REGION_COUNT,
};
use crate::rollup::{Granularity, RegionStat, Rollup, RollupMetrics};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::pool::PoolConnection;
use sqlx::postgres::PgRow;
use sqlx::types::Json as SqlJson;
use sqlx::{PgPool, Postgres, Row};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

type RegionStats = [Option<RegionStat>; REGION_COUNT];

pub struct PgStore {
    pool: PgPool,
    // Session advisory locks belong to a connection, so the holder keeps it
    // checked out until release.
    lock_conn: Mutex<Option<PoolConnection<Postgres>>>,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            lock_conn: Mutex::new(None),
        }
    }
}

fn advisory_lock_key(namespace: &str, value: &str) -> i64 {
    fn fnv1a_64(input: &str) -> u64 {
        let mut hash: u64 = 0xcbf29ce484222325;
        for byte in input.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x100000001b3);
        }
        hash
    }

    let combined = format!("{namespace}:{value}");
    fnv1a_64(&combined) as i64
}

fn run_lock_key() -> i64 {
    advisory_lock_key("footfall", "ingest_run")
}

fn rollup_table(granularity: Granularity) -> &'static str {
    match granularity {
        Granularity::Hour => "hourly_rollups",
        Granularity::Day => "daily_rollups",
    }
}

/// Maps an insert result onto the dedup outcome. Zero affected rows under
/// `ON CONFLICT DO NOTHING`, or a unique violation, means the row already exists.
fn insert_outcome(
    result: Result<sqlx::postgres::PgQueryResult, sqlx::Error>,
) -> Result<InsertOutcome, StoreError> {
    match result {
        Ok(done) if done.rows_affected() == 0 => Ok(InsertOutcome::Duplicate),
        Ok(_) => Ok(InsertOutcome::Inserted),
        Err(err) => {
            let err = StoreError::from(err);
            if err.is_unique_violation() {
                Ok(InsertOutcome::Duplicate)
            } else {
                Err(err)
            }
        }
    }
}

fn sensor_from_row(row: &PgRow) -> Result<SensorDescriptor, StoreError> {
    let id = row.try_get::<String, _>("id")?;
    let port = row.try_get::<i32, _>("port")?;
    let port = u16::try_from(port)
        .map_err(|_| StoreError::Decode(format!("sensor {id} has invalid port {port}")))?;
    let username = row.try_get::<Option<String>, _>("username")?;
    let password = row.try_get::<Option<String>, _>("password")?;
    let credentials = match (username, password) {
        (Some(username), Some(password)) if !username.trim().is_empty() => {
            Some(SensorCredentials { username, password })
        }
        _ => None,
    };

    Ok(SensorDescriptor {
        owner: Ownership {
            store_id: row.try_get("store_id")?,
            organization_id: row.try_get("organization_id")?,
        },
        address: SensorAddress {
            host: row.try_get::<Option<String>, _>("host")?.unwrap_or_default(),
            port,
            path_template: row.try_get("path_template")?,
        },
        credentials,
        active: row.try_get("active")?,
        timezone: row.try_get("timezone")?,
        last_seen: row.try_get("last_seen")?,
        id,
    })
}

const SENSOR_COLUMNS: &str = r#"
    s.id,
    s.store_id,
    st.organization_id,
    s.host,
    s.port,
    s.path_template,
    s.username,
    s.password,
    s.active,
    s.timezone,
    s.last_seen
"#;

fn line_crossing_from_row(row: &PgRow) -> Result<LineCrossingRecord, StoreError> {
    let mut lines = [LineCount::default(); LINE_COUNT];
    for (index, line) in lines.iter_mut().enumerate() {
        let n = index + 1;
        *line = LineCount::new(
            row.try_get::<i64, _>(format!("line{n}_in").as_str())?,
            row.try_get::<i64, _>(format!("line{n}_out").as_str())?,
        );
    }
    let direction = row
        .try_get::<Option<String>, _>("direction")?
        .as_deref()
        .and_then(Direction::parse);
    Ok(LineCrossingRecord {
        sensor_id: row.try_get("sensor_id")?,
        interval_start: row.try_get("interval_start")?,
        interval_end: row.try_get("interval_end")?,
        lines,
        direction,
    })
}

fn rollup_from_row(row: &PgRow, granularity: Granularity) -> Result<Rollup, StoreError> {
    let sensor_id = row.try_get::<String, _>("sensor_id")?;
    let distribution = row.try_get::<Vec<f64>, _>("line_distribution")?;
    let line_distribution: [f64; LINE_COUNT] = distribution.try_into().map_err(|raw: Vec<f64>| {
        StoreError::Decode(format!(
            "rollup for {sensor_id} has {} line fractions",
            raw.len()
        ))
    })?;
    let regions = row
        .try_get::<Option<SqlJson<RegionStats>>, _>("region_stats")?
        .map(|SqlJson(stats)| stats);
    let dominant_direction = row
        .try_get::<Option<String>, _>("dominant_direction")?
        .as_deref()
        .and_then(Direction::parse);

    Ok(Rollup {
        store_id: row.try_get("store_id")?,
        granularity,
        bucket_start: row.try_get("bucket_start")?,
        metrics: RollupMetrics {
            total_entries: row.try_get("total_entries")?,
            total_exits: row.try_get("total_exits")?,
            net_flow: row.try_get("net_flow")?,
            passing_traffic: row.try_get("passing_traffic")?,
            capture_rate: row.try_get("capture_rate")?,
            dominant_direction,
            line_distribution,
            regions,
            row_count: row.try_get("row_count")?,
            regional_count: row.try_get("regional_count")?,
        },
        computed_at: row.try_get("computed_at")?,
        sensor_id,
    })
}

fn alert_from_row(row: &PgRow) -> Result<AlertEvent, StoreError> {
    let raw_category = row.try_get::<String, _>("category")?;
    let category = AlertCategory::parse(&raw_category)
        .ok_or_else(|| StoreError::Decode(format!("unknown alert category {raw_category}")))?;
    let raw_severity = row.try_get::<String, _>("severity")?;
    let severity = Severity::parse(&raw_severity)
        .ok_or_else(|| StoreError::Decode(format!("unknown alert severity {raw_severity}")))?;
    Ok(AlertEvent {
        id: row.try_get("id")?,
        store_id: row.try_get("store_id")?,
        sensor_id: row.try_get("sensor_id")?,
        category,
        severity,
        triggered_at: row.try_get("triggered_at")?,
        resolved_at: row.try_get("resolved_at")?,
        metric_value: row.try_get("metric_value")?,
        threshold_value: row.try_get("threshold_value")?,
        message: row.try_get("message")?,
    })
}

#[async_trait]
impl TrafficStore for PgStore {
    async fn active_sensors(&self) -> Result<Vec<SensorDescriptor>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {SENSOR_COLUMNS}
            FROM sensors s
            JOIN stores st ON st.id = s.store_id
            WHERE s.active
            ORDER BY s.id
            "#
        ))
        .fetch_all(&self.pool)
        .await?;

        let mut sensors = Vec::with_capacity(rows.len());
        for row in &rows {
            match sensor_from_row(row) {
                Ok(sensor) => sensors.push(sensor),
                Err(err) => tracing::warn!(error = %err, "skipping unreadable sensor row"),
            }
        }
        Ok(sensors)
    }

    async fn sensor(&self, sensor_id: &str) -> Result<Option<SensorDescriptor>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {SENSOR_COLUMNS}
            FROM sensors s
            JOIN stores st ON st.id = s.store_id
            WHERE s.id = $1
            "#
        ))
        .bind(sensor_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(sensor_from_row).transpose()
    }

    async fn mark_sensor_seen(&self, sensor_id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query("UPDATE sensors SET last_seen = $2 WHERE id = $1")
            .bind(sensor_id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn latest_interval_start(
        &self,
        sensor_id: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let latest: Option<DateTime<Utc>> = sqlx::query_scalar(
            "SELECT max(interval_start) FROM line_crossings WHERE sensor_id = $1",
        )
        .bind(sensor_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(latest)
    }

    async fn insert_line_crossing(
        &self,
        owner: &Ownership,
        record: &LineCrossingRecord,
    ) -> Result<InsertOutcome, StoreError> {
        let [l1, l2, l3, l4] = record.lines;
        let result = sqlx::query(
            r#"
            INSERT INTO line_crossings (
                sensor_id,
                interval_start,
                interval_end,
                store_id,
                organization_id,
                line1_in, line1_out,
                line2_in, line2_out,
                line3_in, line3_out,
                line4_in, line4_out,
                direction,
                inserted_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (sensor_id, interval_start) DO NOTHING
            "#,
        )
        .bind(&record.sensor_id)
        .bind(record.interval_start)
        .bind(record.interval_end)
        .bind(owner.store_id)
        .bind(owner.organization_id)
        .bind(l1.inbound)
        .bind(l1.outbound)
        .bind(l2.inbound)
        .bind(l2.outbound)
        .bind(l3.inbound)
        .bind(l3.outbound)
        .bind(l4.inbound)
        .bind(l4.outbound)
        .bind(record.direction.map(Direction::as_str))
        .bind(Utc::now())
        .execute(&self.pool)
        .await;
        insert_outcome(result)
    }

    async fn insert_regional_count(
        &self,
        owner: &Ownership,
        record: &RegionalCountRecord,
    ) -> Result<InsertOutcome, StoreError> {
        let [r1, r2, r3, r4] = record.regions;
        let result = sqlx::query(
            r#"
            INSERT INTO regional_counts (
                sensor_id, ts, store_id, organization_id,
                region1, region2, region3, region4,
                inserted_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (sensor_id, ts) DO NOTHING
            "#,
        )
        .bind(&record.sensor_id)
        .bind(record.timestamp)
        .bind(owner.store_id)
        .bind(owner.organization_id)
        .bind(r1)
        .bind(r2)
        .bind(r3)
        .bind(r4)
        .bind(Utc::now())
        .execute(&self.pool)
        .await;
        insert_outcome(result)
    }

    async fn insert_heatmap(
        &self,
        owner: &Ownership,
        record: &HeatmapRecord,
    ) -> Result<InsertOutcome, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO heatmaps (sensor_id, ts, store_id, organization_id, cells, inserted_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (sensor_id, ts) DO NOTHING
            "#,
        )
        .bind(&record.sensor_id)
        .bind(record.timestamp)
        .bind(owner.store_id)
        .bind(owner.organization_id)
        .bind(SqlJson(&record.cells))
        .bind(Utc::now())
        .execute(&self.pool)
        .await;
        insert_outcome(result)
    }

    async fn insert_vca_alarm(
        &self,
        owner: &Ownership,
        record: &VcaAlarmRecord,
    ) -> Result<InsertOutcome, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO vca_alarms (
                sensor_id, ts, rule_name, event_type, object_count,
                store_id, organization_id, inserted_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (sensor_id, ts, rule_name) DO NOTHING
            "#,
        )
        .bind(&record.sensor_id)
        .bind(record.timestamp)
        .bind(&record.rule_name)
        .bind(&record.event_type)
        .bind(record.object_count)
        .bind(owner.store_id)
        .bind(owner.organization_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await;
        insert_outcome(result)
    }

    async fn stale_buckets(
        &self,
        sensor_id: &str,
        granularity: Granularity,
        since: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>, StoreError> {
        let table = rollup_table(granularity);
        let buckets: Vec<DateTime<Utc>> = sqlx::query_scalar(&format!(
            r#"
            WITH bounds AS (
                SELECT date_trunc($3, $2 AT TIME ZONE 'UTC') AT TIME ZONE 'UTC' AS first_bucket
            ),
            raw AS (
                SELECT
                    date_trunc($3, interval_start AT TIME ZONE 'UTC') AT TIME ZONE 'UTC' AS bucket_start,
                    inserted_at,
                    1 AS line_row,
                    0 AS regional_row
                FROM line_crossings, bounds
                WHERE sensor_id = $1 AND interval_start >= bounds.first_bucket
                UNION ALL
                SELECT
                    date_trunc($3, ts AT TIME ZONE 'UTC') AT TIME ZONE 'UTC' AS bucket_start,
                    inserted_at,
                    0 AS line_row,
                    1 AS regional_row
                FROM regional_counts, bounds
                WHERE sensor_id = $1 AND ts >= bounds.first_bucket
            )
            SELECT raw.bucket_start
            FROM raw
            LEFT JOIN {table} r
                ON r.sensor_id = $1 AND r.bucket_start = raw.bucket_start
            GROUP BY raw.bucket_start, r.computed_at, r.row_count, r.regional_count
            HAVING r.computed_at IS NULL
                OR max(raw.inserted_at) > r.computed_at
                OR sum(raw.line_row) <> r.row_count
                OR sum(raw.regional_row) <> r.regional_count
            ORDER BY raw.bucket_start
            "#
        ))
        .bind(sensor_id)
        .bind(since)
        .bind(granularity.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(buckets)
    }

    async fn line_crossings_in(
        &self,
        sensor_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<LineCrossingRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT
                sensor_id, interval_start, interval_end,
                line1_in, line1_out, line2_in, line2_out,
                line3_in, line3_out, line4_in, line4_out,
                direction
            FROM line_crossings
            WHERE sensor_id = $1 AND interval_start >= $2 AND interval_start < $3
            ORDER BY interval_start
            "#,
        )
        .bind(sensor_id)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(line_crossing_from_row).collect()
    }

    async fn regional_counts_in(
        &self,
        sensor_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RegionalCountRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT sensor_id, ts, region1, region2, region3, region4
            FROM regional_counts
            WHERE sensor_id = $1 AND ts >= $2 AND ts < $3
            ORDER BY ts
            "#,
        )
        .bind(sensor_id)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            records.push(RegionalCountRecord {
                sensor_id: row.try_get("sensor_id")?,
                timestamp: row.try_get("ts")?,
                regions: [
                    row.try_get("region1")?,
                    row.try_get("region2")?,
                    row.try_get("region3")?,
                    row.try_get("region4")?,
                ],
            });
        }
        Ok(records)
    }

    async fn upsert_rollup(&self, rollup: &Rollup) -> Result<(), StoreError> {
        let table = rollup_table(rollup.granularity);
        let metrics = &rollup.metrics;
        sqlx::query(&format!(
            r#"
            INSERT INTO {table} (
                sensor_id,
                store_id,
                bucket_start,
                total_entries,
                total_exits,
                net_flow,
                passing_traffic,
                capture_rate,
                dominant_direction,
                line_distribution,
                region_stats,
                row_count,
                regional_count,
                computed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (sensor_id, bucket_start) DO UPDATE SET
                store_id = EXCLUDED.store_id,
                total_entries = EXCLUDED.total_entries,
                total_exits = EXCLUDED.total_exits,
                net_flow = EXCLUDED.net_flow,
                passing_traffic = EXCLUDED.passing_traffic,
                capture_rate = EXCLUDED.capture_rate,
                dominant_direction = EXCLUDED.dominant_direction,
                line_distribution = EXCLUDED.line_distribution,
                region_stats = EXCLUDED.region_stats,
                row_count = EXCLUDED.row_count,
                regional_count = EXCLUDED.regional_count,
                computed_at = EXCLUDED.computed_at
            "#
        ))
        .bind(&rollup.sensor_id)
        .bind(rollup.store_id)
        .bind(rollup.bucket_start)
        .bind(metrics.total_entries)
        .bind(metrics.total_exits)
        .bind(metrics.net_flow)
        .bind(metrics.passing_traffic)
        .bind(metrics.capture_rate)
        .bind(metrics.dominant_direction.map(Direction::as_str))
        .bind(metrics.line_distribution.to_vec())
        .bind(metrics.regions.map(SqlJson))
        .bind(metrics.row_count)
        .bind(metrics.regional_count)
        .bind(rollup.computed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn store_rollups(
        &self,
        store_id: Uuid,
        granularity: Granularity,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Rollup>, StoreError> {
        let table = rollup_table(granularity);
        let rows = sqlx::query(&format!(
            r#"
            SELECT
                sensor_id, store_id, bucket_start,
                total_entries, total_exits, net_flow, passing_traffic,
                capture_rate, dominant_direction, line_distribution,
                region_stats, row_count, regional_count, computed_at
            FROM {table}
            WHERE store_id = $1 AND bucket_start >= $2 AND bucket_start <= $3
            ORDER BY bucket_start, sensor_id
            "#
        ))
        .bind(store_id)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| rollup_from_row(row, granularity))
            .collect()
    }

    async fn threshold_overrides(&self) -> Result<HashMap<Uuid, StoreThresholds>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT store_id, capacity, min_capture_rate, max_queue_length
            FROM store_alert_thresholds
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut overrides = HashMap::with_capacity(rows.len());
        for row in &rows {
            overrides.insert(
                row.try_get::<Uuid, _>("store_id")?,
                StoreThresholds {
                    capacity: row.try_get("capacity")?,
                    min_capture_rate: row.try_get("min_capture_rate")?,
                    max_queue_length: row.try_get("max_queue_length")?,
                },
            );
        }
        Ok(overrides)
    }

    async fn open_alert(
        &self,
        store_id: Uuid,
        category: AlertCategory,
    ) -> Result<Option<AlertEvent>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                id, store_id, sensor_id, category, severity,
                triggered_at, resolved_at, metric_value, threshold_value, message
            FROM alert_events
            WHERE store_id = $1 AND category = $2 AND resolved_at IS NULL
            ORDER BY triggered_at DESC
            LIMIT 1
            "#,
        )
        .bind(store_id)
        .bind(category.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(alert_from_row).transpose()
    }

    async fn insert_alert(&self, alert: &AlertEvent) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO alert_events (
                id, store_id, sensor_id, category, severity,
                triggered_at, resolved_at, metric_value, threshold_value, message
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(alert.id)
        .bind(alert.store_id)
        .bind(alert.sensor_id.as_deref())
        .bind(alert.category.as_str())
        .bind(alert.severity.as_str())
        .bind(alert.triggered_at)
        .bind(alert.resolved_at)
        .bind(alert.metric_value)
        .bind(alert.threshold_value)
        .bind(&alert.message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn resolve_alert(&self, alert_id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE alert_events
            SET resolved_at = $2
            WHERE id = $1 AND resolved_at IS NULL
            "#,
        )
        .bind(alert_id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn try_acquire_run_lock(&self) -> Result<bool, StoreError> {
        let mut held = self.lock_conn.lock().await;
        if held.is_some() {
            return Ok(false);
        }
        let mut conn = self.pool.acquire().await?;
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(run_lock_key())
            .fetch_one(&mut *conn)
            .await?;
        if acquired {
            *held = Some(conn);
        }
        Ok(acquired)
    }

    async fn release_run_lock(&self) -> Result<(), StoreError> {
        let Some(mut conn) = self.lock_conn.lock().await.take() else {
            return Ok(());
        };
        let released: bool = match sqlx::query_scalar("SELECT pg_advisory_unlock($1)")
            .bind(run_lock_key())
            .fetch_one(&mut *conn)
            .await
        {
            Ok(released) => released,
            Err(err) => {
                // Closing the session drops the lock with it.
                conn.close_on_drop();
                return Err(err.into());
            }
        };
        if !released {
            tracing::warn!("run lock was not held by this session");
        }
        Ok(())
    }
}
