use crate::error::StoreError;
use crate::rollup::{Granularity, Rollup};
use crate::store::TrafficStore;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use uuid::Uuid;

/// Fraction above a ceiling (or below half a floor) that makes a breach critical.
const CRITICAL_MARGIN: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertCategory {
    Capacity,
    CaptureRate,
    Queue,
}

impl AlertCategory {
    pub const ALL: [AlertCategory; 3] = [Self::Capacity, Self::CaptureRate, Self::Queue];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Capacity => "capacity",
            Self::CaptureRate => "capture_rate",
            Self::Queue => "queue",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "capacity" => Some(Self::Capacity),
            "capture_rate" => Some(Self::CaptureRate),
            "queue" => Some(Self::Queue),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "warning" => Some(Self::Warning),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertEvent {
    pub id: Uuid,
    pub store_id: Uuid,
    pub sensor_id: Option<String>,
    pub category: AlertCategory,
    pub severity: Severity,
    pub triggered_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub metric_value: f64,
    pub threshold_value: f64,
    pub message: String,
}

/// Effective limits for one store. A limit of zero or less disables its category.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdDefaults {
    pub capacity: i64,
    pub min_capture_rate: f64,
    pub max_queue_length: i64,
}

/// Per-store overrides; unset fields inherit the defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreThresholds {
    pub capacity: Option<i64>,
    pub min_capture_rate: Option<f64>,
    pub max_queue_length: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlertThresholds {
    pub defaults: ThresholdDefaults,
    pub per_store: HashMap<Uuid, StoreThresholds>,
}

impl AlertThresholds {
    pub fn new(defaults: ThresholdDefaults) -> Self {
        Self {
            defaults,
            per_store: HashMap::new(),
        }
    }

    pub fn for_store(&self, store_id: Uuid) -> ThresholdDefaults {
        let overrides = self.per_store.get(&store_id).copied().unwrap_or_default();
        ThresholdDefaults {
            capacity: overrides.capacity.unwrap_or(self.defaults.capacity),
            min_capture_rate: overrides
                .min_capture_rate
                .unwrap_or(self.defaults.min_capture_rate),
            max_queue_length: overrides
                .max_queue_length
                .unwrap_or(self.defaults.max_queue_length),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub category: AlertCategory,
    pub value: f64,
    pub sensor_id: Option<String>,
}

/// Observed metrics for one store from its hourly rollups. Categories without
/// enough data are left out and therefore not evaluated.
pub fn observe(rollups: &[Rollup], now: DateTime<Utc>) -> Vec<Observation> {
    let midnight = Granularity::Day.bucket_start(now);
    let current_hour = Granularity::Hour.bucket_start(now);
    let last_complete_hour = current_hour - Duration::hours(1);
    let mut observations = Vec::with_capacity(AlertCategory::ALL.len());

    let net_today: i64 = rollups
        .iter()
        .filter(|rollup| rollup.bucket_start >= midnight)
        .map(|rollup| rollup.metrics.net_flow)
        .sum();
    observations.push(Observation {
        category: AlertCategory::Capacity,
        value: net_today.max(0) as f64,
        sensor_id: None,
    });

    let (entries, passing) = rollups
        .iter()
        .filter(|rollup| rollup.bucket_start == last_complete_hour)
        .fold((0i64, 0i64), |(entries, passing), rollup| {
            (
                entries + rollup.metrics.total_entries,
                passing + rollup.metrics.passing_traffic,
            )
        });
    if passing > 0 {
        observations.push(Observation {
            category: AlertCategory::CaptureRate,
            value: entries.max(0) as f64 / passing as f64,
            sensor_id: None,
        });
    }

    let latest_regional = rollups
        .iter()
        .filter(|rollup| rollup.bucket_start >= last_complete_hour && rollup.metrics.regions.is_some())
        .map(|rollup| rollup.bucket_start)
        .max();
    if let Some(bucket) = latest_regional {
        let mut peak: Option<(i64, &str)> = None;
        for rollup in rollups.iter().filter(|rollup| rollup.bucket_start == bucket) {
            let Some(regions) = rollup.metrics.regions.as_ref() else {
                continue;
            };
            for stat in regions.iter().flatten() {
                if peak.map_or(true, |(value, _)| stat.maximum > value) {
                    peak = Some((stat.maximum, rollup.sensor_id.as_str()));
                }
            }
        }
        if let Some((value, sensor_id)) = peak {
            observations.push(Observation {
                category: AlertCategory::Queue,
                value: value as f64,
                sensor_id: Some(sensor_id.to_string()),
            });
        }
    }

    observations
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Breach {
    pub severity: Severity,
    pub threshold: f64,
}

pub fn breach(category: AlertCategory, value: f64, limits: &ThresholdDefaults) -> Option<Breach> {
    match category {
        AlertCategory::Capacity => ceiling_breach(value, limits.capacity as f64),
        AlertCategory::Queue => ceiling_breach(value, limits.max_queue_length as f64),
        AlertCategory::CaptureRate => {
            let floor = limits.min_capture_rate;
            if floor <= 0.0 || value >= floor {
                return None;
            }
            let severity = if value < floor / 2.0 {
                Severity::Critical
            } else {
                Severity::Warning
            };
            Some(Breach {
                severity,
                threshold: floor,
            })
        }
    }
}

fn ceiling_breach(value: f64, ceiling: f64) -> Option<Breach> {
    if ceiling <= 0.0 || value <= ceiling {
        return None;
    }
    let severity = if value >= ceiling * (1.0 + CRITICAL_MARGIN) {
        Severity::Critical
    } else {
        Severity::Warning
    };
    Some(Breach {
        severity,
        threshold: ceiling,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Trigger,
    Resolve(Uuid),
    Unchanged,
}

/// Per (store, category): clear -> triggered -> open -> clear.
pub fn next_transition(open: Option<&AlertEvent>, breached: bool) -> Transition {
    match (open, breached) {
        (None, true) => Transition::Trigger,
        (Some(alert), false) => Transition::Resolve(alert.id),
        _ => Transition::Unchanged,
    }
}

fn describe(category: AlertCategory, value: f64, threshold: f64) -> String {
    match category {
        AlertCategory::Capacity => {
            format!("occupancy {value:.0} exceeds capacity {threshold:.0}")
        }
        AlertCategory::CaptureRate => format!(
            "capture rate {:.1}% below minimum {:.1}%",
            value * 100.0,
            threshold * 100.0
        ),
        AlertCategory::Queue => {
            format!("queue length {value:.0} exceeds limit {threshold:.0}")
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AlertReport {
    pub triggered: u64,
    pub resolved: u64,
    pub unchanged: u64,
    pub failed: u64,
}

impl AlertReport {
    fn merge(&mut self, other: &AlertReport) {
        self.triggered += other.triggered;
        self.resolved += other.resolved;
        self.unchanged += other.unchanged;
        self.failed += other.failed;
    }
}

#[derive(Clone)]
pub struct AlertEvaluator {
    store: Arc<dyn TrafficStore>,
}

impl AlertEvaluator {
    pub fn new(store: Arc<dyn TrafficStore>) -> Self {
        Self { store }
    }

    /// Evaluates every store that owns an active sensor. A store that fails is
    /// logged and counted; the rest still run.
    pub async fn evaluate(
        &self,
        thresholds: &AlertThresholds,
        now: DateTime<Utc>,
    ) -> Result<AlertReport, StoreError> {
        let store_ids: BTreeSet<Uuid> = self
            .store
            .active_sensors()
            .await?
            .into_iter()
            .map(|sensor| sensor.owner.store_id)
            .collect();

        let mut report = AlertReport::default();
        for store_id in store_ids {
            match self
                .evaluate_store(store_id, &thresholds.for_store(store_id), now)
                .await
            {
                Ok(outcome) => report.merge(&outcome),
                Err(err) => {
                    tracing::warn!(store = %store_id, error = %err, "alert evaluation failed");
                    report.failed += 1;
                }
            }
        }

        tracing::info!(
            triggered = report.triggered,
            resolved = report.resolved,
            unchanged = report.unchanged,
            failed = report.failed,
            "alert evaluation finished"
        );
        Ok(report)
    }

    async fn evaluate_store(
        &self,
        store_id: Uuid,
        limits: &ThresholdDefaults,
        now: DateTime<Utc>,
    ) -> Result<AlertReport, StoreError> {
        let since = Granularity::Day
            .bucket_start(now)
            .min(Granularity::Hour.bucket_start(now) - Duration::hours(1));
        let rollups = self
            .store
            .store_rollups(store_id, Granularity::Hour, since, now)
            .await?;

        let mut report = AlertReport::default();
        for observation in observe(&rollups, now) {
            let category = observation.category;
            let found = breach(category, observation.value, limits);
            let open = self.store.open_alert(store_id, category).await?;

            match next_transition(open.as_ref(), found.is_some()) {
                Transition::Trigger => {
                    let Some(found) = found else {
                        continue;
                    };
                    let alert = AlertEvent {
                        id: Uuid::new_v4(),
                        store_id,
                        sensor_id: observation.sensor_id.clone(),
                        category,
                        severity: found.severity,
                        triggered_at: now,
                        resolved_at: None,
                        metric_value: observation.value,
                        threshold_value: found.threshold,
                        message: describe(category, observation.value, found.threshold),
                    };
                    self.store.insert_alert(&alert).await?;
                    tracing::info!(
                        store = %store_id,
                        category = category.as_str(),
                        severity = found.severity.as_str(),
                        value = observation.value,
                        "alert triggered"
                    );
                    report.triggered += 1;
                }
                Transition::Resolve(alert_id) => {
                    self.store.resolve_alert(alert_id, now).await?;
                    tracing::info!(store = %store_id, category = category.as_str(), "alert resolved");
                    report.resolved += 1;
                }
                Transition::Unchanged => report.unchanged += 1,
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rollup::{RegionStat, RollupMetrics};
    use chrono::TimeZone;

    fn limits() -> ThresholdDefaults {
        ThresholdDefaults {
            capacity: 100,
            min_capture_rate: 0.1,
            max_queue_length: 5,
        }
    }

    fn hourly(bucket_start: DateTime<Utc>, entries: i64, exits: i64, passing: i64) -> Rollup {
        Rollup {
            sensor_id: "s1".to_string(),
            store_id: Uuid::nil(),
            granularity: Granularity::Hour,
            bucket_start,
            metrics: RollupMetrics {
                total_entries: entries,
                total_exits: exits,
                net_flow: entries - exits,
                passing_traffic: passing,
                capture_rate: 0.0,
                dominant_direction: None,
                line_distribution: [0.0; 4],
                regions: None,
                row_count: 4,
                regional_count: 0,
            },
            computed_at: bucket_start,
        }
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, h, m, 0).unwrap()
    }

    fn value(observations: &[Observation], category: AlertCategory) -> Option<f64> {
        observations
            .iter()
            .find(|obs| obs.category == category)
            .map(|obs| obs.value)
    }

    #[test]
    fn occupancy_sums_net_flow_since_midnight() {
        let rollups = vec![
            hourly(at(8, 0), 40, 10, 0),
            hourly(at(9, 0), 20, 35, 0),
            hourly(at(10, 0), 5, 0, 0),
        ];
        let observations = observe(&rollups, at(10, 20));
        assert_eq!(value(&observations, AlertCategory::Capacity), Some(20.0));
    }

    #[test]
    fn occupancy_never_goes_negative() {
        let observations = observe(&[hourly(at(9, 0), 2, 30, 0)], at(10, 5));
        assert_eq!(value(&observations, AlertCategory::Capacity), Some(0.0));
    }

    #[test]
    fn capture_rate_uses_last_complete_hour_only() {
        let rollups = vec![hourly(at(9, 0), 10, 0, 200), hourly(at(10, 0), 90, 0, 100)];
        let observations = observe(&rollups, at(10, 30));
        assert_eq!(value(&observations, AlertCategory::CaptureRate), Some(0.05));
    }

    #[test]
    fn capture_rate_skipped_without_passing_traffic() {
        let observations = observe(&[hourly(at(9, 0), 10, 0, 0)], at(10, 30));
        assert_eq!(value(&observations, AlertCategory::CaptureRate), None);
        assert_eq!(value(&observations, AlertCategory::Queue), None);
    }

    #[test]
    fn queue_uses_peak_region_of_latest_bucket() {
        let mut earlier = hourly(at(9, 0), 0, 0, 0);
        earlier.metrics.regions = Some([
            Some(RegionStat { average: 1.0, maximum: 12 }),
            None,
            None,
            None,
        ]);
        let mut latest = hourly(at(10, 0), 0, 0, 0);
        latest.sensor_id = "s2".to_string();
        latest.metrics.regions = Some([
            Some(RegionStat { average: 1.0, maximum: 3 }),
            Some(RegionStat { average: 2.0, maximum: 7 }),
            None,
            None,
        ]);
        let observations = observe(&[earlier, latest], at(10, 40));
        let queue = observations
            .iter()
            .find(|obs| obs.category == AlertCategory::Queue)
            .unwrap();
        assert_eq!(queue.value, 7.0);
        assert_eq!(queue.sensor_id.as_deref(), Some("s2"));
    }

    #[test]
    fn severity_bands() {
        let limits = limits();
        assert_eq!(breach(AlertCategory::Capacity, 100.0, &limits), None);
        assert_eq!(
            breach(AlertCategory::Capacity, 110.0, &limits).map(|b| b.severity),
            Some(Severity::Warning)
        );
        assert_eq!(
            breach(AlertCategory::Capacity, 120.0, &limits).map(|b| b.severity),
            Some(Severity::Critical)
        );
        assert_eq!(
            breach(AlertCategory::CaptureRate, 0.08, &limits).map(|b| b.severity),
            Some(Severity::Warning)
        );
        assert_eq!(
            breach(AlertCategory::CaptureRate, 0.04, &limits).map(|b| b.severity),
            Some(Severity::Critical)
        );
        assert_eq!(breach(AlertCategory::CaptureRate, 0.1, &limits), None);
    }

    #[test]
    fn non_positive_limit_disables_category() {
        let mut limits = limits();
        limits.capacity = 0;
        assert_eq!(breach(AlertCategory::Capacity, 1_000.0, &limits), None);
    }

    #[test]
    fn open_alert_is_never_duplicated() {
        let alert = AlertEvent {
            id: Uuid::new_v4(),
            store_id: Uuid::nil(),
            sensor_id: None,
            category: AlertCategory::Capacity,
            severity: Severity::Warning,
            triggered_at: at(9, 0),
            resolved_at: None,
            metric_value: 110.0,
            threshold_value: 100.0,
            message: String::new(),
        };
        assert_eq!(next_transition(None, true), Transition::Trigger);
        assert_eq!(next_transition(Some(&alert), true), Transition::Unchanged);
        assert_eq!(next_transition(Some(&alert), false), Transition::Resolve(alert.id));
        assert_eq!(next_transition(None, false), Transition::Unchanged);
    }

    #[tokio::test]
    async fn alert_opens_once_and_resolves_when_cleared() {
        use crate::model::{Ownership, SensorAddress, SensorDescriptor};
        use crate::store::MemoryStore;

        let store = Arc::new(MemoryStore::with_sensors([SensorDescriptor {
            id: "s1".to_string(),
            owner: Ownership {
                store_id: Uuid::nil(),
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
        }]));
        let evaluator = AlertEvaluator::new(store.clone());
        let thresholds = AlertThresholds::new(limits());

        store.upsert_rollup(&hourly(at(9, 0), 150, 0, 0)).await.unwrap();
        let first = evaluator.evaluate(&thresholds, at(10, 5)).await.unwrap();
        assert_eq!(first.triggered, 1);
        assert_eq!(first.unchanged, 0);

        let second = evaluator.evaluate(&thresholds, at(10, 10)).await.unwrap();
        assert_eq!(second.triggered, 0);
        assert_eq!(second.unchanged, 1);

        store.upsert_rollup(&hourly(at(10, 0), 0, 100, 0)).await.unwrap();
        let third = evaluator.evaluate(&thresholds, at(10, 30)).await.unwrap();
        assert_eq!(third.resolved, 1);
        assert_eq!(third.triggered, 0);

        let alerts = store.alerts().await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].category, AlertCategory::Capacity);
        assert_eq!(alerts[0].severity, Severity::Critical);
        assert_eq!(alerts[0].resolved_at, Some(at(10, 30)));
    }

    #[test]
    fn store_overrides_fall_back_per_field() {
        let store = Uuid::new_v4();
        let mut thresholds = AlertThresholds::new(limits());
        thresholds.per_store.insert(
            store,
            StoreThresholds {
                capacity: Some(40),
                ..StoreThresholds::default()
            },
        );
        let resolved = thresholds.for_store(store);
        assert_eq!(resolved.capacity, 40);
        assert_eq!(resolved.max_queue_length, 5);
        assert_eq!(thresholds.for_store(Uuid::new_v4()), limits());
    }
}
