//! One pass of the pipeline: ingest, then (optionally) rollup and alert
//! evaluation. Shared by the HTTP trigger, the in-process schedule and the
//! one-shot CLI commands.

use crate::alerts::{AlertEvaluator, AlertReport, AlertThresholds, ThresholdDefaults};
use crate::error::{PipelineError, StoreError};
use crate::ingest::{BulkError, BulkIngestReport, BulkIngestRequest, BulkIngestor, IngestionRunner, RunReport};
use crate::rollup::{RollupAggregator, RollupReport};
use crate::store::TrafficStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    /// Run rollup and alert evaluation after every unlocked ingestion pass.
    pub chain_rollup: bool,
    pub thresholds: ThresholdDefaults,
}

/// Result of one pass. Stages that did not run stay `None`; a stage that failed
/// after an earlier one succeeded is listed in `errors` so the earlier report
/// still reaches the caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PassReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ingest: Option<RunReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollup: Option<RollupReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alerts: Option<AlertReport>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

pub struct Pipeline {
    store: Arc<dyn TrafficStore>,
    ingest: IngestionRunner,
    rollup: RollupAggregator,
    alerts: AlertEvaluator,
    bulk: BulkIngestor,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn TrafficStore>,
        ingest: IngestionRunner,
        rollup: RollupAggregator,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            alerts: AlertEvaluator::new(store.clone()),
            bulk: BulkIngestor::new(store.clone()),
            store,
            ingest,
            rollup,
            settings,
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// `chain` overrides the configured chaining for this pass only.
    pub async fn run_ingest(&self, chain: Option<bool>) -> Result<PassReport, PipelineError> {
        self.run_ingest_at(Utc::now(), chain).await
    }

    pub async fn run_ingest_at(
        &self,
        now: DateTime<Utc>,
        chain: Option<bool>,
    ) -> Result<PassReport, PipelineError> {
        let ingest = self.ingest.run(now).await?;
        let chain = chain.unwrap_or(self.settings.chain_rollup) && !ingest.skipped_locked;
        let mut pass = PassReport {
            ingest: Some(ingest),
            ..PassReport::default()
        };
        if chain {
            self.rollup_stage(now, &mut pass).await;
        }
        Ok(pass)
    }

    pub async fn run_rollup(&self) -> Result<PassReport, PipelineError> {
        self.run_rollup_at(Utc::now()).await
    }

    /// Rollup failure fails the pass; alert failure after a good rollup does not.
    pub async fn run_rollup_at(&self, now: DateTime<Utc>) -> Result<PassReport, PipelineError> {
        let rollup = self.rollup.run(now).await?;
        let mut pass = PassReport {
            rollup: Some(rollup),
            ..PassReport::default()
        };
        match self.evaluate_alerts_at(now).await {
            Ok(alerts) => pass.alerts = Some(alerts),
            Err(err) => pass.errors.push(format!("alert evaluation: {err}")),
        }
        Ok(pass)
    }

    pub async fn evaluate_alerts(&self) -> Result<AlertReport, PipelineError> {
        self.evaluate_alerts_at(Utc::now()).await
    }

    pub async fn evaluate_alerts_at(&self, now: DateTime<Utc>) -> Result<AlertReport, PipelineError> {
        let thresholds = self.load_thresholds().await?;
        Ok(self.alerts.evaluate(&thresholds, now).await?)
    }

    pub async fn ingest_bulk(
        &self,
        request: BulkIngestRequest,
    ) -> Result<BulkIngestReport, BulkError> {
        self.bulk.ingest(request).await
    }

    /// Configured defaults merged with per-store overrides, read fresh each pass.
    pub async fn load_thresholds(&self) -> Result<AlertThresholds, StoreError> {
        let mut thresholds = AlertThresholds::new(self.settings.thresholds);
        thresholds.per_store = self.store.threshold_overrides().await?;
        Ok(thresholds)
    }

    async fn rollup_stage(&self, now: DateTime<Utc>, pass: &mut PassReport) {
        match self.rollup.run(now).await {
            Ok(rollup) => pass.rollup = Some(rollup),
            Err(err) => {
                tracing::warn!(error = %err, "chained rollup failed");
                pass.errors.push(format!("rollup: {err}"));
                return;
            }
        }
        match self.evaluate_alerts_at(now).await {
            Ok(alerts) => pass.alerts = Some(alerts),
            Err(err) => {
                tracing::warn!(error = %err, "chained alert evaluation failed");
                pass.errors.push(format!("alert evaluation: {err}"));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::{AlertCategory, StoreThresholds};
    use crate::error::FetchError;
    use crate::ingest::{IngestSettings, ReportSource, ReportWindow};
    use crate::model::{Ownership, SensorAddress, SensorCredentials, SensorDescriptor};
    use crate::rollup::{Granularity, RollupSettings};
    use crate::store::MemoryStore;
    use crate::time::SensorZone;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use uuid::Uuid;

    const REPORT: &str = "\
StartTime,EndTime,c2,c3,c4,L1In,L1Out,c7,L2In,L2Out,c10,L3In,L3Out,c13,L4In,L4Out,c16
2024/01/15 11:00:00,2024/01/15 11:15:00,x,x,x,5,2,x,0,0,x,0,0,x,20,10,x
2024/01/15 11:15:00,2024/01/15 11:30:00,x,x,x,3,1,x,0,0,x,0,0,x,8,8,x";

    struct StaticSource;

    #[async_trait]
    impl ReportSource for StaticSource {
        async fn fetch_report(
            &self,
            _sensor: &SensorDescriptor,
            _zone: &SensorZone,
            _window: &ReportWindow,
        ) -> Result<String, FetchError> {
            Ok(REPORT.to_string())
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap()
    }

    fn store_id() -> Uuid {
        Uuid::from_u128(7)
    }

    fn sensor() -> SensorDescriptor {
        SensorDescriptor {
            id: "door-1".to_string(),
            owner: Ownership {
                store_id: store_id(),
                organization_id: Uuid::from_u128(1),
            },
            address: SensorAddress {
                host: "10.0.0.5".to_string(),
                port: 80,
                path_template: None,
            },
            credentials: Some(SensorCredentials {
                username: "admin".to_string(),
                password: "admin".to_string(),
            }),
            active: true,
            timezone: None,
            last_seen: None,
        }
    }

    fn pipeline(store: Arc<MemoryStore>, chain_rollup: bool) -> Pipeline {
        let ingest = IngestionRunner::new(store.clone(), Arc::new(StaticSource), IngestSettings::default());
        let rollup = RollupAggregator::new(store.clone(), RollupSettings::default());
        Pipeline::new(
            store,
            ingest,
            rollup,
            PipelineSettings {
                chain_rollup,
                thresholds: ThresholdDefaults {
                    capacity: 3,
                    min_capture_rate: 0.05,
                    max_queue_length: 8,
                },
            },
        )
    }

    #[tokio::test]
    async fn chained_pass_rolls_up_and_alerts() {
        let store = Arc::new(MemoryStore::with_sensors([sensor()]));
        let pass = pipeline(store.clone(), true)
            .run_ingest_at(now(), None)
            .await
            .unwrap();

        assert_eq!(pass.ingest.as_ref().unwrap().totals.inserted, 2);
        let rollup = pass.rollup.unwrap();
        assert_eq!(rollup.hourly, 1);
        assert_eq!(rollup.daily, 1);
        let hour = Utc.with_ymd_and_hms(2024, 1, 15, 11, 0, 0).unwrap();
        let stored = store.rollup(Granularity::Hour, "door-1", hour).await.unwrap();
        assert_eq!(stored.metrics.net_flow, 5);

        let alerts = pass.alerts.unwrap();
        assert_eq!(alerts.triggered, 1);
        assert_eq!(alerts.unchanged, 1);
        let open = store.alerts().await;
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].category, AlertCategory::Capacity);
        assert!(pass.errors.is_empty());
    }

    #[tokio::test]
    async fn chaining_can_be_disabled_per_pass() {
        let store = Arc::new(MemoryStore::with_sensors([sensor()]));
        let pass = pipeline(store.clone(), true)
            .run_ingest_at(now(), Some(false))
            .await
            .unwrap();
        assert!(pass.ingest.is_some());
        assert!(pass.rollup.is_none());
        assert!(pass.alerts.is_none());
    }

    #[tokio::test]
    async fn locked_run_does_not_chain() {
        let store = Arc::new(MemoryStore::with_sensors([sensor()]));
        assert!(store.try_acquire_run_lock().await.unwrap());
        let pass = pipeline(store.clone(), true)
            .run_ingest_at(now(), None)
            .await
            .unwrap();
        assert!(pass.ingest.unwrap().skipped_locked);
        assert!(pass.rollup.is_none());
    }

    #[tokio::test]
    async fn rollup_failure_keeps_ingest_report() {
        let store = Arc::new(MemoryStore::with_sensors([sensor()]));
        store.fail_rollup_writes(true).await;
        let pass = pipeline(store.clone(), true)
            .run_ingest_at(now(), None)
            .await
            .unwrap();
        assert_eq!(pass.ingest.unwrap().totals.inserted, 2);
        // Failed buckets are counted, not fatal, so alerts still run.
        assert_eq!(pass.rollup.unwrap().buckets_failed, 2);
        assert!(pass.alerts.is_some());
    }

    #[tokio::test]
    async fn store_override_disables_capacity_alert() {
        let store = Arc::new(MemoryStore::with_sensors([sensor()]));
        store
            .set_threshold_override(
                store_id(),
                StoreThresholds {
                    capacity: Some(0),
                    ..StoreThresholds::default()
                },
            )
            .await;
        let pipeline = pipeline(store.clone(), false);
        pipeline.run_ingest_at(now(), None).await.unwrap();

        let pass = pipeline.run_rollup_at(now()).await.unwrap();
        let alerts = pass.alerts.unwrap();
        assert_eq!(alerts.triggered, 0);
        assert!(store.alerts().await.is_empty());
    }

    #[test]
    fn empty_stages_are_omitted_from_json() {
        let json = serde_json::to_value(PassReport::default()).unwrap();
        assert_eq!(json, serde_json::json!({}));
    }
}
