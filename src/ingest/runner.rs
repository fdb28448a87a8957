use super::fetcher::{ReportSource, ReportWindow};
use super::filter::partition;
use super::normalize::parse_report;
use super::report::{RunReport, SensorOutcome, SensorStatus};
use crate::error::{FetchError, PipelineError};
use crate::model::{InsertOutcome, SensorDescriptor};
use crate::store::TrafficStore;
use crate::time::SensorZone;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

/// How long in-flight units get to wind down after the deadline fires.
const CANCEL_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy)]
pub struct IngestSettings {
    pub lookback: ChronoDuration,
    /// Records starting further back than this are dropped as too old.
    pub retention: ChronoDuration,
    pub run_deadline: Duration,
    pub max_concurrency: usize,
    pub default_zone: SensorZone,
}

impl IngestSettings {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.max_concurrency == 0 {
            return Err(PipelineError::Config(
                "sensor concurrency must be at least 1".to_string(),
            ));
        }
        if self.run_deadline.is_zero() {
            return Err(PipelineError::Config("run deadline must be positive".to_string()));
        }
        if self.lookback <= ChronoDuration::zero() || self.retention <= ChronoDuration::zero() {
            return Err(PipelineError::Config(
                "lookback and retention must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            lookback: ChronoDuration::minutes(120),
            retention: ChronoDuration::minutes(120),
            run_deadline: Duration::from_secs(60),
            max_concurrency: 8,
            default_zone: SensorZone::default(),
        }
    }
}

#[derive(Clone)]
pub struct IngestionRunner {
    store: Arc<dyn TrafficStore>,
    source: Arc<dyn ReportSource>,
    settings: IngestSettings,
    run_lock: Arc<Mutex<()>>,
}

impl IngestionRunner {
    pub fn new(
        store: Arc<dyn TrafficStore>,
        source: Arc<dyn ReportSource>,
        settings: IngestSettings,
    ) -> Self {
        Self {
            store,
            source,
            settings,
            run_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Polls every active sensor once. Per-sensor failures land in the
    /// report; only unusable settings or a failure to list sensors fail the
    /// run.
    pub async fn run(&self, now: DateTime<Utc>) -> Result<RunReport, PipelineError> {
        self.settings.validate()?;
        let run_id = Uuid::new_v4();
        let window = ReportWindow::ending_at(now, self.settings.lookback);

        let Ok(_guard) = self.run_lock.clone().try_lock_owned() else {
            tracing::info!(%run_id, "ingestion run already in progress; skipping");
            return Ok(RunReport::locked(run_id, now, (window.start, window.end)));
        };
        if !self.store.try_acquire_run_lock().await? {
            tracing::info!(%run_id, "ingestion run held by another process; skipping");
            return Ok(RunReport::locked(run_id, now, (window.start, window.end)));
        }

        let result = self.run_locked(run_id, now, window).await;
        if let Err(err) = self.store.release_run_lock().await {
            tracing::warn!(%run_id, error = %err, "failed to release run lock");
        }
        result
    }

    async fn run_locked(
        &self,
        run_id: Uuid,
        now: DateTime<Utc>,
        window: ReportWindow,
    ) -> Result<RunReport, PipelineError> {
        let started_at = Utc::now();
        let sensors = self.store.active_sensors().await?;
        let sensor_ids: Vec<String> = sensors.iter().map(|sensor| sensor.id.clone()).collect();
        tracing::info!(
            %run_id,
            sensors = sensors.len(),
            window_start = %window.start,
            window_end = %window.end,
            "ingestion run started"
        );

        let cancel = CancellationToken::new();
        let semaphore = Arc::new(Semaphore::new(self.settings.max_concurrency));
        let mut tasks = JoinSet::new();
        for sensor in sensors {
            let unit = SensorUnit {
                store: self.store.clone(),
                source: self.source.clone(),
                settings: self.settings,
                window,
                now,
                cancel: cancel.clone(),
            };
            let semaphore = semaphore.clone();
            let span = tracing::info_span!("sensor_ingest", %run_id, sensor = %sensor.id);
            tasks.spawn(
                async move {
                    let _permit = tokio::select! {
                        permit = semaphore.acquire_owned() => match permit {
                            Ok(permit) => permit,
                            Err(_) => return not_attempted(&sensor.id),
                        },
                        _ = unit.cancel.cancelled() => return not_attempted(&sensor.id),
                    };
                    if unit.cancel.is_cancelled() {
                        return not_attempted(&sensor.id);
                    }
                    unit.ingest(&sensor).await
                }
                .instrument(span),
            );
        }

        let mut outcomes: HashMap<String, SensorOutcome> = HashMap::with_capacity(sensor_ids.len());
        let deadline = tokio::time::sleep(self.settings.run_deadline);
        tokio::pin!(deadline);
        let grace = tokio::time::sleep(self.settings.run_deadline + CANCEL_GRACE);
        tokio::pin!(grace);
        let mut aborted = false;
        loop {
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    None => break,
                    Some(Ok(outcome)) => {
                        tracing::debug!(
                            %run_id,
                            sensor = %outcome.sensor_id,
                            status = outcome.status.as_str(),
                            "sensor finished"
                        );
                        outcomes.insert(outcome.sensor_id.clone(), outcome);
                    }
                    Some(Err(err)) if err.is_cancelled() => {}
                    Some(Err(err)) => {
                        tracing::error!(%run_id, error = %err, "sensor worker panicked");
                    }
                },
                _ = &mut deadline, if !cancel.is_cancelled() => {
                    tracing::warn!(
                        %run_id,
                        deadline_secs = self.settings.run_deadline.as_secs(),
                        pending = tasks.len(),
                        "run deadline reached; cancelling in-flight sensors"
                    );
                    cancel.cancel();
                }
                _ = &mut grace, if !aborted => {
                    tracing::warn!(%run_id, pending = tasks.len(), "aborting sensors that ignored cancellation");
                    tasks.abort_all();
                    aborted = true;
                }
            }
        }

        let deadline_hit = cancel.is_cancelled();
        let sensors: Vec<SensorOutcome> = sensor_ids
            .into_iter()
            .map(|sensor_id| match outcomes.remove(&sensor_id) {
                Some(outcome) => outcome,
                None if deadline_hit => not_attempted(&sensor_id),
                None => SensorOutcome::new(sensor_id, SensorStatus::TransientError)
                    .with_detail("sensor worker failed"),
            })
            .collect();

        let report = RunReport::from_outcomes(
            run_id,
            started_at,
            Utc::now(),
            (window.start, window.end),
            sensors,
        );
        tracing::info!(
            %run_id,
            attempted = report.attempted,
            succeeded = report.succeeded,
            failed = report.failed,
            not_attempted = report.not_attempted,
            inserted = report.totals.inserted,
            skipped = report.totals.skipped(),
            invalid_rows = report.parse.skipped(),
            "ingestion run finished"
        );
        Ok(report)
    }
}

fn not_attempted(sensor_id: &str) -> SensorOutcome {
    SensorOutcome::new(sensor_id, SensorStatus::NotAttempted).with_detail("run deadline reached")
}

/// Everything one sensor's unit of work needs, detached from the runner.
struct SensorUnit {
    store: Arc<dyn TrafficStore>,
    source: Arc<dyn ReportSource>,
    settings: IngestSettings,
    window: ReportWindow,
    now: DateTime<Utc>,
    cancel: CancellationToken,
}

impl SensorUnit {
    async fn ingest(&self, sensor: &SensorDescriptor) -> SensorOutcome {
        if sensor.address.host.trim().is_empty() {
            tracing::warn!("sensor has no host configured");
            return SensorOutcome::new(&sensor.id, SensorStatus::Misconfigured)
                .with_detail("missing host");
        }
        if sensor.credentials.is_none() {
            tracing::warn!("sensor has no credentials configured");
            return SensorOutcome::new(&sensor.id, SensorStatus::Misconfigured)
                .with_detail("missing credentials");
        }

        let zone = SensorZone::resolve(sensor.timezone.as_deref(), self.settings.default_zone);
        let fetched = tokio::select! {
            result = self.source.fetch_report(sensor, &zone, &self.window) => result,
            _ = self.cancel.cancelled() => return not_attempted(&sensor.id),
        };
        let body = match fetched {
            Ok(body) => body,
            Err(FetchError::Misconfigured(detail)) => {
                tracing::warn!(detail = %detail, "sensor misconfigured");
                return SensorOutcome::new(&sensor.id, SensorStatus::Misconfigured)
                    .with_detail(detail);
            }
            Err(err) => {
                tracing::warn!(error = %err, "sensor fetch failed");
                return SensorOutcome::new(&sensor.id, SensorStatus::TransientError)
                    .with_detail(err.to_string());
            }
        };

        let mut outcome = SensorOutcome::new(&sensor.id, SensorStatus::Succeeded);
        if let Err(err) = self.store.mark_sensor_seen(&sensor.id, Utc::now()).await {
            tracing::warn!(error = %err, "failed to update sensor last_seen");
            outcome.last_seen_failed = true;
            outcome.detail = Some(format!("last_seen not updated: {err}"));
        }

        let parsed = parse_report(&body, &sensor.id, &zone);
        outcome.parse = parsed.stats;

        let last_persisted = match self.store.latest_interval_start(&sensor.id).await {
            Ok(last) => last,
            Err(err) => {
                tracing::warn!(error = %err, "failed to read latest persisted interval");
                outcome.status = SensorStatus::PersistenceFailed;
                outcome.detail = Some(err.to_string());
                return outcome;
            }
        };

        let (accepted, counts) = partition(
            parsed.records,
            self.now,
            last_persisted,
            self.settings.retention,
        );
        outcome.counts = counts;

        for record in &accepted {
            if self.cancel.is_cancelled() {
                // Rows already written stay; the rest are picked up next run.
                outcome.status = SensorStatus::NotAttempted;
                outcome.detail = Some("run deadline reached during persistence".to_string());
                return outcome;
            }
            match self.store.insert_line_crossing(&sensor.owner, record).await {
                Ok(InsertOutcome::Inserted) => outcome.counts.inserted += 1,
                Ok(InsertOutcome::Duplicate) => outcome.counts.skipped_duplicate += 1,
                Err(err) => {
                    tracing::warn!(
                        interval_start = %record.interval_start,
                        error = %err,
                        "failed to persist line-crossing record"
                    );
                    outcome.status = SensorStatus::PersistenceFailed;
                    outcome.detail = Some(err.to_string());
                    return outcome;
                }
            }
        }

        if outcome.parse.all_rows_invalid() {
            tracing::warn!(rows = outcome.parse.rows, "every report row was invalid");
            outcome.status = SensorStatus::Malformed;
            outcome.detail = Some("no valid rows in report".to_string());
        }
        tracing::debug!(
            inserted = outcome.counts.inserted,
            skipped = outcome.counts.skipped(),
            "sensor ingested"
        );
        outcome
    }
}
