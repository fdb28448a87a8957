use crate::pipeline::Pipeline;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Runs the same pass as the HTTP trigger on a fixed interval.
pub struct ScheduleService {
    pipeline: Arc<Pipeline>,
    interval: Duration,
}

impl ScheduleService {
    pub fn new(pipeline: Arc<Pipeline>, interval: Duration) -> Self {
        Self { pipeline, interval }
    }

    pub fn start(self, cancel: CancellationToken) {
        let pipeline = self.pipeline.clone();
        let interval = self.interval;
        tokio::spawn(async move {
            tracing::info!(interval_secs = interval.as_secs(), "ingestion schedule started");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        match pipeline.run_ingest(None).await {
                            Ok(pass) => {
                                for error in &pass.errors {
                                    tracing::warn!(error = %error, "scheduled pass stage failed");
                                }
                            }
                            Err(err) => tracing::warn!("scheduled ingestion pass failed: {err:#}"),
                        }
                    }
                }
            }
            tracing::info!("ingestion schedule stopped");
        });
    }
}
