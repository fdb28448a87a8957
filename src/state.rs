use crate::pipeline::Pipeline;
use axum::extract::FromRef;
use std::sync::Arc;

/// Shared secret expected in the `x-pipeline-secret` header.
#[derive(Clone)]
pub struct TriggerSecret(pub Arc<str>);

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub trigger_secret: TriggerSecret,
}

impl AppState {
    pub fn new(pipeline: Arc<Pipeline>, trigger_secret: impl Into<Arc<str>>) -> Self {
        Self {
            pipeline,
            trigger_secret: TriggerSecret(trigger_secret.into()),
        }
    }
}

impl FromRef<AppState> for Arc<Pipeline> {
    fn from_ref(state: &AppState) -> Arc<Pipeline> {
        state.pipeline.clone()
    }
}

impl FromRef<AppState> for TriggerSecret {
    fn from_ref(state: &AppState) -> TriggerSecret {
        state.trigger_secret.clone()
    }
}
