use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use std::sync::Arc;

use super::auth::TriggerAuth;
use crate::error::{AppError, AppResult};
use crate::ingest::{BulkError, BulkIngestReport, BulkIngestRequest};
use crate::pipeline::Pipeline;
use crate::state::AppState;

pub(crate) async fn ingest_bulk(
    State(pipeline): State<Arc<Pipeline>>,
    _auth: TriggerAuth,
    Json(request): Json<BulkIngestRequest>,
) -> AppResult<Json<BulkIngestReport>> {
    match pipeline.ingest_bulk(request).await {
        Ok(report) => Ok(Json(report)),
        Err(BulkError::UnknownSensor(sensor_id)) => {
            Err(AppError::not_found(format!("Unknown sensor {sensor_id}")))
        }
        Err(BulkError::Store(err)) => Err(err.into()),
    }
}

pub fn router() -> Router<AppState> {
    Router::new().route("/ingest/bulk", post(ingest_bulk))
}
