use axum::body::Bytes;
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use std::sync::Arc;

use super::auth::TriggerAuth;
use crate::error::{AppError, AppResult};
use crate::pipeline::{PassReport, Pipeline};
use crate::state::AppState;

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct IngestJobRequest {
    #[serde(default)]
    chain_rollup: Option<bool>,
}

/// The body is optional; an empty one runs with the configured chaining.
fn parse_ingest_request(body: &[u8]) -> AppResult<IngestJobRequest> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(IngestJobRequest::default());
    }
    serde_json::from_slice(body).map_err(|err| {
        AppError::new(
            axum::http::StatusCode::BAD_REQUEST,
            format!("Invalid request body: {err}"),
        )
    })
}

pub(crate) async fn trigger_ingest(
    State(pipeline): State<Arc<Pipeline>>,
    _auth: TriggerAuth,
    body: Bytes,
) -> AppResult<Json<PassReport>> {
    let request = parse_ingest_request(&body)?;
    let pass = pipeline.run_ingest(request.chain_rollup).await?;
    Ok(Json(pass))
}

pub(crate) async fn trigger_rollup(
    State(pipeline): State<Arc<Pipeline>>,
    _auth: TriggerAuth,
) -> AppResult<Json<PassReport>> {
    let pass = pipeline.run_rollup().await?;
    Ok(Json(pass))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/jobs/ingest", post(trigger_ingest))
        .route("/jobs/rollup", post(trigger_rollup))
}

#[cfg(test)]
mod tests {
    use super::parse_ingest_request;

    #[test]
    fn empty_body_uses_configured_chaining() {
        assert_eq!(parse_ingest_request(b"").unwrap().chain_rollup, None);
        assert_eq!(parse_ingest_request(b" \n").unwrap().chain_rollup, None);
        assert_eq!(
            parse_ingest_request(br#"{"chain_rollup":false}"#)
                .unwrap()
                .chain_rollup,
            Some(false)
        );
        assert!(parse_ingest_request(b"{nope").is_err());
    }
}
