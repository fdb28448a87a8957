use axum::routing::get;
use axum::Router;

use crate::state::AppState;

pub(crate) async fn healthz_handler() -> &'static str {
    "ok"
}

pub fn router() -> Router<AppState> {
    Router::new().route("/healthz", get(healthz_handler))
}
