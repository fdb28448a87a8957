pub mod auth;
pub mod bulk;
pub mod health;
pub mod jobs;

use axum::Router;

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(health::router())
        .nest("/api", Router::new().merge(jobs::router()).merge(bulk::router()))
        .with_state(state)
}
