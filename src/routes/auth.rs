use axum::extract::{FromRef, FromRequestParts};
use axum::http::request::Parts;
use std::future::Future;
use subtle::ConstantTimeEq;

use crate::error::AppError;
use crate::state::TriggerSecret;

pub const SECRET_HEADER: &str = "x-pipeline-secret";

/// Marker extractor: the request carried the configured trigger secret.
#[derive(Debug, Clone, Copy)]
pub struct TriggerAuth;

impl<S> FromRequestParts<S> for TriggerAuth
where
    TriggerSecret: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AppError;

    fn from_request_parts(
        parts: &mut Parts,
        state: &S,
    ) -> impl Future<Output = Result<Self, Self::Rejection>> + Send {
        let expected = TriggerSecret::from_ref(state);
        let result = parts
            .headers
            .get(SECRET_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| AppError::unauthorized("Missing pipeline secret"))
            .and_then(|provided| {
                if secrets_match(provided, &expected.0) {
                    Ok(TriggerAuth)
                } else {
                    Err(AppError::unauthorized("Invalid pipeline secret"))
                }
            });
        async move { result }
    }
}

fn secrets_match(provided: &str, expected: &str) -> bool {
    if expected.is_empty() {
        return false;
    }
    provided.as_bytes().ct_eq(expected.as_bytes()).into()
}
