use std::sync::Arc;

use axum::{
    Json,
    extract::{Query, State as AxumState, rejection::QueryRejection},
    http::HeaderMap,
};
use serde::Deserialize;
use tracing::{error, warn};

use crate::{error::AppError, flush::FlushReport, state::State};

#[derive(Deserialize, Default)]
pub struct TokenQuery {
    token: Option<String>,
}

pub async fn flush_handler(
    AxumState(state): AxumState<Arc<State>>,
    headers: HeaderMap,
    query: Result<Query<TokenQuery>, QueryRejection>,
) -> Result<Json<FlushReport>, AppError> {
    // an undecodable query string just means no query token
    let query_token = query.ok().and_then(|Query(query)| query.token);

    if !state.guard.is_authorized(&headers, query_token.as_deref()) {
        warn!("Rejected unauthorized flush");
        return Err(AppError::Unauthorized);
    }

    let report = state.flusher.flush().await.map_err(|e| {
        error!(error = %e, "Flush cycle failed");
        e
    })?;

    Ok(Json(report))
}

pub async fn health_handler() -> &'static str {
    "ok"
}
