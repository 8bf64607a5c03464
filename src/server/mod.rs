//! The HTTP surface the core exposes to the outer server layer.
//!
//! `/health` answers as soon as the process is up; `/ready` flips with the
//! live-view cutover; `/status` reports per-chain sync progress; `/metrics`
//! is Prometheus text exposition.

pub mod error;

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::state::{AppState, ChainStatus};

pub use error::ApiError;

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/status", get(status))
        .route("/metrics", get(metrics))
        .with_state(state)
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn ready(State(state): State<Arc<AppState>>) -> Result<StatusCode, ApiError> {
    if state.is_ready() {
        Ok(StatusCode::OK)
    } else {
        Err(ApiError::NotReady)
    }
}

#[derive(Serialize)]
struct StatusResponse {
    chains: BTreeMap<u64, ChainStatus>,
}

async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        chains: state.statuses().into_iter().collect(),
    })
}

async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    let body = state.metrics.encode();
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        body,
    )
        .into_response()
}
