use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

use crate::error::{Error, ErrorDetails};
use crate::gateway_util::AppState;

pub const GENGUARD_VERSION: &str = env!("CARGO_PKG_VERSION");

/// A handler for a simple liveness check
pub async fn health_handler() -> Json<Value> {
    Json(json!({"status": "ok", "version": GENGUARD_VERSION}))
}

/// Prometheus scrape endpoint
pub async fn metrics_handler(State(app_state): AppState) -> Result<Response, Error> {
    let Some(handle) = &app_state.metrics_handle else {
        return Err(Error::new(ErrorDetails::InternalError {
            message: "Metrics recorder is not installed".to_string(),
        }));
    };
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        handle.render(),
    )
        .into_response())
}
