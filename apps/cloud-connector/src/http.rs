use crate::error::ConnectorError;
use crate::reading::Reading;
use crate::runner::{Runner, RunnerState, StatsSnapshot};
use crate::sender::DataSender;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Clone)]
pub struct HttpState {
    pub sender: Arc<DataSender>,
    pub runner: Arc<Runner>,
}

#[derive(Debug, Deserialize)]
struct SensorPush {
    device_name: String,
    data: Reading,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    state: RunnerState,
    sinks: Vec<String>,
    stats: StatsSnapshot,
}

async fn healthz() -> &'static str {
    "ok"
}

async fn get_status(State(state): State<HttpState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        state: state.runner.state().await,
        sinks: state.sender.sink_names().into_iter().map(str::to_string).collect(),
        stats: state.runner.stats().snapshot(),
    })
}

/// Pushed readings take the same path as polled ones.
async fn post_sensor_data(
    State(state): State<HttpState>,
    body: Bytes,
) -> Result<StatusCode, (StatusCode, String)> {
    let push: SensorPush = serde_json::from_slice(&body)
        .map_err(|err| (StatusCode::BAD_REQUEST, err.to_string()))?;
    let device_name = push.device_name.trim();
    if device_name.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "device_name is empty".to_string()));
    }
    if push.data.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "data has no measurements".to_string()));
    }

    tracing::debug!(device = device_name, measurements = push.data.len(), "sensor data pushed");
    match state.sender.send(push.data, device_name).await {
        Ok(_) => Ok(StatusCode::NO_CONTENT),
        Err(err @ (ConnectorError::Store(_) | ConnectorError::ConnectionTimeout(_))) => {
            tracing::error!(device = device_name, error = %err, "pushed reading not stored");
            Err((StatusCode::SERVICE_UNAVAILABLE, err.to_string()))
        }
        Err(err) => {
            tracing::error!(device = device_name, error = %err, "pushed reading failed");
            Err((StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))
        }
    }
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/status", get(get_status))
        .route("/sensor/data", post(post_sensor_data))
        .with_state(state)
}
