use crate::error::StoreError;
use crate::storage::engine::StorageEngine;
use crate::storage::stats::EngineStatus;
use crate::uplink::{UplinkCounters, UplinkStats};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Clone)]
pub struct HttpState {
    pub engine: Arc<StorageEngine>,
    pub uplink_stats: Arc<UplinkStats>,
}

#[derive(Debug, Deserialize)]
struct IncomingSample {
    sensor_id: u32,
    timestamp_ms: u64,
    value: u32,
    #[serde(default)]
    event_kind: u8,
}

#[derive(Debug, Deserialize)]
struct SamplesRequest {
    samples: Vec<IncomingSample>,
}

#[derive(Debug, Serialize)]
struct SamplesResponse {
    accepted: u64,
    dropped: u64,
    unknown_sensor: u64,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    engine: EngineStatus,
    uplink: UplinkCounters,
}

async fn healthz() -> &'static str {
    "ok"
}

async fn get_status(State(state): State<HttpState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        engine: state.engine.status(),
        uplink: state.uplink_stats.snapshot(),
    })
}

async fn post_samples(
    State(state): State<HttpState>,
    Json(payload): Json<SamplesRequest>,
) -> Result<Json<SamplesResponse>, (StatusCode, String)> {
    let mut response = SamplesResponse {
        accepted: 0,
        dropped: 0,
        unknown_sensor: 0,
    };
    for sample in payload.samples {
        match state.engine.append(
            sample.sensor_id,
            sample.timestamp_ms,
            sample.value,
            sample.event_kind,
        ) {
            Ok(()) => response.accepted += 1,
            Err(StoreError::UnknownSensor(_)) => response.unknown_sensor += 1,
            Err(StoreError::Dropped { .. }) => response.dropped += 1,
            Err(err) => {
                return Err((StatusCode::SERVICE_UNAVAILABLE, err.to_string()));
            }
        }
    }
    Ok(Json(response))
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/status", get(get_status))
        .route("/v1/samples", post(post_samples))
        .with_state(state)
}
