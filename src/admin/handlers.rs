use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;

use crate::admin::AdminState;
use crate::health::HealthStatus;
use crate::resilience::circuit_breaker::BreakerSnapshot;

#[derive(Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: &'static str,
    pub live: bool,
    pub ready: bool,
    pub dependencies: Vec<String>,
    pub detached_in_flight: usize,
}

#[derive(Serialize)]
pub struct Liveness {
    pub live: bool,
}

fn probe_status(ok: bool) -> StatusCode {
    if ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

pub async fn get_live(State(state): State<AdminState>) -> (StatusCode, Json<Liveness>) {
    let live = state.pipeline.health().is_live();
    (probe_status(live), Json(Liveness { live }))
}

pub async fn get_ready(State(state): State<AdminState>) -> (StatusCode, Json<HealthStatus>) {
    let health = state.pipeline.get_health();
    (probe_status(health.live && health.ready), Json(health))
}

pub async fn get_status(State(state): State<AdminState>) -> Json<SystemStatus> {
    let health = state.pipeline.get_health();
    let status = match (health.live, health.ready) {
        (false, _) => "failed",
        (true, false) => "degraded",
        (true, true) => "operational",
    };
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status,
        live: health.live,
        ready: health.ready,
        dependencies: state.pipeline.keys(),
        detached_in_flight: state.pipeline.detached_in_flight(),
    })
}

pub async fn get_breakers(State(state): State<AdminState>) -> Json<Vec<BreakerSnapshot>> {
    Json(state.pipeline.breaker_snapshots())
}

pub async fn reset_breaker(
    State(state): State<AdminState>,
    Path(key): Path<String>,
) -> Result<Json<BreakerSnapshot>, StatusCode> {
    let breaker = state.pipeline.breaker(&key).ok_or(StatusCode::NOT_FOUND)?;
    breaker.reset();
    tracing::info!(key = %key, "Circuit breaker reset through admin API");
    Ok(Json(breaker.snapshot()))
}
