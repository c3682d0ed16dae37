//! Health and admin HTTP surface.
//!
//! # Routes
//! - `GET /health/live`: 200 while live, 503 after a fatal error
//! - `GET /health/ready`: 200 while every critical breaker is Closed, else 503
//! - `GET /admin/status`: version, health, detached operation count
//! - `GET /admin/breakers`: breaker snapshots
//! - `POST /admin/breakers/{key}/reset`: force a breaker Closed
//!
//! # Design Decisions
//! - Health routes are never behind auth; orchestrator probes must reach them
//! - `/admin/*` requires a bearer token when one is configured

pub mod auth;
pub mod handlers;

use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::config::schema::AdminConfig;
use crate::pipeline::Pipeline;

use self::auth::admin_auth_middleware;
use self::handlers::*;

/// Shared state for admin handlers.
#[derive(Debug, Clone)]
pub struct AdminState {
    pub pipeline: Pipeline,
    pub api_key: Option<Arc<str>>,
}

pub fn setup_admin_router(pipeline: Pipeline, config: &AdminConfig) -> Router {
    let state = AdminState {
        pipeline,
        api_key: config.api_key.as_deref().map(Arc::from),
    };

    let admin = Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/breakers", get(get_breakers))
        .route("/admin/breakers/{key}/reset", post(reset_breaker))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            admin_auth_middleware,
        ));

    Router::new()
        .route("/health/live", get(get_live))
        .route("/health/ready", get(get_ready))
        .merge(admin)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
