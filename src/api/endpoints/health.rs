//! Health check endpoint.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::api::types::ApiContext;
use crate::engine::{PRIMARY_ENGINE, RADIOGRAPH_ENGINE};

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub biomedclip_cargado: bool,
    pub biovil_cargado: bool,
    pub uptime_secs: u64,
    pub analisis_realizados: u64,
}

/// `GET /api/health`: liveness plus engine residency.
pub async fn check(State(ctx): State<ApiContext>) -> Json<HealthResponse> {
    let registry = ctx.core.registry();
    Json(HealthResponse {
        status: "healthy",
        version: crate::config::APP_VERSION,
        biomedclip_cargado: registry.is_loaded(PRIMARY_ENGINE),
        biovil_cargado: registry.is_loaded(RADIOGRAPH_ENGINE),
        uptime_secs: ctx.core.uptime_secs(),
        analisis_realizados: ctx.core.analyses_served(),
    })
}
