//! Engine lifecycle endpoints: status, load, release.

use axum::extract::{Query, State};
use axum::Json;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::analysis::EngineReport;
use crate::api::error::ApiError;
use crate::api::types::{ActionResponse, ApiContext, ModelQuery};
use crate::engine::{ReleaseTarget, PRIMARY_ENGINE};

/// Status of one engine as the frontend expects it.
#[derive(Serialize)]
pub struct EngineState {
    pub cargado: bool,
    pub nombre: String,
    pub tipo: String,
    pub consumo_ram: String,
    pub num_categorias: usize,
    pub num_diagnosticos: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cargado_desde: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias_de: Option<String>,
}

impl From<EngineReport> for EngineState {
    fn from(report: EngineReport) -> Self {
        Self {
            cargado: report.status.loaded,
            nombre: report.status.display_name,
            tipo: report.status.kind,
            consumo_ram: report.status.footprint,
            num_categorias: report.categories,
            num_diagnosticos: report.diagnoses,
            cargado_desde: report.status.loaded_at,
            alias_de: report.status.alias_of,
        }
    }
}

/// `GET /api/estado`: per-engine status keyed by engine name, with the
/// primary engine's fields repeated at the root for older clients.
pub async fn status(State(ctx): State<ApiContext>) -> Json<Map<String, Value>> {
    let mut body = Map::new();
    let mut primary = None;

    for report in ctx.core.analysis().engine_reports() {
        let name = report.status.name.clone();
        let value = serde_json::to_value(EngineState::from(report)).unwrap_or(Value::Null);
        if name == PRIMARY_ENGINE {
            primary = Some(value.clone());
        }
        body.insert(name, value);
    }

    if let Some(Value::Object(fields)) = primary {
        body.extend(fields);
    }
    Json(body)
}

/// `POST /cargar-modelo?modelo=`: load an engine (default `biomedclip`).
pub async fn load(
    State(ctx): State<ApiContext>,
    Query(query): Query<ModelQuery>,
) -> Result<Json<ActionResponse>, ApiError> {
    let name = query.modelo.unwrap_or_else(|| PRIMARY_ENGINE.to_string());
    let core = ctx.core.clone();
    let engine = name.clone();

    tokio::task::spawn_blocking(move || core.registry().ensure_loaded(&engine)).await??;

    Ok(Json(ActionResponse {
        exito: true,
        mensaje: format!("Model {name} loaded"),
    }))
}

/// `POST /liberar-modelo?modelo=`: release one engine or all (`todas`).
pub async fn release(
    State(ctx): State<ApiContext>,
    Query(query): Query<ModelQuery>,
) -> Result<Json<ActionResponse>, ApiError> {
    let name = query.modelo.unwrap_or_else(|| "todas".to_string());
    let target = ReleaseTarget::parse(&name);
    let core = ctx.core.clone();

    // Blocks until in-flight scoring on the engine finishes.
    let released =
        tokio::task::spawn_blocking(move || core.registry().release(&target)).await?;

    Ok(Json(ActionResponse {
        exito: true,
        mensaje: format!("Model(s) {name} released ({released} unloaded)"),
    }))
}
