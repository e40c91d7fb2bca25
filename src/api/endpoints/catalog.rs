//! Service info and taxonomy browsing endpoints.

use axum::extract::{Path, State};
use axum::Json;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::api::error::ApiError;
use crate::api::types::ApiContext;
use crate::config::{APP_NAME, APP_VERSION};
use crate::engine::PRIMARY_ENGINE;
use crate::taxonomy::{Category, TaxonomyStore};

#[derive(Serialize)]
pub struct ServiceInfo {
    pub servicio: String,
    pub version: &'static str,
    pub modelo: String,
    pub tipo: String,
    pub estado: &'static str,
    pub estadisticas: Statistics,
    pub categorias_disponibles: Vec<String>,
    pub endpoints: Map<String, Value>,
}

#[derive(Serialize)]
pub struct Statistics {
    pub categorias: usize,
    pub diagnosticos_totales: usize,
    pub diagnosticos_radiografia: usize,
}

#[derive(Serialize)]
pub struct DiagnosisSummary {
    pub id: String,
    pub nombre: String,
}

#[derive(Serialize)]
pub struct CategorySummary {
    pub nombre: String,
    pub descripcion: String,
    pub num_diagnosticos: usize,
    pub diagnosticos: Vec<DiagnosisSummary>,
}

#[derive(Serialize)]
pub struct CategoryDetail {
    pub categoria: String,
    pub nombre: String,
    pub descripcion: String,
    pub diagnosticos: Vec<Map<String, Value>>,
}

/// `GET /api`: service description, category keys and totals.
pub async fn info(State(ctx): State<ApiContext>) -> Json<ServiceInfo> {
    let analysis = ctx.core.analysis();
    let histology = analysis.histology();
    let (modelo, tipo) = analysis
        .registry()
        .spec(PRIMARY_ENGINE)
        .map(|s| (s.display_name.clone(), s.kind.clone()))
        .unwrap_or_default();

    let endpoints = [
        ("analizar", "POST /api/analizar"),
        ("analizar_categoria", "POST /api/analizar/:categoria"),
        ("analizar_radiografia", "POST /api/analizar-radiografia"),
        ("analizar_y_liberar", "POST /analizar-y-liberar"),
        ("estado", "GET /api/estado"),
        ("categorias", "GET /api/categorias"),
        ("cargar_modelo", "POST /cargar-modelo?modelo="),
        ("liberar_modelo", "POST /liberar-modelo?modelo="),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), Value::from(v)))
    .collect();

    Json(ServiceInfo {
        servicio: format!("{APP_NAME} API"),
        version: APP_VERSION,
        modelo,
        tipo,
        estado: "activo",
        estadisticas: Statistics {
            categorias: histology.category_count(),
            diagnosticos_totales: histology.diagnosis_count(),
            diagnosticos_radiografia: analysis.radiograph().diagnosis_count(),
        },
        categorias_disponibles: histology.category_keys(),
        endpoints,
    })
}

/// `GET /api/categorias`: histology category summaries keyed by id.
pub async fn list(State(ctx): State<ApiContext>) -> Json<Map<String, Value>> {
    Json(summaries(ctx.core.analysis().histology()))
}

/// `GET /api/categorias-radiografia`: radiograph category summaries.
pub async fn list_radiograph(State(ctx): State<ApiContext>) -> Json<Map<String, Value>> {
    Json(summaries(ctx.core.analysis().radiograph()))
}

/// `GET /api/categorias/:categoria`: every diagnosis of one category.
pub async fn detail(
    State(ctx): State<ApiContext>,
    Path(key): Path<String>,
) -> Result<Json<CategoryDetail>, ApiError> {
    let category = ctx.core.analysis().histology().category(&key)?;
    Ok(Json(category_detail(category)))
}

fn summaries(store: &TaxonomyStore) -> Map<String, Value> {
    store
        .categories()
        .iter()
        .map(|category| {
            let summary = CategorySummary {
                nombre: category.display_name.clone(),
                descripcion: category.description.clone(),
                num_diagnosticos: category.diagnoses.len(),
                diagnosticos: category
                    .diagnoses
                    .iter()
                    .map(|d| DiagnosisSummary {
                        id: d.id.clone(),
                        nombre: d.display_name.clone(),
                    })
                    .collect(),
            };
            (
                category.id.clone(),
                serde_json::to_value(summary).unwrap_or(Value::Null),
            )
        })
        .collect()
}

fn category_detail(category: &Category) -> CategoryDetail {
    let diagnosticos = category
        .diagnoses
        .iter()
        .map(|d| {
            let mut entry = Map::new();
            entry.insert("id".into(), Value::from(d.id.as_str()));
            entry.insert("nombre".into(), Value::from(d.display_name.as_str()));
            entry.insert("descripcion".into(), Value::from(d.description.as_str()));
            entry.insert("hallazgos".into(), Value::from(d.findings.clone()));
            // Extra attributes sit next to the named fields, in declaration order.
            entry.extend(d.extra_map());
            entry
        })
        .collect();

    CategoryDetail {
        categoria: category.id.clone(),
        nombre: category.display_name.clone(),
        descripcion: category.description.clone(),
        diagnosticos,
    }
}
