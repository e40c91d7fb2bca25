//! HTTP router.
//!
//! Layers (outermost → innermost): CORS → request tracing → body limit.

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::Uri;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::api::endpoints;
use crate::api::error::ApiError;
use crate::api::types::ApiContext;
use crate::config::MAX_UPLOAD_BYTES;
use crate::core_state::CoreState;

/// Build the full router over `core`.
pub fn api_router(core: Arc<CoreState>) -> Router {
    build_router(ApiContext::new(core))
}

fn build_router(ctx: ApiContext) -> Router {
    // NOTE: Path params use `:param` syntax (matchit 0.7 / axum 0.7).
    let api = Router::new()
        .route("/", get(endpoints::catalog::info))
        .route("/health", get(endpoints::health::check))
        .route("/estado", get(endpoints::models::status))
        .route("/categorias", get(endpoints::catalog::list))
        .route("/categorias/:categoria", get(endpoints::catalog::detail))
        .route(
            "/categorias-radiografia",
            get(endpoints::catalog::list_radiograph),
        )
        .route("/analizar", post(endpoints::analysis::analyze))
        .route(
            "/analizar/:categoria",
            post(endpoints::analysis::analyze_category),
        )
        .route(
            "/analizar-radiografia",
            post(endpoints::analysis::analyze_radiograph),
        );

    Router::new()
        .nest("/api", api)
        .route("/cargar-modelo", post(endpoints::models::load))
        .route("/liberar-modelo", post(endpoints::models::release))
        .route(
            "/analizar-y-liberar",
            post(endpoints::analysis::analyze_and_release),
        )
        .fallback(not_found)
        .with_state(ctx)
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

async fn not_found(uri: Uri) -> ApiError {
    ApiError::NotFound(uri.path().to_string())
}
