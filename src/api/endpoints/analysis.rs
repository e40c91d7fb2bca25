//! Image analysis endpoints (multipart upload).
//!
//! The uploaded image arrives in field `archivo` (`file` is accepted too).
//! Inference runs on the blocking pool; the handler only parses and maps.

use axum::extract::{Multipart, Path, State};
use axum::Json;
use serde::Serialize;

use crate::analysis::{AnalysisError, AnalysisResult, AnalysisService};
use crate::api::error::ApiError;
use crate::api::types::{is_accepted_image_type, ApiContext, UploadedImage, UPLOAD_FIELD_NAMES};
use crate::engine::{ReleaseTarget, PRIMARY_ENGINE};

/// Analysis result plus upload metadata.
#[derive(Serialize)]
pub struct AnalysisResponse {
    pub exito: bool,
    pub nombre_archivo: String,
    #[serde(flatten)]
    pub result: AnalysisResult,
}

/// `POST /api/analizar`: histology over all categories.
pub async fn analyze(
    State(ctx): State<ApiContext>,
    multipart: Multipart,
) -> Result<Json<AnalysisResponse>, ApiError> {
    let upload = read_upload(multipart).await?;
    run(ctx, upload, |service, bytes| service.analyze_histology(bytes, None)).await
}

/// `POST /api/analizar/:categoria`: histology restricted to one category.
pub async fn analyze_category(
    State(ctx): State<ApiContext>,
    Path(category): Path<String>,
    multipart: Multipart,
) -> Result<Json<AnalysisResponse>, ApiError> {
    // Unknown categories are a 404 even before the upload is inspected.
    ctx.core.analysis().histology().category(&category)?;
    let upload = read_upload(multipart).await?;
    run(ctx, upload, move |service, bytes| {
        service.analyze_histology(bytes, Some(&category))
    })
    .await
}

/// `POST /api/analizar-radiografia`: chest radiograph analysis.
pub async fn analyze_radiograph(
    State(ctx): State<ApiContext>,
    multipart: Multipart,
) -> Result<Json<AnalysisResponse>, ApiError> {
    let upload = read_upload(multipart).await?;
    run(ctx, upload, |service, bytes| service.analyze_radiograph(bytes)).await
}

/// `POST /analizar-y-liberar`: histology, then release the primary engine.
///
/// A rejected upload also releases the engine.
pub async fn analyze_and_release(
    State(ctx): State<ApiContext>,
    multipart: Multipart,
) -> Result<Json<AnalysisResponse>, ApiError> {
    let upload = match read_upload(multipart).await {
        Ok(upload) => upload,
        Err(e) => {
            let core = ctx.core.clone();
            let target = ReleaseTarget::Engine(PRIMARY_ENGINE.to_string());
            tokio::task::spawn_blocking(move || core.registry().release(&target)).await?;
            return Err(e);
        }
    };
    run(ctx, upload, |service, bytes| service.analyze_and_release(bytes)).await
}

async fn run<F>(
    ctx: ApiContext,
    upload: UploadedImage,
    analyze: F,
) -> Result<Json<AnalysisResponse>, ApiError>
where
    F: FnOnce(&AnalysisService, &[u8]) -> Result<AnalysisResult, AnalysisError> + Send + 'static,
{
    let core = ctx.core.clone();
    let bytes = upload.bytes;
    let result = tokio::task::spawn_blocking(move || analyze(core.analysis(), &bytes)).await??;

    ctx.core.record_analysis();
    tracing::info!(
        file = %upload.file_name,
        content_type = %upload.content_type,
        principal = %result.principal.id,
        "Upload analyzed"
    );

    Ok(Json(AnalysisResponse {
        exito: true,
        nombre_archivo: upload.file_name,
        result,
    }))
}

/// Pull the image field out of the multipart body and validate its type.
pub(crate) async fn read_upload(mut multipart: Multipart) -> Result<UploadedImage, ApiError> {
    loop {
        let field = multipart
            .next_field()
            .await
            .map_err(|e| ApiError::BadRequest(format!("Malformed multipart body: {e}")))?;
        let Some(field) = field else {
            return Err(ApiError::MissingFile);
        };

        let name = field.name().unwrap_or("").to_string();
        if !UPLOAD_FIELD_NAMES.contains(&name.as_str()) {
            continue;
        }

        let content_type = field.content_type().unwrap_or("").to_string();
        if !is_accepted_image_type(&content_type) {
            return Err(ApiError::UnsupportedMediaType(if content_type.is_empty() {
                "unknown".to_string()
            } else {
                content_type
            }));
        }

        let file_name = field.file_name().unwrap_or("image").to_string();
        let bytes = field.bytes().await.map_err(|e| {
            tracing::warn!("Failed to read upload bytes: {e}");
            ApiError::BadRequest("Failed to read file data".to_string())
        })?;

        return Ok(UploadedImage {
            file_name,
            content_type,
            bytes: bytes.to_vec(),
        });
    }
}
