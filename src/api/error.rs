//! API error types with structured JSON responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::analysis::AnalysisError;
use crate::engine::EngineError;
use crate::taxonomy::TaxonomyError;

/// Seconds a client should wait before retrying after a model failure.
const MODEL_RETRY_AFTER_SECS: u64 = 10;

/// Structured error response body.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: &'static str,
    pub message: String,
}

/// API-level errors with HTTP status mapping.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Invalid image: {0}")]
    InvalidImage(String),
    #[error("Unsupported file type: {0}")]
    UnsupportedMediaType(String),
    #[error("No image uploaded")]
    MissingFile,
    #[error("Invalid request: {0}")]
    BadRequest(String),
    #[error("{0}")]
    CategoryNotFound(String),
    #[error("Unknown engine: {0}")]
    UnknownEngine(String),
    #[error("Model unavailable: {0}")]
    ModelUnavailable(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            ApiError::InvalidImage(detail) => (
                StatusCode::BAD_REQUEST,
                "INVALID_IMAGE",
                format!("Invalid image: {detail}"),
            ),
            ApiError::UnsupportedMediaType(content_type) => (
                StatusCode::BAD_REQUEST,
                "UNSUPPORTED_FORMAT",
                format!("Unsupported file type: {content_type}. Use JPEG, PNG or TIFF."),
            ),
            ApiError::MissingFile => (
                StatusCode::BAD_REQUEST,
                "MISSING_FILE",
                "No image uploaded (expected multipart field 'archivo')".to_string(),
            ),
            ApiError::BadRequest(detail) => {
                (StatusCode::BAD_REQUEST, "BAD_REQUEST", detail.clone())
            }
            ApiError::CategoryNotFound(detail) => {
                (StatusCode::NOT_FOUND, "CATEGORY_NOT_FOUND", detail.clone())
            }
            ApiError::UnknownEngine(name) => (
                StatusCode::NOT_FOUND,
                "UNKNOWN_ENGINE",
                format!("Unknown engine: '{name}'"),
            ),
            ApiError::ModelUnavailable(detail) => {
                tracing::warn!(detail, "Model unavailable");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "MODEL_UNAVAILABLE",
                    "The model could not be loaded. Retry later.".to_string(),
                )
            }
            ApiError::NotFound(path) => (
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                format!("Route not found: {path}"),
            ),
            ApiError::Internal(detail) => {
                tracing::error!(detail, "API internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL",
                    "An internal error occurred".to_string(),
                )
            }
        };

        let body = ErrorBody {
            error: ErrorDetail { code, message },
        };

        let mut response = (status, Json(body)).into_response();
        if let ApiError::ModelUnavailable(_) = &self {
            if let Ok(val) = axum::http::HeaderValue::from_str(&MODEL_RETRY_AFTER_SECS.to_string()) {
                response.headers_mut().insert("Retry-After", val);
            }
        }
        response
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::ModelLoad { .. } | EngineError::ModelUnavailable { .. } => {
                ApiError::ModelUnavailable(err.to_string())
            }
            EngineError::UnknownEngine(name) => ApiError::UnknownEngine(name),
            EngineError::InvalidImage(detail) => ApiError::InvalidImage(detail),
            EngineError::Tokenization(_)
            | EngineError::NoCandidates
            | EngineError::Inference(_)
            | EngineError::Configuration(_) => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<TaxonomyError> for ApiError {
    fn from(err: TaxonomyError) -> Self {
        match err {
            TaxonomyError::CategoryNotFound { .. } => ApiError::CategoryNotFound(err.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<AnalysisError> for ApiError {
    fn from(err: AnalysisError) -> Self {
        match err {
            AnalysisError::Taxonomy(e) => e.into(),
            AnalysisError::Engine(e) => e.into(),
            AnalysisError::EmptyRanking => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(err: tokio::task::JoinError) -> Self {
        ApiError::Internal(format!("blocking task failed: {err}"))
    }
}
