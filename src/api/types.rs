//! Shared types for the HTTP layer.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core_state::CoreState;

/// Upload content types accepted by the analysis endpoints.
pub const ACCEPTED_IMAGE_TYPES: &[&str] = &["image/jpeg", "image/jpg", "image/png", "image/tiff"];

/// Multipart field names that carry the uploaded image.
pub const UPLOAD_FIELD_NAMES: &[&str] = &["archivo", "file"];

// ═══════════════════════════════════════════════════════════
// API context: shared state for the router
// ═══════════════════════════════════════════════════════════

/// Shared context for all API routes.
#[derive(Clone)]
pub struct ApiContext {
    pub core: Arc<CoreState>,
}

impl ApiContext {
    pub fn new(core: Arc<CoreState>) -> Self {
        Self { core }
    }
}

// ═══════════════════════════════════════════════════════════
// Request / response shapes
// ═══════════════════════════════════════════════════════════

/// `?modelo=` query of the lifecycle endpoints.
#[derive(Debug, Default, Deserialize)]
pub struct ModelQuery {
    pub modelo: Option<String>,
}

/// Acknowledgement returned by load/release.
#[derive(Debug, Serialize)]
pub struct ActionResponse {
    pub exito: bool,
    pub mensaje: String,
}

/// An uploaded image after multipart parsing and type validation.
#[derive(Debug, Clone)]
pub struct UploadedImage {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// Whether `content_type` (parameters ignored) is an accepted image type.
pub fn is_accepted_image_type(content_type: &str) -> bool {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    ACCEPTED_IMAGE_TYPES.contains(&essence.as_str())
}
