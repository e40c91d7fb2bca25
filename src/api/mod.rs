//! HTTP surface.
//!
//! Thin axum glue over [`crate::analysis::AnalysisService`]: taxonomy
//! browsing, engine lifecycle control and multipart image analysis.
//! Blocking work (model load, inference, release) runs on the
//! `spawn_blocking` pool.

pub mod endpoints;
pub mod error;
pub mod router;
pub mod server;
pub mod types;

pub use error::ApiError;
pub use router::api_router;
pub use server::{serve, spawn, RunningServer, ServerError};
pub use types::ApiContext;
