//! Process-wide application state.
//!
//! `CoreState` is built once at startup, wrapped in `Arc` and shared by
//! every HTTP handler. All mutable engine state lives inside the
//! [`ModelRegistry`]; the rest is read-only after construction.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;

use crate::analysis::AnalysisService;
use crate::config::{Backend, ServerConfig};
use crate::engine::mock::MockLoader;
use crate::engine::{EngineError, ModelLoader, ModelRegistry, ReleaseTarget};
use crate::taxonomy::TaxonomyError;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Taxonomy failed to load: {0}")]
    Taxonomy(#[from] TaxonomyError),

    #[error("Engine setup failed: {0}")]
    Engine(#[from] EngineError),
}

pub struct CoreState {
    pub config: ServerConfig,
    analysis: AnalysisService,
    started_at: Instant,
    analyses_served: AtomicU64,
}

impl CoreState {
    /// Build state for `config`, picking the model loader from its backend.
    pub fn new(config: ServerConfig) -> Result<Self, CoreError> {
        let loader = loader_for(&config)?;
        Self::with_loader(config, loader)
    }

    /// Build state with an explicit loader and the built-in taxonomy tables.
    pub fn with_loader(
        config: ServerConfig,
        loader: Box<dyn ModelLoader>,
    ) -> Result<Self, CoreError> {
        let registry = Arc::new(ModelRegistry::with_default_engines(loader)?);
        let analysis = AnalysisService::with_builtin_tables(registry)?;
        tracing::info!(
            backend = %config.backend,
            categories = analysis.histology().category_count(),
            diagnoses = analysis.histology().diagnosis_count(),
            radiograph_diagnoses = analysis.radiograph().diagnosis_count(),
            "Core state ready"
        );
        Ok(Self::from_parts(config, analysis))
    }

    /// Build state around an already-assembled service (tests, embedding).
    pub fn from_parts(config: ServerConfig, analysis: AnalysisService) -> Self {
        Self {
            config,
            analysis,
            started_at: Instant::now(),
            analyses_served: AtomicU64::new(0),
        }
    }

    pub fn analysis(&self) -> &AnalysisService {
        &self.analysis
    }

    pub fn registry(&self) -> &ModelRegistry {
        self.analysis.registry()
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn record_analysis(&self) {
        self.analyses_served.fetch_add(1, Ordering::Relaxed);
    }

    pub fn analyses_served(&self) -> u64 {
        self.analyses_served.load(Ordering::Relaxed)
    }

    /// Release every engine. Called on shutdown.
    pub fn shutdown(&self) {
        let released = self.registry().release(&ReleaseTarget::All);
        tracing::info!(released, "Engines released on shutdown");
    }
}

/// Loader for the configured backend. Asking for ONNX on a build without
/// the `onnx` feature is a configuration error.
fn loader_for(config: &ServerConfig) -> Result<Box<dyn ModelLoader>, EngineError> {
    match config.backend {
        #[cfg(feature = "onnx")]
        Backend::Onnx => Ok(Box::new(crate::engine::onnx::OnnxModelLoader::new(
            config.models_dir.clone(),
        ))),
        #[cfg(not(feature = "onnx"))]
        Backend::Onnx => Err(EngineError::Configuration(
            "ONNX backend requested but this build lacks the `onnx` feature".to_string(),
        )),
        Backend::Mock => {
            tracing::warn!("Mock backend selected: scores carry no diagnostic meaning");
            Ok(Box::new(MockLoader::new()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::PRIMARY_ENGINE;

    fn mock_config() -> ServerConfig {
        ServerConfig {
            backend: Backend::Mock,
            ..ServerConfig::default()
        }
    }

    #[test]
    fn mock_backend_builds_with_builtin_tables() {
        let core = CoreState::new(mock_config()).unwrap();
        assert_eq!(core.analysis().histology().category_count(), 13);
        assert!(!core.registry().is_loaded(PRIMARY_ENGINE));
        assert_eq!(core.analyses_served(), 0);
    }

    #[cfg(not(feature = "onnx"))]
    #[test]
    fn onnx_backend_without_feature_fails_startup() {
        let config = ServerConfig {
            backend: Backend::Onnx,
            ..ServerConfig::default()
        };
        let err = CoreState::new(config).err().unwrap();
        assert!(matches!(
            err,
            CoreError::Engine(EngineError::Configuration(_))
        ));
    }

    #[test]
    fn shutdown_releases_engines() {
        let core = CoreState::new(mock_config()).unwrap();
        core.registry().ensure_loaded(PRIMARY_ENGINE).unwrap();
        core.shutdown();
        assert!(!core.registry().is_loaded(PRIMARY_ENGINE));
    }

    #[test]
    fn analysis_counter_increments() {
        let core = CoreState::new(mock_config()).unwrap();
        core.record_analysis();
        core.record_analysis();
        assert_eq!(core.analyses_served(), 2);
    }
}
