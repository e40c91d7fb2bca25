//! AnalysisService: the operations exposed to the HTTP layer.
//!
//! Every method here is blocking (model load + inference). The API layer
//! calls them from `spawn_blocking`.

use std::sync::Arc;

use serde::Serialize;

use super::{rank, AnalysisError, AnalysisResult};
use crate::engine::{
    EngineStatus, Modality, ModelRegistry, ReleaseTarget, ScoringEngine, PRIMARY_ENGINE,
    RADIOGRAPH_ENGINE,
};
use crate::taxonomy::{builtin, Candidate, TaxonomyError, TaxonomyStore};

const HISTOLOGY_CLASSIFICATION: &str = "Zero-shot";
const RADIOGRAPH_IMAGE_KIND: &str = "Radiografía de tórax";

/// Engine status enriched with the size of the taxonomy it scores against.
#[derive(Debug, Clone, Serialize)]
pub struct EngineReport {
    #[serde(flatten)]
    pub status: EngineStatus,
    pub categories: usize,
    pub diagnoses: usize,
}

#[derive(Debug, Clone)]
pub struct AnalysisService {
    scoring: ScoringEngine,
    histology: Arc<TaxonomyStore>,
    radiograph: Arc<TaxonomyStore>,
}

impl AnalysisService {
    pub fn new(
        registry: Arc<ModelRegistry>,
        histology: TaxonomyStore,
        radiograph: TaxonomyStore,
    ) -> Self {
        Self {
            scoring: ScoringEngine::new(registry),
            histology: Arc::new(histology),
            radiograph: Arc::new(radiograph),
        }
    }

    /// Service over the forensic histopathology and chest radiograph tables
    /// compiled into the binary.
    pub fn with_builtin_tables(registry: Arc<ModelRegistry>) -> Result<Self, TaxonomyError> {
        Ok(Self::new(
            registry,
            builtin::forensic_histopathology()?,
            builtin::chest_radiograph()?,
        ))
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        self.scoring.registry()
    }

    pub fn histology(&self) -> &TaxonomyStore {
        &self.histology
    }

    pub fn radiograph(&self) -> &TaxonomyStore {
        &self.radiograph
    }

    fn taxonomy_for(&self, modality: Modality) -> &TaxonomyStore {
        match modality {
            Modality::Histopathology => &self.histology,
            Modality::ChestRadiograph => &self.radiograph,
        }
    }

    // ── Analysis ────────────────────────────────────────────

    /// Score a tissue image against every histology diagnosis, or only the
    /// ones in `category` when given. Unknown categories fail before any
    /// model is loaded.
    pub fn analyze_histology(
        &self,
        image_bytes: &[u8],
        category: Option<&str>,
    ) -> Result<AnalysisResult, AnalysisError> {
        let candidates = self.histology.candidates(category)?;
        let mut result = self.run(PRIMARY_ENGINE, image_bytes, &candidates)?;
        result.classification_kind = Some(HISTOLOGY_CLASSIFICATION.to_string());
        result.category_filter = category.map(str::to_string);

        tracing::info!(
            engine = PRIMARY_ENGINE,
            category = category.unwrap_or("*"),
            principal = %result.principal.id,
            confidence = result.confidence.as_str(),
            elapsed = %result.elapsed,
            "Histology analysis complete"
        );
        Ok(result)
    }

    /// Score a chest radiograph against the radiograph taxonomy.
    pub fn analyze_radiograph(&self, image_bytes: &[u8]) -> Result<AnalysisResult, AnalysisError> {
        let candidates = self.radiograph.candidates(None)?;
        let mut result = self.run(RADIOGRAPH_ENGINE, image_bytes, &candidates)?;
        result.image_kind = Some(RADIOGRAPH_IMAGE_KIND.to_string());

        tracing::info!(
            engine = RADIOGRAPH_ENGINE,
            principal = %result.principal.id,
            confidence = result.confidence.as_str(),
            elapsed = %result.elapsed,
            "Radiograph analysis complete"
        );
        Ok(result)
    }

    /// Histology analysis over all categories, then release the primary
    /// engine whether or not the analysis succeeded.
    pub fn analyze_and_release(&self, image_bytes: &[u8]) -> Result<AnalysisResult, AnalysisError> {
        let outcome = self.analyze_histology(image_bytes, None);
        self.registry()
            .release(&ReleaseTarget::Engine(PRIMARY_ENGINE.to_string()));
        outcome.map(|mut result| {
            result.model_released = Some(true);
            result
        })
    }

    fn run(
        &self,
        engine: &str,
        image_bytes: &[u8],
        candidates: &[Candidate<'_>],
    ) -> Result<AnalysisResult, AnalysisError> {
        let prompts: Vec<&str> = candidates.iter().map(|c| c.record.prompt.as_str()).collect();
        let outcome = self.scoring.score(engine, image_bytes, &prompts)?;
        let model = self
            .registry()
            .spec(engine)
            .map(|s| s.display_name.clone())
            .unwrap_or_else(|| engine.to_string());
        rank(candidates, &outcome, &model)
    }

    // ── Status ──────────────────────────────────────────────

    pub fn engine_reports(&self) -> Vec<EngineReport> {
        self.registry()
            .status()
            .into_iter()
            .map(|status| {
                let taxonomy = self
                    .registry()
                    .spec(&status.name)
                    .map(|spec| self.taxonomy_for(spec.modality));
                EngineReport {
                    categories: taxonomy.map_or(0, TaxonomyStore::category_count),
                    diagnoses: taxonomy.map_or(0, TaxonomyStore::diagnosis_count),
                    status,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::MockLoader;
    use crate::engine::preprocess::tests::png_bytes;
    use crate::engine::EngineError;
    use crate::taxonomy::tests::sample_store;

    fn service_with(loader: &Arc<MockLoader>) -> AnalysisService {
        let registry =
            ModelRegistry::with_default_engines(Box::new(Arc::clone(loader))).unwrap();
        AnalysisService::new(Arc::new(registry), sample_store(), sample_store())
    }

    fn service() -> AnalysisService {
        service_with(&Arc::new(MockLoader::new()))
    }

    #[test]
    fn histology_over_all_categories() {
        let result = service()
            .analyze_histology(&png_bytes(120, 80, [200, 120, 140]), None)
            .unwrap();
        assert_eq!(result.all.len(), 3);
        assert_eq!(result.alternatives.len(), 2);
        assert_eq!(result.model, "BiomedCLIP (Microsoft)");
        assert_eq!(result.classification_kind.as_deref(), Some("Zero-shot"));
        assert_eq!(result.image_size, "120x80");
        assert!(result.category_filter.is_none());
    }

    #[test]
    fn histology_with_filter() {
        let result = service()
            .analyze_histology(&png_bytes(32, 32, [10, 10, 10]), Some("contusiones"))
            .unwrap();
        assert_eq!(result.all.len(), 2);
        assert_eq!(result.candidates_evaluated, 2);
        assert_eq!(result.category_filter.as_deref(), Some("contusiones"));
    }

    #[test]
    fn unknown_category_fails_before_loading() {
        let loader = Arc::new(MockLoader::new());
        let service = service_with(&loader);
        let err = service
            .analyze_histology(&png_bytes(8, 8, [0, 0, 0]), Some("rodilla"))
            .unwrap_err();
        assert!(matches!(
            err,
            AnalysisError::Taxonomy(TaxonomyError::CategoryNotFound { .. })
        ));
        assert_eq!(loader.instantiations(), 0);
    }

    #[test]
    fn invalid_image_yields_no_result() {
        let err = service()
            .analyze_histology(b"not an image", None)
            .unwrap_err();
        assert!(matches!(err, AnalysisError::Engine(EngineError::InvalidImage(_))));
    }

    #[test]
    fn radiograph_uses_alias_engine() {
        let loader = Arc::new(MockLoader::new());
        let service = service_with(&loader);
        let result = service
            .analyze_radiograph(&png_bytes(64, 64, [90, 90, 90]))
            .unwrap();
        assert_eq!(result.model, "BioViL-T (Microsoft)");
        assert_eq!(result.image_kind.as_deref(), Some("Radiografía de tórax"));
        assert!(result.classification_kind.is_none());

        service
            .analyze_histology(&png_bytes(64, 64, [90, 90, 90]), None)
            .unwrap();
        assert_eq!(loader.instantiations(), 1);
    }

    #[test]
    fn analyze_and_release_unloads_on_success() {
        let service = service();
        let result = service
            .analyze_and_release(&png_bytes(16, 16, [1, 2, 3]))
            .unwrap();
        assert_eq!(result.model_released, Some(true));
        assert!(!service.registry().is_loaded(PRIMARY_ENGINE));
    }

    #[test]
    fn analyze_and_release_unloads_on_failure() {
        let service = service();
        service.registry().ensure_loaded(PRIMARY_ENGINE).unwrap();

        assert!(service.analyze_and_release(b"garbage").is_err());
        assert!(!service.registry().is_loaded(PRIMARY_ENGINE));
    }

    #[test]
    fn reports_carry_taxonomy_sizes() {
        let service = service();
        let reports = service.engine_reports();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].status.name, PRIMARY_ENGINE);
        assert_eq!(reports[0].categories, 2);
        assert_eq!(reports[0].diagnoses, 3);
        assert!(!reports[0].status.loaded);
    }

    #[test]
    fn builtin_tables_load() {
        let registry =
            ModelRegistry::with_default_engines(Box::new(MockLoader::new())).unwrap();
        let service = AnalysisService::with_builtin_tables(Arc::new(registry)).unwrap();
        assert_eq!(service.histology().category_count(), 13);
        assert_eq!(service.radiograph().diagnosis_count(), 14);
    }
}
