//! Analysis: taxonomy + scoring + ranking for one uploaded image.

pub mod ranker;
pub mod service;

use thiserror::Error;

use crate::engine::EngineError;
use crate::taxonomy::TaxonomyError;

pub use ranker::{rank, AnalysisResult, Confidence, DiagnosisOutcome};
pub use service::{AnalysisService, EngineReport};

#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error(transparent)]
    Taxonomy(#[from] TaxonomyError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("Scoring returned no ranked candidates")]
    EmptyRanking,
}
