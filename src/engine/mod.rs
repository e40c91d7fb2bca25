//! Inference engines: registry, preprocessing, scoring.
//!
//! An engine is one named vision-text embedding model. Engines are loaded
//! on demand by the [`registry::ModelRegistry`] and borrowed for the
//! duration of a single scoring call through an [`registry::EngineLease`].
//! Several logical engine names may share one physical model (aliases);
//! they differ only in the prompt template applied to candidate texts.

pub mod mock;
#[cfg(feature = "onnx")]
pub mod onnx;
pub mod preprocess;
pub mod registry;
pub mod scoring;

use ndarray::{Array2, Array4};
use serde::Serialize;
use thiserror::Error;

pub use preprocess::{ImagePreprocessor, PreparedImage};
pub use registry::{EngineLease, EngineStatus, ModelRegistry, ReleaseTarget};
pub use scoring::{ScoreOutcome, ScoredIndex, ScoringEngine};

/// General-purpose biomedical engine (owns its weights).
pub const PRIMARY_ENGINE: &str = "biomedclip";
/// Chest radiograph engine (reuses the primary engine's weights).
pub const RADIOGRAPH_ENGINE: &str = "biovil";

// ═══════════════════════════════════════════════════════════
// Errors
// ═══════════════════════════════════════════════════════════

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Model load failed for '{engine}': {reason}")]
    ModelLoad { engine: String, reason: String },

    #[error("Model '{engine}' is not available: {reason}")]
    ModelUnavailable { engine: String, reason: String },

    #[error("Unknown engine: '{0}'")]
    UnknownEngine(String),

    #[error("Invalid image: {0}")]
    InvalidImage(String),

    #[error("Tokenization failed: {0}")]
    Tokenization(String),

    #[error("No candidate prompts supplied")]
    NoCandidates,

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Invalid engine configuration: {0}")]
    Configuration(String),
}

impl EngineError {
    /// Whether retrying the same request later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ModelLoad { .. } | Self::ModelUnavailable { .. })
    }
}

// ═══════════════════════════════════════════════════════════
// Engine description
// ═══════════════════════════════════════════════════════════

/// Image modality an engine scores. Selects the prompt template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Modality {
    Histopathology,
    ChestRadiograph,
}

impl Modality {
    /// Fixed contextual prefix prepended to every candidate prompt.
    pub fn prompt_template(&self) -> &'static str {
        match self {
            Self::Histopathology => "this is a histopathology image showing ",
            Self::ChestRadiograph => "chest x-ray with ",
        }
    }
}

impl std::fmt::Display for Modality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Histopathology => write!(f, "Histopathology"),
            Self::ChestRadiograph => write!(f, "Chest radiograph"),
        }
    }
}

/// Static description of one named engine.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSpec {
    /// Routing name (`biomedclip`, `biovil`).
    pub name: String,
    /// Human-readable model identifier reported with every result.
    pub display_name: String,
    /// Short description of what the engine classifies.
    pub kind: String,
    pub modality: Modality,
    /// Name of the engine whose weights this one reuses.
    pub alias_of: Option<String>,
    /// Directory (relative to the models dir) holding the artifacts.
    pub artifact_dir: String,
    /// Approximate resident size while loaded.
    pub footprint: String,
}

impl EngineSpec {
    pub fn biomedclip() -> Self {
        Self {
            name: PRIMARY_ENGINE.to_string(),
            display_name: "BiomedCLIP (Microsoft)".to_string(),
            kind: "Zero-Shot Classification - Forense".to_string(),
            modality: Modality::Histopathology,
            alias_of: None,
            artifact_dir: "BiomedCLIP-PubMedBERT_256-vit_base_patch16_224".to_string(),
            footprint: "~1.5 GB".to_string(),
        }
    }

    /// BioViL-T slot. No dedicated radiograph model is deployed, so it runs
    /// on the BiomedCLIP weights with radiograph prompts.
    pub fn biovil() -> Self {
        Self {
            name: RADIOGRAPH_ENGINE.to_string(),
            display_name: "BioViL-T (Microsoft)".to_string(),
            kind: "Zero-Shot Classification - Radiografía de Tórax".to_string(),
            modality: Modality::ChestRadiograph,
            alias_of: Some(PRIMARY_ENGINE.to_string()),
            artifact_dir: "BiomedCLIP-PubMedBERT_256-vit_base_patch16_224".to_string(),
            footprint: "~1.5 GB".to_string(),
        }
    }

    /// The engines this service deploys.
    pub fn defaults() -> Vec<Self> {
        vec![Self::biomedclip(), Self::biovil()]
    }

    pub fn is_alias(&self) -> bool {
        self.alias_of.is_some()
    }
}

// ═══════════════════════════════════════════════════════════
// Model abstractions
// ═══════════════════════════════════════════════════════════

/// Token ids for a batch of prompts, padded to a common length.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenBatch {
    /// Shape `[batch, seq_len]`.
    pub input_ids: Array2<i64>,
    /// Shape `[batch, seq_len]`, 1 for real tokens, 0 for padding.
    pub attention_mask: Array2<i64>,
}

impl TokenBatch {
    pub fn batch_size(&self) -> usize {
        self.input_ids.nrows()
    }

    pub fn seq_len(&self) -> usize {
        self.input_ids.ncols()
    }
}

/// Text tokenizer with a strict and a lenient encoding path.
pub trait TextTokenizer: Send + Sync {
    /// Encode without truncation. Fails on prompts longer than the
    /// context window or containing tokens the vocabulary cannot express.
    fn encode_batch(&self, texts: &[String]) -> Result<TokenBatch, EngineError>;

    /// Encode with truncation and padding to the context window.
    fn encode_batch_truncated(&self, texts: &[String]) -> Result<TokenBatch, EngineError>;

    /// Maximum sequence length accepted by the text encoder.
    fn context_length(&self) -> usize;
}

/// Shared vision-text embedding model. Inference only.
pub trait VisionTextModel: Send + Sync {
    /// Encode one preprocessed image (`[1, 3, H, W]`) into an embedding.
    fn encode_image(&self, pixels: &Array4<f32>) -> Result<Vec<f32>, EngineError>;

    /// Encode a token batch into one embedding per row.
    fn encode_text(&self, tokens: &TokenBatch) -> Result<Vec<Vec<f32>>, EngineError>;

    /// Calibrated temperature, already exponentiated.
    fn logit_scale(&self) -> f32;
}

/// Everything a loaded engine needs to score. Built as a unit so an
/// engine is never observable with only some parts present.
pub struct LoadedEngine {
    pub model: Box<dyn VisionTextModel>,
    pub preprocessor: ImagePreprocessor,
    pub tokenizer: Box<dyn TextTokenizer>,
}

impl std::fmt::Debug for LoadedEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedEngine")
            .field("preprocessor", &self.preprocessor)
            .field("context_length", &self.tokenizer.context_length())
            .finish_non_exhaustive()
    }
}

/// Materializes engines from their artifacts.
pub trait ModelLoader: Send + Sync {
    /// Fetch weights and build preprocessor + tokenizer for `spec`.
    fn load(&self, spec: &EngineSpec) -> Result<LoadedEngine, EngineError>;

    /// Return freed memory to the system / clear accelerator caches.
    /// Called after every release pass.
    fn reclaim(&self) {}
}
