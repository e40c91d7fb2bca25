//! ONNX Runtime backend (feature `onnx`).
//!
//! Each engine directory under the models dir must contain:
//! - `image_encoder.onnx`: `pixel_values [1, 3, S, S]` → `[1, D]`
//! - `text_encoder.onnx`: `input_ids [B, L]`, `attention_mask [B, L]` → `[B, D]`
//! - `tokenizer.json`: HuggingFace tokenizer definition
//! - `clip_config.json`: logit scale and preprocessing constants
//!
//! Uses interior mutability (Mutex) because `ort::Session::run` requires
//! `&mut self` while [`VisionTextModel`] exposes `&self`.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use ndarray::{Array2, Array4};
use ort::session::Session;
use ort::value::TensorRef;
use serde::Deserialize;
use tokenizers::{PaddingParams, PaddingStrategy, Tokenizer, TruncationParams};

use super::{
    EngineError, EngineSpec, ImagePreprocessor, LoadedEngine, ModelLoader, TextTokenizer,
    TokenBatch, VisionTextModel,
};

const IMAGE_ENCODER_FILE: &str = "image_encoder.onnx";
const TEXT_ENCODER_FILE: &str = "text_encoder.onnx";
const TOKENIZER_FILE: &str = "tokenizer.json";
const CLIP_CONFIG_FILE: &str = "clip_config.json";

/// Upper bound applied to the exponentiated logit scale (as in CLIP training).
const MAX_LOGIT_SCALE: f32 = 100.0;

// ═══════════════════════════════════════════════════════════
// Artifact config
// ═══════════════════════════════════════════════════════════

/// Contents of `clip_config.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct ClipConfig {
    /// Temperature in log space, as stored in the checkpoint.
    pub logit_scale: f32,
    #[serde(default = "default_context_length")]
    pub context_length: usize,
    #[serde(flatten)]
    pub preprocess: ImagePreprocessor,
}

fn default_context_length() -> usize {
    256
}

impl ClipConfig {
    pub fn from_file(path: &Path) -> Result<Self, EngineError> {
        let raw = std::fs::read_to_string(path).map_err(|e| EngineError::ModelLoad {
            engine: path.display().to_string(),
            reason: format!("cannot read {}: {e}", path.display()),
        })?;
        serde_json::from_str(&raw).map_err(|e| EngineError::ModelLoad {
            engine: path.display().to_string(),
            reason: format!("invalid {}: {e}", path.display()),
        })
    }

    /// Exponentiated and clamped temperature.
    pub fn scale(&self) -> f32 {
        self.logit_scale.exp().min(MAX_LOGIT_SCALE)
    }
}

// ═══════════════════════════════════════════════════════════
// Loader
// ═══════════════════════════════════════════════════════════

/// Loads engines from `<models_dir>/<artifact_dir>`.
#[derive(Debug, Clone)]
pub struct OnnxModelLoader {
    models_dir: PathBuf,
}

impl OnnxModelLoader {
    pub fn new(models_dir: impl Into<PathBuf>) -> Self {
        Self {
            models_dir: models_dir.into(),
        }
    }

    pub fn engine_dir(&self, spec: &EngineSpec) -> PathBuf {
        self.models_dir.join(&spec.artifact_dir)
    }
}

impl ModelLoader for OnnxModelLoader {
    fn load(&self, spec: &EngineSpec) -> Result<LoadedEngine, EngineError> {
        let dir = self.engine_dir(spec);
        let fail = |reason: String| EngineError::ModelLoad {
            engine: spec.name.clone(),
            reason,
        };

        for file in [IMAGE_ENCODER_FILE, TEXT_ENCODER_FILE, TOKENIZER_FILE, CLIP_CONFIG_FILE] {
            let path = dir.join(file);
            if !path.exists() {
                return Err(fail(format!("missing artifact {}", path.display())));
            }
        }

        let config = ClipConfig::from_file(&dir.join(CLIP_CONFIG_FILE))
            .map_err(|e| fail(e.to_string()))?;
        let image_session = open_session(&dir.join(IMAGE_ENCODER_FILE)).map_err(fail)?;
        let text_session = open_session(&dir.join(TEXT_ENCODER_FILE)).map_err(fail)?;
        let tokenizer = HfTokenizer::from_file(&dir.join(TOKENIZER_FILE), config.context_length)
            .map_err(|e| fail(e.to_string()))?;

        tracing::info!(
            engine = %spec.name,
            dir = %dir.display(),
            context_length = config.context_length,
            "ONNX engine artifacts loaded"
        );

        Ok(LoadedEngine {
            model: Box::new(OnnxVisionTextModel {
                image_session: Mutex::new(image_session),
                text_session: Mutex::new(text_session),
                logit_scale: config.scale(),
            }),
            preprocessor: config.preprocess,
            tokenizer: Box::new(tokenizer),
        })
    }
}

fn open_session(path: &Path) -> Result<Session, String> {
    Session::builder()
        .map_err(|e: ort::Error| e.to_string())?
        .with_intra_threads(2)
        .map_err(|e: ort::Error| e.to_string())?
        .commit_from_file(path)
        .map_err(|e: ort::Error| format!("ONNX load failed for {}: {e}", path.display()))
}

// ═══════════════════════════════════════════════════════════
// Model
// ═══════════════════════════════════════════════════════════

pub struct OnnxVisionTextModel {
    image_session: Mutex<Session>,
    text_session: Mutex<Session>,
    logit_scale: f32,
}

impl VisionTextModel for OnnxVisionTextModel {
    fn encode_image(&self, pixels: &Array4<f32>) -> Result<Vec<f32>, EngineError> {
        let tensor = TensorRef::from_array_view(pixels)
            .map_err(|e| EngineError::Inference(e.to_string()))?;

        let mut session = self
            .image_session
            .lock()
            .map_err(|_| EngineError::Inference("Image session lock poisoned".to_string()))?;
        let outputs = session
            .run(ort::inputs![tensor])
            .map_err(|e| EngineError::Inference(format!("Image encoder failed: {e}")))?;

        let (shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EngineError::Inference(format!("Output extraction: {e}")))?;
        let mut rows = split_rows(&shape[..], data, 1)?;
        rows.pop()
            .ok_or_else(|| EngineError::Inference("Image encoder returned no rows".to_string()))
    }

    fn encode_text(&self, tokens: &TokenBatch) -> Result<Vec<Vec<f32>>, EngineError> {
        let ids = TensorRef::from_array_view(&tokens.input_ids)
            .map_err(|e| EngineError::Inference(e.to_string()))?;
        let mask = TensorRef::from_array_view(&tokens.attention_mask)
            .map_err(|e| EngineError::Inference(e.to_string()))?;

        let mut session = self
            .text_session
            .lock()
            .map_err(|_| EngineError::Inference("Text session lock poisoned".to_string()))?;
        let outputs = session
            .run(ort::inputs![ids, mask])
            .map_err(|e| EngineError::Inference(format!("Text encoder failed: {e}")))?;

        let (shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EngineError::Inference(format!("Output extraction: {e}")))?;
        split_rows(&shape[..], data, tokens.batch_size())
    }

    fn logit_scale(&self) -> f32 {
        self.logit_scale
    }
}

/// Split a `[rows, D]` encoder output into one vector per row.
fn split_rows(shape: &[i64], data: &[f32], rows: usize) -> Result<Vec<Vec<f32>>, EngineError> {
    let (actual_rows, dim) = match shape {
        [r, d] if *r >= 0 && *d > 0 => (*r as usize, *d as usize),
        _ => {
            return Err(EngineError::Inference(format!(
                "Unexpected embedding shape: {shape:?}, expected [{rows}, D] with D > 0"
            )))
        }
    };
    if actual_rows != rows || data.len() != rows * dim {
        return Err(EngineError::Inference(format!(
            "Unexpected embedding shape: {shape:?} ({} values), expected [{rows}, D]",
            data.len()
        )));
    }
    Ok(data.chunks(dim).map(<[f32]>::to_vec).collect())
}

// ═══════════════════════════════════════════════════════════
// Tokenizer
// ═══════════════════════════════════════════════════════════

/// HuggingFace tokenizer with two configurations: strict (pad to the
/// longest prompt, no truncation) and lenient (truncate + pad to context).
pub struct HfTokenizer {
    strict: Tokenizer,
    lenient: Tokenizer,
    context_length: usize,
}

impl HfTokenizer {
    pub fn from_file(path: &Path, context_length: usize) -> Result<Self, EngineError> {
        let load = || {
            Tokenizer::from_file(path)
                .map_err(|e| EngineError::Tokenization(format!("Tokenizer load failed: {e}")))
        };

        let mut strict = load()?;
        strict
            .with_truncation(None)
            .map_err(|e| EngineError::Tokenization(e.to_string()))?;
        strict.with_padding(Some(PaddingParams {
            strategy: PaddingStrategy::BatchLongest,
            ..PaddingParams::default()
        }));

        let mut lenient = load()?;
        lenient
            .with_truncation(Some(TruncationParams {
                max_length: context_length,
                ..TruncationParams::default()
            }))
            .map_err(|e| EngineError::Tokenization(e.to_string()))?;
        lenient.with_padding(Some(PaddingParams {
            strategy: PaddingStrategy::Fixed(context_length),
            ..PaddingParams::default()
        }));

        Ok(Self {
            strict,
            lenient,
            context_length,
        })
    }

    fn encode_with(tokenizer: &Tokenizer, texts: &[String]) -> Result<TokenBatch, EngineError> {
        let encodings = tokenizer
            .encode_batch(texts.to_vec(), true)
            .map_err(|e| EngineError::Tokenization(e.to_string()))?;

        let rows = encodings.len();
        let seq_len = encodings.first().map(|e| e.get_ids().len()).unwrap_or(0);
        let mut input_ids = Array2::<i64>::zeros((rows, seq_len));
        let mut attention_mask = Array2::<i64>::zeros((rows, seq_len));
        for (r, encoding) in encodings.iter().enumerate() {
            if encoding.get_ids().len() != seq_len {
                return Err(EngineError::Tokenization(
                    "ragged batch after padding".to_string(),
                ));
            }
            for (c, (&id, &m)) in encoding
                .get_ids()
                .iter()
                .zip(encoding.get_attention_mask())
                .enumerate()
            {
                input_ids[[r, c]] = i64::from(id);
                attention_mask[[r, c]] = i64::from(m);
            }
        }
        Ok(TokenBatch {
            input_ids,
            attention_mask,
        })
    }
}

impl TextTokenizer for HfTokenizer {
    fn encode_batch(&self, texts: &[String]) -> Result<TokenBatch, EngineError> {
        let batch = Self::encode_with(&self.strict, texts)?;
        if batch.seq_len() > self.context_length {
            return Err(EngineError::Tokenization(format!(
                "prompt of {} tokens exceeds context window of {}",
                batch.seq_len(),
                self.context_length
            )));
        }
        Ok(batch)
    }

    fn encode_batch_truncated(&self, texts: &[String]) -> Result<TokenBatch, EngineError> {
        Self::encode_with(&self.lenient, texts)
    }

    fn context_length(&self) -> usize {
        self.context_length
    }
}
