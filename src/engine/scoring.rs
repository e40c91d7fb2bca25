//! Zero-shot scoring: image vs. candidate prompts.
//!
//! 1. Ensure the engine is loaded, then lease it
//! 2. Decode + normalize the image
//! 3. Prefix every prompt with the modality template and tokenize
//!    (strict first, truncated on failure)
//! 4. Encode image once and all prompts in one batch
//! 5. L2-normalize, dot product × logit scale, softmax
//! 6. Rank descending (stable on ties)

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{EngineError, LoadedEngine, ModelRegistry, TokenBatch};

/// One candidate's probability, by position in the submitted prompt list.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredIndex {
    pub index: usize,
    pub probability: f32,
}

/// Output of one scoring call.
#[derive(Debug, Clone)]
pub struct ScoreOutcome {
    /// Every candidate, most probable first. Probabilities sum to 1.
    pub ranking: Vec<ScoredIndex>,
    pub image_width: u32,
    pub image_height: u32,
    /// Encoder passes plus similarity and softmax. Excludes model load,
    /// image decoding and tokenization.
    pub inference_time: Duration,
    /// Whether the truncated tokenization path was needed.
    pub tokenizer_fallback: bool,
}

#[derive(Debug, Clone)]
pub struct ScoringEngine {
    registry: Arc<ModelRegistry>,
}

impl ScoringEngine {
    pub fn new(registry: Arc<ModelRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    /// Score `image_bytes` against `prompts` with engine `engine_name`.
    ///
    /// Blocking (model inference). Call from `spawn_blocking` in async code.
    pub fn score(
        &self,
        engine_name: &str,
        image_bytes: &[u8],
        prompts: &[&str],
    ) -> Result<ScoreOutcome, EngineError> {
        if prompts.is_empty() {
            return Err(EngineError::NoCandidates);
        }

        self.registry
            .ensure_loaded(engine_name)
            .map_err(|e| match e {
                EngineError::ModelLoad { engine, reason } => {
                    EngineError::ModelUnavailable { engine, reason }
                }
                other => other,
            })?;
        let lease = self.registry.lease(engine_name)?;
        let engine = lease.engine();

        let image = engine.preprocessor.prepare(image_bytes)?;

        let template = lease.spec().modality.prompt_template();
        let texts: Vec<String> = prompts.iter().map(|p| format!("{template}{p}")).collect();
        let (tokens, tokenizer_fallback) = tokenize_with_fallback(engine, &texts)?;

        let started = Instant::now();
        let image_embedding = engine.model.encode_image(&image.pixels)?;
        let text_embeddings = engine.model.encode_text(&tokens)?;
        if text_embeddings.len() != prompts.len() {
            return Err(EngineError::Inference(format!(
                "text encoder returned {} embeddings for {} prompts",
                text_embeddings.len(),
                prompts.len()
            )));
        }

        let probabilities = similarity_probabilities(
            &image_embedding,
            &text_embeddings,
            engine.model.logit_scale(),
        )?;
        let inference_time = started.elapsed();
        let ranking = rank_descending(&probabilities);

        tracing::debug!(
            engine = %engine_name,
            candidates = prompts.len(),
            fallback = tokenizer_fallback,
            elapsed_ms = inference_time.as_millis() as u64,
            "Scoring complete"
        );

        Ok(ScoreOutcome {
            ranking,
            image_width: image.width,
            image_height: image.height,
            inference_time,
            tokenizer_fallback,
        })
    }
}

/// Strict tokenization, falling back to truncation. Both failing is a
/// `Tokenization` error.
fn tokenize_with_fallback(
    engine: &LoadedEngine,
    texts: &[String],
) -> Result<(TokenBatch, bool), EngineError> {
    let strict = engine
        .tokenizer
        .encode_batch(texts)
        .and_then(|batch| validate_batch(batch, texts.len(), engine.tokenizer.context_length()));

    match strict {
        Ok(batch) => Ok((batch, false)),
        Err(first) => {
            tracing::warn!(error = %first, "Strict tokenization failed, retrying with truncation");
            let batch = engine
                .tokenizer
                .encode_batch_truncated(texts)
                .and_then(|batch| {
                    validate_batch(batch, texts.len(), engine.tokenizer.context_length())
                })
                .map_err(|second| {
                    EngineError::Tokenization(format!("{first}; truncated retry: {second}"))
                })?;
            Ok((batch, true))
        }
    }
}

fn validate_batch(
    batch: TokenBatch,
    expected_rows: usize,
    context_length: usize,
) -> Result<TokenBatch, EngineError> {
    if batch.batch_size() != expected_rows {
        return Err(EngineError::Tokenization(format!(
            "expected {expected_rows} rows, got {}",
            batch.batch_size()
        )));
    }
    if batch.seq_len() > context_length {
        return Err(EngineError::Tokenization(format!(
            "sequence length {} exceeds context window of {context_length}",
            batch.seq_len()
        )));
    }
    Ok(batch)
}

// ═══════════════════════════════════════════════════════════
// Math
// ═══════════════════════════════════════════════════════════

fn similarity_probabilities(
    image: &[f32],
    texts: &[Vec<f32>],
    logit_scale: f32,
) -> Result<Vec<f32>, EngineError> {
    let image = l2_normalize(image);
    let logits = texts
        .iter()
        .map(|text| {
            if text.len() != image.len() {
                return Err(EngineError::Inference(format!(
                    "embedding dimension mismatch: image {} vs text {}",
                    image.len(),
                    text.len()
                )));
            }
            let text = l2_normalize(text);
            let dot: f32 = image.iter().zip(&text).map(|(a, b)| a * b).sum();
            Ok(dot * logit_scale)
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(softmax(&logits))
}

/// Unit-length copy of `v`. A zero vector stays zero.
pub(crate) fn l2_normalize(v: &[f32]) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        v.iter().map(|x| x / norm).collect()
    } else {
        v.to_vec()
    }
}

/// Numerically stable softmax (max-subtracted).
pub(crate) fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|l| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// Indices sorted by probability, descending. Ties keep submission order.
pub(crate) fn rank_descending(probabilities: &[f32]) -> Vec<ScoredIndex> {
    let mut ranking: Vec<ScoredIndex> = probabilities
        .iter()
        .enumerate()
        .map(|(index, &probability)| ScoredIndex { index, probability })
        .collect();
    ranking.sort_by(|a, b| b.probability.total_cmp(&a.probability));
    ranking
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::{MockLoader, MockTokenizer, MockVisionTextModel};
    use crate::engine::preprocess::tests::png_bytes;
    use crate::engine::{
        EngineSpec, ImagePreprocessor, ModelLoader, TextTokenizer, PRIMARY_ENGINE,
        RADIOGRAPH_ENGINE,
    };
    use std::sync::Mutex;

    fn scoring() -> ScoringEngine {
        let registry =
            ModelRegistry::with_default_engines(Box::new(MockLoader::new())).unwrap();
        ScoringEngine::new(Arc::new(registry))
    }

    /// Loader whose tokenizer has a tiny window so strict encoding fails.
    struct NarrowLoader;

    impl ModelLoader for NarrowLoader {
        fn load(&self, _spec: &EngineSpec) -> Result<LoadedEngine, EngineError> {
            Ok(LoadedEngine {
                model: Box::new(MockVisionTextModel::new()),
                preprocessor: ImagePreprocessor::default(),
                tokenizer: Box::new(MockTokenizer::new(6)),
            })
        }
    }

    /// Tokenizer that remembers every text it was asked to encode.
    struct RecordingTokenizer {
        inner: MockTokenizer,
        seen: Arc<Mutex<Vec<String>>>,
    }

    impl TextTokenizer for RecordingTokenizer {
        fn encode_batch(&self, texts: &[String]) -> Result<TokenBatch, EngineError> {
            self.seen.lock().unwrap().extend(texts.iter().cloned());
            self.inner.encode_batch(texts)
        }

        fn encode_batch_truncated(&self, texts: &[String]) -> Result<TokenBatch, EngineError> {
            self.inner.encode_batch_truncated(texts)
        }

        fn context_length(&self) -> usize {
            self.inner.context_length()
        }
    }

    struct RecordingLoader {
        seen: Arc<Mutex<Vec<String>>>,
    }

    impl ModelLoader for RecordingLoader {
        fn load(&self, _spec: &EngineSpec) -> Result<LoadedEngine, EngineError> {
            Ok(LoadedEngine {
                model: Box::new(MockVisionTextModel::new()),
                preprocessor: ImagePreprocessor::default(),
                tokenizer: Box::new(RecordingTokenizer {
                    inner: MockTokenizer::default(),
                    seen: self.seen.clone(),
                }),
            })
        }
    }

    #[test]
    fn modality_template_prefixes_every_prompt() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let registry = ModelRegistry::with_default_engines(Box::new(RecordingLoader {
            seen: seen.clone(),
        }))
        .unwrap();
        let scoring = ScoringEngine::new(Arc::new(registry));
        let image = png_bytes(16, 16, [120, 40, 60]);

        scoring
            .score(PRIMARY_ENGINE, &image, &["fresh bruise", "old scar"])
            .unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                "this is a histopathology image showing fresh bruise".to_string(),
                "this is a histopathology image showing old scar".to_string(),
            ]
        );

        seen.lock().unwrap().clear();
        scoring
            .score(RADIOGRAPH_ENGINE, &image, &["pleural effusion"])
            .unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["chest x-ray with pleural effusion".to_string()]
        );
    }

    #[test]
    fn inference_time_excludes_model_load() {
        let load_delay = Duration::from_millis(400);
        let registry = ModelRegistry::with_default_engines(Box::new(
            MockLoader::new().with_delay(load_delay),
        ))
        .unwrap();
        let outcome = ScoringEngine::new(Arc::new(registry))
            .score(PRIMARY_ENGINE, &png_bytes(32, 32, [5, 5, 5]), &["a", "b"])
            .unwrap();
        assert!(
            outcome.inference_time < load_delay,
            "inference_time = {:?}",
            outcome.inference_time
        );
    }

    #[test]
    fn probabilities_sum_to_one_and_cover_every_prompt() {
        let prompts = ["fresh bruise", "old scar", "normal skin", "burn"];
        let outcome = scoring()
            .score(PRIMARY_ENGINE, &png_bytes(64, 48, [180, 60, 90]), &prompts)
            .unwrap();

        let sum: f32 = outcome.ranking.iter().map(|s| s.probability).sum();
        assert!((sum - 1.0).abs() < 1e-4, "sum = {sum}");

        let mut indices: Vec<usize> = outcome.ranking.iter().map(|s| s.index).collect();
        indices.sort_unstable();
        assert_eq!(indices, vec![0, 1, 2, 3]);

        for pair in outcome.ranking.windows(2) {
            assert!(pair[0].probability >= pair[1].probability);
        }
        assert_eq!((outcome.image_width, outcome.image_height), (64, 48));
        assert!(!outcome.tokenizer_fallback);
    }

    #[test]
    fn single_candidate_gets_full_probability() {
        let outcome = scoring()
            .score(PRIMARY_ENGINE, &png_bytes(32, 32, [0, 0, 0]), &["anything"])
            .unwrap();
        assert_eq!(outcome.ranking.len(), 1);
        assert!((outcome.ranking[0].probability - 1.0).abs() < 1e-6);
    }

    #[test]
    fn invalid_image_is_reported() {
        let err = scoring()
            .score(PRIMARY_ENGINE, b"definitely not a png", &["a"])
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidImage(_)));
    }

    #[test]
    fn empty_prompt_list_rejected() {
        let err = scoring()
            .score(PRIMARY_ENGINE, &png_bytes(8, 8, [1, 1, 1]), &[])
            .unwrap_err();
        assert!(matches!(err, EngineError::NoCandidates));
    }

    #[test]
    fn load_failure_surfaces_as_unavailable() {
        let registry = ModelRegistry::with_default_engines(Box::new(
            MockLoader::new().failing("weights missing"),
        ))
        .unwrap();
        let err = ScoringEngine::new(Arc::new(registry))
            .score(PRIMARY_ENGINE, &png_bytes(8, 8, [1, 1, 1]), &["a"])
            .unwrap_err();
        assert!(matches!(err, EngineError::ModelUnavailable { .. }));
    }

    #[test]
    fn truncated_path_used_when_strict_fails() {
        let registry = ModelRegistry::with_default_engines(Box::new(NarrowLoader)).unwrap();
        let outcome = ScoringEngine::new(Arc::new(registry))
            .score(
                PRIMARY_ENGINE,
                &png_bytes(16, 16, [9, 9, 9]),
                &["a very long description of a lesion", "short"],
            )
            .unwrap();
        assert!(outcome.tokenizer_fallback);
        assert_eq!(outcome.ranking.len(), 2);
    }

    #[test]
    fn both_tokenization_paths_failing_is_tokenization_error() {
        let err = scoring()
            .score(PRIMARY_ENGINE, &png_bytes(16, 16, [9, 9, 9]), &["nul\0here"])
            .unwrap_err();
        assert!(matches!(err, EngineError::Tokenization(_)));
    }

    #[test]
    fn softmax_is_shift_invariant() {
        let a = softmax(&[1.0, 2.0, 3.0]);
        let b = softmax(&[1001.0, 1002.0, 1003.0]);
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-6);
        }
    }

    #[test]
    fn ties_keep_submission_order() {
        let ranking = rank_descending(&[0.2, 0.4, 0.2, 0.2]);
        let order: Vec<usize> = ranking.iter().map(|s| s.index).collect();
        assert_eq!(order, vec![1, 0, 2, 3]);
    }

    #[test]
    fn l2_normalize_unit_length() {
        let v = l2_normalize(&[3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
        assert_eq!(l2_normalize(&[0.0, 0.0]), vec![0.0, 0.0]);
    }
}
