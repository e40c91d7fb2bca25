//! Deterministic in-process engine: no artifacts, no network.
//!
//! Used by the test-suite and by `PATHOLENS_BACKEND=mock` deployments
//! (UI development, smoke tests). Embeddings are hash-derived, so scores
//! are stable across runs but carry no diagnostic meaning.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use ndarray::{Array2, Array4};

use super::{
    EngineError, EngineSpec, ImagePreprocessor, LoadedEngine, ModelLoader, TextTokenizer,
    TokenBatch, VisionTextModel,
};

/// Embedding width of the mock model.
pub const MOCK_EMBEDDING_DIM: usize = 64;
/// Context window of the mock tokenizer (special tokens included).
pub const MOCK_CONTEXT_LENGTH: usize = 32;
/// exp(4.6052) ≈ 100, the usual CLIP temperature.
pub const MOCK_LOGIT_SCALE: f32 = 100.0;

const CLS_ID: i64 = 2;
const SEP_ID: i64 = 3;
const PAD_ID: i64 = 0;

// ═══════════════════════════════════════════════════════════
// Tokenizer
// ═══════════════════════════════════════════════════════════

/// Whitespace tokenizer with a fixed context window.
///
/// NUL characters are outside the vocabulary: both paths reject them.
#[derive(Debug, Clone)]
pub struct MockTokenizer {
    context_length: usize,
}

impl MockTokenizer {
    pub fn new(context_length: usize) -> Self {
        Self { context_length }
    }

    fn token_ids(text: &str) -> Result<Vec<i64>, EngineError> {
        if text.contains('\0') {
            return Err(EngineError::Tokenization(
                "unsupported token (NUL) in prompt".to_string(),
            ));
        }
        let mut ids = vec![CLS_ID];
        ids.extend(text.split_whitespace().map(word_id));
        ids.push(SEP_ID);
        Ok(ids)
    }

    fn pack(rows: Vec<Vec<i64>>, seq_len: usize) -> Result<TokenBatch, EngineError> {
        let batch = rows.len();
        let mut input_ids = Array2::<i64>::from_elem((batch, seq_len), PAD_ID);
        let mut attention_mask = Array2::<i64>::zeros((batch, seq_len));
        for (r, row) in rows.iter().enumerate() {
            for (c, &id) in row.iter().enumerate().take(seq_len) {
                input_ids[[r, c]] = id;
                attention_mask[[r, c]] = 1;
            }
        }
        Ok(TokenBatch {
            input_ids,
            attention_mask,
        })
    }
}

impl Default for MockTokenizer {
    fn default() -> Self {
        Self::new(MOCK_CONTEXT_LENGTH)
    }
}

impl TextTokenizer for MockTokenizer {
    fn encode_batch(&self, texts: &[String]) -> Result<TokenBatch, EngineError> {
        let rows = texts
            .iter()
            .map(|t| Self::token_ids(t))
            .collect::<Result<Vec<_>, _>>()?;
        if let Some(longest) = rows.iter().map(Vec::len).max() {
            if longest > self.context_length {
                return Err(EngineError::Tokenization(format!(
                    "prompt of {longest} tokens exceeds context window of {}",
                    self.context_length
                )));
            }
        }
        Self::pack(rows, self.context_length)
    }

    fn encode_batch_truncated(&self, texts: &[String]) -> Result<TokenBatch, EngineError> {
        let rows = texts
            .iter()
            .map(|t| {
                let mut ids = Self::token_ids(t)?;
                if ids.len() > self.context_length {
                    ids.truncate(self.context_length - 1);
                    ids.push(SEP_ID);
                }
                Ok(ids)
            })
            .collect::<Result<Vec<_>, EngineError>>()?;
        Self::pack(rows, self.context_length)
    }

    fn context_length(&self) -> usize {
        self.context_length
    }
}

fn word_id(word: &str) -> i64 {
    // FNV-1a, folded into a small vocabulary above the special ids.
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in word.to_lowercase().bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    (hash % 30_000) as i64 + 10
}

// ═══════════════════════════════════════════════════════════
// Model
// ═══════════════════════════════════════════════════════════

/// Hash-projection "encoder" for images and token batches.
#[derive(Debug, Clone)]
pub struct MockVisionTextModel {
    dimension: usize,
    logit_scale: f32,
}

impl MockVisionTextModel {
    pub fn new() -> Self {
        Self {
            dimension: MOCK_EMBEDDING_DIM,
            logit_scale: MOCK_LOGIT_SCALE,
        }
    }
}

impl Default for MockVisionTextModel {
    fn default() -> Self {
        Self::new()
    }
}

impl VisionTextModel for MockVisionTextModel {
    fn encode_image(&self, pixels: &Array4<f32>) -> Result<Vec<f32>, EngineError> {
        if pixels.is_empty() {
            return Err(EngineError::Inference("empty pixel tensor".to_string()));
        }
        // Per-channel means seed the projection so different images differ.
        let shape = pixels.shape();
        let plane = (shape[2] * shape[3]).max(1) as f32;
        let mut channel_means = [0.0f32; 3];
        for (c, mean) in channel_means.iter_mut().enumerate().take(shape[1].min(3)) {
            *mean = pixels.slice(ndarray::s![0, c, .., ..]).sum() / plane;
        }
        Ok((0..self.dimension)
            .map(|i| {
                let c = i % 3;
                ((i as f32 + 1.0) * 0.37 + channel_means[c]).sin()
            })
            .collect())
    }

    fn encode_text(&self, tokens: &TokenBatch) -> Result<Vec<Vec<f32>>, EngineError> {
        Ok(tokens
            .input_ids
            .rows()
            .into_iter()
            .zip(tokens.attention_mask.rows())
            .map(|(ids, mask)| {
                let mut vec = vec![0.0f32; self.dimension];
                for (pos, (&id, &m)) in ids.iter().zip(mask.iter()).enumerate() {
                    if m == 0 {
                        continue;
                    }
                    let seed = id as f32 * 0.013 + pos as f32 * 0.7;
                    for (i, slot) in vec.iter_mut().enumerate() {
                        *slot += (seed + i as f32 * 0.37).sin();
                    }
                }
                vec
            })
            .collect())
    }

    fn logit_scale(&self) -> f32 {
        self.logit_scale
    }
}

// ═══════════════════════════════════════════════════════════
// Loader
// ═══════════════════════════════════════════════════════════

/// Loader producing mock engines. Counts every physical instantiation.
#[derive(Debug, Default)]
pub struct MockLoader {
    instantiations: AtomicUsize,
    reclaims: AtomicUsize,
    delay: Option<Duration>,
    failure: Mutex<Option<String>>,
}

impl MockLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep for `delay` inside every load (widens race windows in tests).
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Make every load fail with `reason` until [`MockLoader::recover`].
    pub fn failing(self, reason: &str) -> Self {
        if let Ok(mut failure) = self.failure.lock() {
            *failure = Some(reason.to_string());
        }
        self
    }

    /// Clear a configured failure so the next load succeeds.
    pub fn recover(&self) {
        if let Ok(mut failure) = self.failure.lock() {
            *failure = None;
        }
    }

    /// Number of physical model instantiations so far.
    pub fn instantiations(&self) -> usize {
        self.instantiations.load(Ordering::SeqCst)
    }

    /// Number of reclaim passes so far.
    pub fn reclaims(&self) -> usize {
        self.reclaims.load(Ordering::SeqCst)
    }
}

impl ModelLoader for MockLoader {
    fn load(&self, spec: &EngineSpec) -> Result<LoadedEngine, EngineError> {
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        let failure = self.failure.lock().ok().and_then(|f| f.clone());
        if let Some(reason) = failure {
            return Err(EngineError::ModelLoad {
                engine: spec.name.clone(),
                reason,
            });
        }
        self.instantiations.fetch_add(1, Ordering::SeqCst);
        Ok(LoadedEngine {
            model: Box::new(MockVisionTextModel::new()),
            preprocessor: ImagePreprocessor::default(),
            tokenizer: Box::new(MockTokenizer::default()),
        })
    }

    fn reclaim(&self) {
        self.reclaims.fetch_add(1, Ordering::SeqCst);
    }
}

/// Lets tests keep a handle on a loader after handing it to a registry.
impl ModelLoader for std::sync::Arc<MockLoader> {
    fn load(&self, spec: &EngineSpec) -> Result<LoadedEngine, EngineError> {
        (**self).load(spec)
    }

    fn reclaim(&self) {
        (**self).reclaim()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn strict_encoding_pads_to_context() {
        let tok = MockTokenizer::new(8);
        let batch = tok.encode_batch(&texts(&["a b", "c"])).unwrap();
        assert_eq!(batch.batch_size(), 2);
        assert_eq!(batch.seq_len(), 8);
        assert_eq!(batch.attention_mask.row(0).sum(), 4);
        assert_eq!(batch.attention_mask.row(1).sum(), 3);
    }

    #[test]
    fn strict_encoding_rejects_overlong_prompt() {
        let tok = MockTokenizer::new(4);
        let err = tok.encode_batch(&texts(&["one two three four five"])).unwrap_err();
        assert!(matches!(err, EngineError::Tokenization(_)));
    }

    #[test]
    fn truncated_encoding_accepts_overlong_prompt() {
        let tok = MockTokenizer::new(4);
        let batch = tok
            .encode_batch_truncated(&texts(&["one two three four five"]))
            .unwrap();
        assert_eq!(batch.seq_len(), 4);
        assert_eq!(batch.input_ids[[0, 3]], SEP_ID);
    }

    #[test]
    fn nul_rejected_by_both_paths() {
        let tok = MockTokenizer::default();
        let bad = texts(&["bad\0token"]);
        assert!(tok.encode_batch(&bad).is_err());
        assert!(tok.encode_batch_truncated(&bad).is_err());
    }

    #[test]
    fn text_embeddings_are_deterministic_and_distinct() {
        let tok = MockTokenizer::default();
        let model = MockVisionTextModel::new();
        let batch = tok
            .encode_batch(&texts(&["fresh bruise", "old scar", "fresh bruise"]))
            .unwrap();
        let vecs = model.encode_text(&batch).unwrap();
        assert_eq!(vecs.len(), 3);
        assert_eq!(vecs[0], vecs[2]);
        assert_ne!(vecs[0], vecs[1]);
        assert_eq!(vecs[0].len(), MOCK_EMBEDDING_DIM);
    }

    #[test]
    fn loader_counts_instantiations() {
        let loader = MockLoader::new();
        loader.load(&EngineSpec::biomedclip()).unwrap();
        loader.load(&EngineSpec::biomedclip()).unwrap();
        assert_eq!(loader.instantiations(), 2);
    }

    #[test]
    fn failing_loader_recovers() {
        let loader = MockLoader::new().failing("no network");
        let err = loader.load(&EngineSpec::biomedclip()).unwrap_err();
        assert!(err.to_string().contains("no network"));
        assert_eq!(loader.instantiations(), 0);

        loader.recover();
        assert!(loader.load(&EngineSpec::biomedclip()).is_ok());
        assert_eq!(loader.instantiations(), 1);
    }
}
