//! Result ranker: raw probabilities to the caller-facing result.
//!
//! Principal = rank 0, alternatives = ranks 1..=4, confidence from the
//! principal's rounded percentage with strict `>` thresholds.

use serde::Serialize;

use super::AnalysisError;
use crate::engine::ScoreOutcome;
use crate::taxonomy::Candidate;

/// Principal percentage strictly above this is "alta".
pub const HIGH_CONFIDENCE_THRESHOLD: f64 = 50.0;
/// Principal percentage strictly above this is "media".
pub const MEDIUM_CONFIDENCE_THRESHOLD: f64 = 30.0;
/// Maximum number of alternatives reported next to the principal.
pub const MAX_ALTERNATIVES: usize = 4;

/// Discretized confidence of the principal diagnosis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Confidence {
    #[serde(rename = "alta")]
    High,
    #[serde(rename = "media")]
    Medium,
    #[serde(rename = "baja")]
    Low,
}

impl Confidence {
    pub fn from_percentage(percentage: f64) -> Self {
        if percentage > HIGH_CONFIDENCE_THRESHOLD {
            Self::High
        } else if percentage > MEDIUM_CONFIDENCE_THRESHOLD {
            Self::Medium
        } else {
            Self::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "alta",
            Self::Medium => "media",
            Self::Low => "baja",
        }
    }
}

/// One ranked diagnosis as reported to the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagnosisOutcome {
    #[serde(rename = "diagnostico_id")]
    pub id: String,
    #[serde(rename = "diagnostico")]
    pub display_name: String,
    #[serde(rename = "descripcion")]
    pub description: String,
    /// Display name of the owning category.
    #[serde(rename = "organo")]
    pub category: String,
    /// Percentage, rounded to one decimal.
    #[serde(rename = "probabilidad")]
    pub probability: f64,
    #[serde(rename = "hallazgos")]
    pub findings: Vec<String>,
    #[serde(rename = "info_adicional")]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl DiagnosisOutcome {
    fn from_candidate(candidate: &Candidate<'_>, probability: f32) -> Self {
        Self {
            id: candidate.record.id.clone(),
            display_name: candidate.record.display_name.clone(),
            description: candidate.record.description.clone(),
            category: candidate.category.display_name.clone(),
            probability: to_percentage(probability),
            findings: candidate.record.findings.clone(),
            extra: candidate.record.extra_map(),
        }
    }
}

/// Full result of one analysis.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisResult {
    #[serde(rename = "diagnostico_principal")]
    pub principal: DiagnosisOutcome,
    #[serde(rename = "diagnosticos_alternativos")]
    pub alternatives: Vec<DiagnosisOutcome>,
    #[serde(rename = "todos_los_diagnosticos")]
    pub all: Vec<DiagnosisOutcome>,
    #[serde(rename = "confianza")]
    pub confidence: Confidence,
    /// Seconds with two decimals, e.g. `"1.27s"`.
    #[serde(rename = "tiempo_analisis")]
    pub elapsed: String,
    /// `"WxH"` of the decoded upload.
    #[serde(rename = "tamano_imagen")]
    pub image_size: String,
    #[serde(rename = "modelo")]
    pub model: String,
    #[serde(rename = "num_categorias_evaluadas")]
    pub candidates_evaluated: usize,
    #[serde(rename = "tipo_clasificacion", skip_serializing_if = "Option::is_none")]
    pub classification_kind: Option<String>,
    #[serde(rename = "tipo_imagen", skip_serializing_if = "Option::is_none")]
    pub image_kind: Option<String>,
    #[serde(rename = "filtro_categoria", skip_serializing_if = "Option::is_none")]
    pub category_filter: Option<String>,
    #[serde(rename = "modelo_liberado", skip_serializing_if = "Option::is_none")]
    pub model_released: Option<bool>,
}

/// Probability in `[0, 1]` to a one-decimal percentage.
pub fn to_percentage(probability: f32) -> f64 {
    (f64::from(probability) * 1000.0).round() / 10.0
}

/// Build the result from the scored ranking. `candidates` must be in the
/// order the prompts were submitted. The ranking is re-sorted by descending
/// probability (stable, so ties keep their given order).
pub fn rank(
    candidates: &[Candidate<'_>],
    outcome: &ScoreOutcome,
    model: &str,
) -> Result<AnalysisResult, AnalysisError> {
    let mut ranking = outcome.ranking.clone();
    ranking.sort_by(|a, b| b.probability.total_cmp(&a.probability));

    let all = ranking
        .iter()
        .filter_map(|scored| {
            candidates
                .get(scored.index)
                .map(|c| DiagnosisOutcome::from_candidate(c, scored.probability))
        })
        .collect::<Vec<_>>();

    let principal = all.first().cloned().ok_or(AnalysisError::EmptyRanking)?;
    let alternatives = all
        .iter()
        .skip(1)
        .take(MAX_ALTERNATIVES)
        .cloned()
        .collect();

    Ok(AnalysisResult {
        confidence: Confidence::from_percentage(principal.probability),
        principal,
        alternatives,
        candidates_evaluated: candidates.len(),
        all,
        elapsed: format!("{:.2}s", outcome.inference_time.as_secs_f64()),
        image_size: format!("{}x{}", outcome.image_width, outcome.image_height),
        model: model.to_string(),
        classification_kind: None,
        image_kind: None,
        category_filter: None,
        model_released: None,
    })
}
