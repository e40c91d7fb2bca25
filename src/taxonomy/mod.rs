//! Taxonomy Store: immutable bank of diagnostic descriptions.
//!
//! A taxonomy is an ordered list of categories, each holding an ordered
//! list of diagnosis records. The English prompt of every record is what
//! gets embedded; the remaining fields are display metadata handed back
//! to callers untouched.
//!
//! Stores are built once (from JSON or from in-memory records), validated,
//! and then shared read-only behind an `Arc` by every concurrent request.

pub mod builtin;

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ═══════════════════════════════════════════════════════════
// Errors
// ═══════════════════════════════════════════════════════════

#[derive(Error, Debug)]
pub enum TaxonomyError {
    #[error("Category not found: '{key}'. Available: [{}]", .available.join(", "))]
    CategoryNotFound { key: String, available: Vec<String> },

    #[error("Duplicate identifier in taxonomy: '{0}'")]
    DuplicateIdentifier(String),

    #[error("Diagnosis '{0}' has an empty prompt")]
    EmptyPrompt(String),

    #[error("Category '{0}' has no diagnoses")]
    EmptyCategory(String),

    #[error("Diagnosis '{id}' attribute '{key}' must be a string or a number")]
    UnsupportedExtraValue { id: String, key: String },

    #[error("Taxonomy parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

// ═══════════════════════════════════════════════════════════
// Types
// ═══════════════════════════════════════════════════════════

/// Category-specific attribute value (timing, mechanism, depth, …).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExtraValue {
    Text(String),
    /// Kept as parsed so integers stay integers on output.
    Number(serde_json::Number),
}

impl ExtraValue {
    fn from_json(value: serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::String(s) => Some(Self::Text(s)),
            serde_json::Value::Number(n) => Some(Self::Number(n)),
            _ => None,
        }
    }

    fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Text(s) => serde_json::Value::String(s.clone()),
            Self::Number(n) => serde_json::Value::Number(n.clone()),
        }
    }
}

/// One candidate diagnosis.
#[derive(Debug, Clone, PartialEq)]
pub struct DiagnosisRecord {
    /// Unique across the whole taxonomy.
    pub id: String,
    /// English description fed to the text encoder.
    pub prompt: String,
    /// Localized display name.
    pub display_name: String,
    pub description: String,
    pub findings: Vec<String>,
    /// Extra attributes in declaration order.
    pub extra: Vec<(String, ExtraValue)>,
}

impl DiagnosisRecord {
    pub fn new(
        id: impl Into<String>,
        prompt: impl Into<String>,
        display_name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            prompt: prompt.into(),
            display_name: display_name.into(),
            description: description.into(),
            findings: Vec::new(),
            extra: Vec::new(),
        }
    }

    pub fn with_findings(mut self, findings: &[&str]) -> Self {
        self.findings = findings.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn with_extra(mut self, key: &str, value: ExtraValue) -> Self {
        self.extra.push((key.to_string(), value));
        self
    }

    /// Look up an extra attribute by key.
    pub fn extra_value(&self, key: &str) -> Option<&ExtraValue> {
        self.extra.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Extra attributes as an ordered JSON object.
    pub fn extra_map(&self) -> serde_json::Map<String, serde_json::Value> {
        self.extra
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect()
    }
}

/// A named group of diagnoses (organ, injury mechanism, modality).
#[derive(Debug, Clone, PartialEq)]
pub struct Category {
    pub id: String,
    pub display_name: String,
    pub description: String,
    pub diagnoses: Vec<DiagnosisRecord>,
}

/// A diagnosis together with the category that owns it.
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub category: &'a Category,
    pub record: &'a DiagnosisRecord,
}

// ═══════════════════════════════════════════════════════════
// JSON shape
// ═══════════════════════════════════════════════════════════

#[derive(Deserialize)]
struct RawCategory {
    id: String,
    display_name: String,
    #[serde(default)]
    description: String,
    diagnoses: Vec<RawDiagnosis>,
}

#[derive(Deserialize)]
struct RawDiagnosis {
    id: String,
    prompt: String,
    display_name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    findings: Vec<String>,
    #[serde(default)]
    extra: serde_json::Map<String, serde_json::Value>,
}

impl RawDiagnosis {
    fn into_record(self) -> Result<DiagnosisRecord, TaxonomyError> {
        let mut extra = Vec::with_capacity(self.extra.len());
        for (key, value) in self.extra {
            let value = ExtraValue::from_json(value).ok_or_else(|| {
                TaxonomyError::UnsupportedExtraValue {
                    id: self.id.clone(),
                    key: key.clone(),
                }
            })?;
            extra.push((key, value));
        }
        Ok(DiagnosisRecord {
            id: self.id,
            prompt: self.prompt,
            display_name: self.display_name,
            description: self.description,
            findings: self.findings,
            extra,
        })
    }
}

// ═══════════════════════════════════════════════════════════
// TaxonomyStore
// ═══════════════════════════════════════════════════════════

/// Validated, immutable taxonomy.
#[derive(Debug)]
pub struct TaxonomyStore {
    categories: Vec<Category>,
    by_key: HashMap<String, usize>,
}

impl TaxonomyStore {
    /// Build a store from in-memory categories.
    ///
    /// Category keys and diagnosis identifiers must be unique across the
    /// whole taxonomy, every category must be non-empty and every prompt
    /// must contain text.
    pub fn from_categories(categories: Vec<Category>) -> Result<Self, TaxonomyError> {
        let mut by_key = HashMap::with_capacity(categories.len());
        let mut seen_ids = HashSet::new();

        for (idx, category) in categories.iter().enumerate() {
            if by_key.insert(category.id.clone(), idx).is_some() {
                return Err(TaxonomyError::DuplicateIdentifier(category.id.clone()));
            }
            if category.diagnoses.is_empty() {
                return Err(TaxonomyError::EmptyCategory(category.id.clone()));
            }
            for record in &category.diagnoses {
                if !seen_ids.insert(record.id.as_str()) {
                    return Err(TaxonomyError::DuplicateIdentifier(record.id.clone()));
                }
                if record.prompt.trim().is_empty() {
                    return Err(TaxonomyError::EmptyPrompt(record.id.clone()));
                }
            }
        }

        Ok(Self { categories, by_key })
    }

    /// Parse and validate a JSON taxonomy (array of categories).
    pub fn from_json(json: &str) -> Result<Self, TaxonomyError> {
        let raw: Vec<RawCategory> = serde_json::from_str(json)?;
        let categories = raw
            .into_iter()
            .map(|c| {
                let diagnoses = c
                    .diagnoses
                    .into_iter()
                    .map(RawDiagnosis::into_record)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Category {
                    id: c.id,
                    display_name: c.display_name,
                    description: c.description,
                    diagnoses,
                })
            })
            .collect::<Result<Vec<_>, TaxonomyError>>()?;
        Self::from_categories(categories)
    }

    /// All categories in declaration order.
    pub fn categories(&self) -> &[Category] {
        &self.categories
    }

    /// Category keys in declaration order.
    pub fn category_keys(&self) -> Vec<String> {
        self.categories.iter().map(|c| c.id.clone()).collect()
    }

    pub fn category_count(&self) -> usize {
        self.categories.len()
    }

    /// Total number of diagnoses across all categories.
    pub fn diagnosis_count(&self) -> usize {
        self.categories.iter().map(|c| c.diagnoses.len()).sum()
    }

    /// Look up a category by key.
    pub fn category(&self, key: &str) -> Result<&Category, TaxonomyError> {
        self.by_key
            .get(key)
            .map(|&idx| &self.categories[idx])
            .ok_or_else(|| TaxonomyError::CategoryNotFound {
                key: key.to_string(),
                available: self.category_keys(),
            })
    }

    /// Candidate diagnoses, optionally restricted to one category.
    ///
    /// Order is category declaration order, then diagnosis order; the
    /// scoring engine uses this order to break probability ties.
    pub fn candidates(&self, filter: Option<&str>) -> Result<Vec<Candidate<'_>>, TaxonomyError> {
        let selected: Vec<&Category> = match filter {
            Some(key) => vec![self.category(key)?],
            None => self.categories.iter().collect(),
        };

        Ok(selected
            .into_iter()
            .flat_map(|category| {
                category
                    .diagnoses
                    .iter()
                    .map(move |record| Candidate { category, record })
            })
            .collect())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Small two-category store used across the crate's tests.
    pub(crate) fn sample_store() -> TaxonomyStore {
        TaxonomyStore::from_categories(vec![
            Category {
                id: "contusiones".into(),
                display_name: "Lesiones contusas".into(),
                description: "Datación de contusiones".into(),
                diagnoses: vec![
                    DiagnosisRecord::new(
                        "contusion_reciente",
                        "recent bruise with early neutrophil infiltration",
                        "Contusión reciente",
                        "Infiltrado neutrofílico temprano",
                    )
                    .with_findings(&["Neutrófilos", "Edema"])
                    .with_extra("tiempo_estimado", ExtraValue::Text("4-24 horas".into())),
                    DiagnosisRecord::new(
                        "contusion_antigua",
                        "old healed bruise with residual hemosiderin",
                        "Contusión antigua",
                        "Hemosiderina residual",
                    ),
                ],
            },
            Category {
                id: "corazon".into(),
                display_name: "Patología cardíaca".into(),
                description: "Muerte súbita cardíaca".into(),
                diagnoses: vec![DiagnosisRecord::new(
                    "infarto_agudo",
                    "acute myocardial infarction with contraction band necrosis",
                    "Infarto agudo de miocardio",
                    "Necrosis en bandas de contracción",
                )
                .with_extra("severidad", ExtraValue::Number(3.into()))],
            },
        ])
        .unwrap()
    }

    #[test]
    fn candidates_without_filter_cover_all_categories_in_order() {
        let store = sample_store();
        let ids: Vec<&str> = store
            .candidates(None)
            .unwrap()
            .iter()
            .map(|c| c.record.id.as_str())
            .collect();
        assert_eq!(ids, vec!["contusion_reciente", "contusion_antigua", "infarto_agudo"]);
    }

    #[test]
    fn candidates_with_filter_restrict_to_category() {
        let store = sample_store();
        let candidates = store.candidates(Some("corazon")).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].category.display_name, "Patología cardíaca");
    }

    #[test]
    fn unknown_filter_lists_valid_keys() {
        let store = sample_store();
        let err = store.candidates(Some("rodilla")).unwrap_err();
        match &err {
            TaxonomyError::CategoryNotFound { key, available } => {
                assert_eq!(key, "rodilla");
                assert_eq!(available, &vec!["contusiones".to_string(), "corazon".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
        let message = err.to_string();
        assert!(message.contains("contusiones"));
        assert!(message.contains("corazon"));
    }

    #[test]
    fn duplicate_diagnosis_ids_across_categories_rejected() {
        let record = DiagnosisRecord::new("dup", "prompt", "Dup", "");
        let result = TaxonomyStore::from_categories(vec![
            Category {
                id: "a".into(),
                display_name: "A".into(),
                description: String::new(),
                diagnoses: vec![record.clone()],
            },
            Category {
                id: "b".into(),
                display_name: "B".into(),
                description: String::new(),
                diagnoses: vec![record],
            },
        ]);
        assert!(matches!(result, Err(TaxonomyError::DuplicateIdentifier(id)) if id == "dup"));
    }

    #[test]
    fn empty_prompt_rejected() {
        let result = TaxonomyStore::from_categories(vec![Category {
            id: "a".into(),
            display_name: "A".into(),
            description: String::new(),
            diagnoses: vec![DiagnosisRecord::new("x", "   ", "X", "")],
        }]);
        assert!(matches!(result, Err(TaxonomyError::EmptyPrompt(_))));
    }

    #[test]
    fn empty_category_rejected() {
        let result = TaxonomyStore::from_categories(vec![Category {
            id: "a".into(),
            display_name: "A".into(),
            description: String::new(),
            diagnoses: vec![],
        }]);
        assert!(matches!(result, Err(TaxonomyError::EmptyCategory(_))));
    }

    #[test]
    fn json_extra_attributes_keep_declaration_order() {
        let json = r#"[{
            "id": "piel",
            "display_name": "Piel",
            "diagnoses": [{
                "id": "mordedura",
                "prompt": "human bite mark",
                "display_name": "Mordedura",
                "extra": {"mecanismo": "Dental", "antiguedad_horas": 12, "relevancia_forense": "Alta"}
            }]
        }]"#;
        let store = TaxonomyStore::from_json(json).unwrap();
        let record = &store.categories()[0].diagnoses[0];
        let keys: Vec<&str> = record.extra.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["mecanismo", "antiguedad_horas", "relevancia_forense"]);
        assert_eq!(
            record.extra_value("antiguedad_horas"),
            Some(&ExtraValue::Number(12.into()))
        );
        assert!(record.findings.is_empty());
    }

    #[test]
    fn numeric_extra_values_keep_their_form() {
        let json = r#"[{
            "id": "piel",
            "display_name": "Piel",
            "diagnoses": [{
                "id": "mordedura",
                "prompt": "human bite mark",
                "display_name": "Mordedura",
                "extra": {"antiguedad_horas": 12, "profundidad_cm": 1.5}
            }]
        }]"#;
        let store = TaxonomyStore::from_json(json).unwrap();
        let map = store.categories()[0].diagnoses[0].extra_map();
        assert_eq!(serde_json::to_string(&map).unwrap(), r#"{"antiguedad_horas":12,"profundidad_cm":1.5}"#);
    }

    #[test]
    fn json_nested_extra_value_rejected() {
        let json = r#"[{
            "id": "piel",
            "display_name": "Piel",
            "diagnoses": [{
                "id": "mordedura",
                "prompt": "human bite mark",
                "display_name": "Mordedura",
                "extra": {"detalle": {"nested": true}}
            }]
        }]"#;
        let err = TaxonomyStore::from_json(json).unwrap_err();
        assert!(matches!(err, TaxonomyError::UnsupportedExtraValue { .. }));
    }

    #[test]
    fn malformed_json_is_parse_error() {
        let err = TaxonomyStore::from_json("{not json").unwrap_err();
        assert!(matches!(err, TaxonomyError::Parse(_)));
    }

    #[test]
    fn counts_reflect_contents() {
        let store = sample_store();
        assert_eq!(store.category_count(), 2);
        assert_eq!(store.diagnosis_count(), 3);
    }

    #[test]
    fn extra_map_serializes_numbers_and_text() {
        let store = sample_store();
        let heart = &store.category("corazon").unwrap().diagnoses[0];
        let map = heart.extra_map();
        assert_eq!(map["severidad"], serde_json::json!(3));
    }
}
