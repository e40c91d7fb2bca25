//! Built-in diagnostic tables shipped with the binary.

use super::{TaxonomyError, TaxonomyStore};

const FORENSIC_HISTOPATHOLOGY_JSON: &str =
    include_str!("../../data/forensic_histopathology.json");
const CHEST_RADIOGRAPH_JSON: &str = include_str!("../../data/chest_radiograph.json");

/// Forensic histopathology taxonomy (contusions, wounds, asphyxia, organs…).
pub fn forensic_histopathology() -> Result<TaxonomyStore, TaxonomyError> {
    TaxonomyStore::from_json(FORENSIC_HISTOPATHOLOGY_JSON)
}

/// Chest radiograph taxonomy.
pub fn chest_radiograph() -> Result<TaxonomyStore, TaxonomyError> {
    TaxonomyStore::from_json(CHEST_RADIOGRAPH_JSON)
}
