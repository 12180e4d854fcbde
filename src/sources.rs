/// Source registry for the turbine ingestion service.
///
/// Each CSV export ("data_group_N.csv") is a logical source carrying the
/// readings of a fixed set of turbines. The mapping is declared in the
/// pipeline configuration rather than inferred from file contents, so a row
/// for a turbine that does not belong to its file is reported as an integrity
/// problem instead of being silently attributed.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Source metadata
// ---------------------------------------------------------------------------

/// Declaration of a single CSV source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDeclaration {
    /// File name of the export, e.g. `data_group_1.csv`. Also the cursor key.
    pub id: String,
    /// Turbines whose readings this source is expected to carry.
    pub turbines: Vec<i32>,
    /// Free-form note for operators.
    #[serde(default)]
    pub description: Option<String>,
}

impl SourceDeclaration {
    /// Checks if the source is declared to carry readings for `turbine_id`.
    pub fn declares_turbine(&self, turbine_id: i32) -> bool {
        self.turbines.contains(&turbine_id)
    }
}

/// Looks up a declaration by source id. Returns `None` if not declared.
pub fn find_source<'a>(
    declarations: &'a [SourceDeclaration],
    source_id: &str,
) -> Option<&'a SourceDeclaration> {
    declarations.iter().find(|s| s.id == source_id)
}

/// Returns the ids of all declared sources.
pub fn all_source_ids(declarations: &[SourceDeclaration]) -> Vec<&str> {
    declarations.iter().map(|s| s.id.as_str()).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
