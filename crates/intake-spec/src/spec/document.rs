use std::collections::BTreeSet;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Supporting document expected while its owning question is visible.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct FileRequirement {
    pub slug: String,
    pub label: String,
    /// Extensions without the leading dot, matched case-insensitively.
    /// Empty means any extension is accepted.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub allowed_extensions: BTreeSet<String>,
    pub max_size_bytes: u64,
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}
