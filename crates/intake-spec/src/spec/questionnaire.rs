use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::spec::section::SectionSpec;
use crate::spec::step::StepSpec;

/// Presentation hints for a questionnaire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Presentation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intro: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub theme: Option<String>,
}

/// Top-level intake questionnaire definition as authored on disk.
///
/// Use [`crate::Schema::from_spec`] to validate and resolve a definition
/// before running a questionnaire against it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct QuestionnaireSpec {
    pub id: String,
    pub title: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presentation: Option<Presentation>,
    pub sections: Vec<SectionSpec>,
    /// Navigable steps. When omitted, every section becomes its own step.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<StepSpec>,
}
