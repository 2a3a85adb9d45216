use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::expr::Expr;

pub type StepId = String;

/// Conditional jump evaluated when leaving a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct NextRule {
    pub when: Expr,
    pub goto: StepId,
}

/// Navigable unit grouping one or more sections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StepSpec {
    pub id: StepId,
    pub label: String,
    pub sections: Vec<String>,
    /// First matching rule wins; otherwise the next visible step in
    /// declared order follows.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub next: Vec<NextRule>,
}
