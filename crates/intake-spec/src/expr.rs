use std::borrow::Cow;
use std::fmt;

use schemars::{JsonSchema, SchemaGenerator};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::answers::AnswerSet;

/// Reference to an answer, authored as `step.field` or a bare `field`.
///
/// Bare references are qualified with their owning step when the schema
/// is loaded, so evaluation never has to guess a namespace.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FieldRef {
    pub step: Option<String>,
    pub field: String,
}

impl FieldRef {
    pub fn parse(raw: &str) -> Self {
        match raw.split_once('.') {
            Some((step, field)) => Self {
                step: Some(step.to_string()),
                field: field.to_string(),
            },
            None => Self {
                step: None,
                field: raw.to_string(),
            },
        }
    }

    pub fn qualified(step: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            step: Some(step.into()),
            field: field.into(),
        }
    }

    pub fn is_qualified(&self) -> bool {
        self.step.is_some()
    }
}

impl fmt::Display for FieldRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.step {
            Some(step) => write!(f, "{}.{}", step, self.field),
            None => write!(f, "{}", self.field),
        }
    }
}

impl Serialize for FieldRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for FieldRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(FieldRef::parse(&raw))
    }
}

impl JsonSchema for FieldRef {
    fn schema_name() -> Cow<'static, str> {
        "FieldRef".into()
    }

    fn json_schema(generator: &mut SchemaGenerator) -> schemars::Schema {
        String::json_schema(generator)
    }
}

/// Typed predicate over the answer set, used for `show_if`, `required_if`
/// and conditional step jumps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Expr {
    Eq { field: FieldRef, value: Value },
    Ne { field: FieldRef, value: Value },
    Includes { field: FieldRef, value: Value },
    And { expressions: Vec<Expr> },
    Or { expressions: Vec<Expr> },
}

impl Expr {
    pub fn equals(field: &str, value: impl Into<Value>) -> Self {
        Expr::Eq {
            field: FieldRef::parse(field),
            value: value.into(),
        }
    }

    pub fn not_equals(field: &str, value: impl Into<Value>) -> Self {
        Expr::Ne {
            field: FieldRef::parse(field),
            value: value.into(),
        }
    }

    pub fn includes(field: &str, value: impl Into<Value>) -> Self {
        Expr::Includes {
            field: FieldRef::parse(field),
            value: value.into(),
        }
    }

    pub fn all(expressions: Vec<Expr>) -> Self {
        Expr::And { expressions }
    }

    pub fn any(expressions: Vec<Expr>) -> Self {
        Expr::Or { expressions }
    }

    /// Evaluates the predicate. Never fails: a comparison or membership
    /// test against an unanswered field is `false`.
    pub fn evaluate(&self, answers: &AnswerSet) -> bool {
        match self {
            Expr::Eq { field, value } => answers
                .lookup(field)
                .is_some_and(|answer| literal_matches(answer, value)),
            Expr::Ne { field, value } => answers
                .lookup(field)
                .is_some_and(|answer| !literal_matches(answer, value)),
            Expr::Includes { field, value } => answers
                .lookup(field)
                .and_then(Value::as_array)
                .is_some_and(|items| items.iter().any(|item| literal_matches(item, value))),
            Expr::And { expressions } => expressions.iter().all(|expr| expr.evaluate(answers)),
            Expr::Or { expressions } => expressions.iter().any(|expr| expr.evaluate(answers)),
        }
    }

    /// All field references in evaluation order.
    pub fn fields(&self) -> Vec<&FieldRef> {
        let mut fields = Vec::new();
        self.collect_fields(&mut fields);
        fields
    }

    fn collect_fields<'a>(&'a self, out: &mut Vec<&'a FieldRef>) {
        match self {
            Expr::Eq { field, .. } | Expr::Ne { field, .. } | Expr::Includes { field, .. } => {
                out.push(field)
            }
            Expr::And { expressions } | Expr::Or { expressions } => {
                for expr in expressions {
                    expr.collect_fields(out);
                }
            }
        }
    }
}

fn literal_matches(answer: &Value, literal: &Value) -> bool {
    match (answer, literal) {
        (Value::Number(left), Value::Number(right)) => left.as_f64() == right.as_f64(),
        _ => answer == literal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn answers(step: &str, values: Value) -> AnswerSet {
        let mut set = AnswerSet::new("form", "1");
        set.merge_step(step, values.as_object().cloned().unwrap_or_default());
        set
    }

    #[test]
    fn parses_qualified_and_bare_references() {
        let qualified = FieldRef::parse("claims.claimTypes");
        assert_eq!(qualified.step.as_deref(), Some("claims"));
        assert_eq!(qualified.field, "claimTypes");
        assert_eq!(qualified.to_string(), "claims.claimTypes");

        let bare = FieldRef::parse("claimTypes");
        assert!(!bare.is_qualified());
        assert_eq!(bare.to_string(), "claimTypes");
    }

    #[test]
    fn absent_fields_fail_closed() {
        let empty = AnswerSet::new("form", "1");
        for expr in [
            Expr::equals("a.x", "yes"),
            Expr::not_equals("a.x", "yes"),
            Expr::includes("a.x", "yes"),
            Expr::all(vec![Expr::not_equals("a.x", "no"), Expr::not_equals("a.y", "no")]),
            Expr::any(vec![Expr::equals("a.x", "no"), Expr::not_equals("a.y", "no")]),
        ] {
            assert!(!expr.evaluate(&empty), "{:?} should be false", expr);
        }
    }

    #[test]
    fn unqualified_reference_never_matches() {
        let set = answers("a", json!({ "x": "yes" }));
        assert!(!Expr::equals("x", "yes").evaluate(&set));
        assert!(Expr::equals("a.x", "yes").evaluate(&set));
    }

    #[test]
    fn null_answers_count_as_absent() {
        let set = answers("a", json!({ "x": null }));
        assert!(!Expr::not_equals("a.x", "yes").evaluate(&set));
    }

    #[test]
    fn equality_and_inequality() {
        let set = answers("a", json!({ "employed": true, "hours": 40 }));
        assert!(Expr::equals("a.employed", true).evaluate(&set));
        assert!(Expr::not_equals("a.employed", false).evaluate(&set));
        assert!(Expr::equals("a.hours", 40.0).evaluate(&set));
        assert!(!Expr::equals("a.hours", 41).evaluate(&set));
    }

    #[test]
    fn membership_requires_array_values() {
        let set = answers("claims", json!({ "types": ["overtime", "other"], "kind": "overtime" }));
        assert!(Expr::includes("claims.types", "overtime").evaluate(&set));
        assert!(!Expr::includes("claims.types", "dismissal").evaluate(&set));
        assert!(!Expr::includes("claims.kind", "overtime").evaluate(&set));
    }

    #[test]
    fn conjunction_short_circuits_on_missing_subexpression() {
        let set = answers("a", json!({ "x": "yes" }));
        let expr = Expr::all(vec![Expr::equals("a.x", "yes"), Expr::equals("a.missing", "yes")]);
        assert!(!expr.evaluate(&set));
        let expr = Expr::any(vec![Expr::equals("a.missing", "yes"), Expr::equals("a.x", "yes")]);
        assert!(expr.evaluate(&set));
    }

    #[test]
    fn deserializes_tagged_form() {
        let expr: Expr = serde_json::from_value(json!({
            "op": "and",
            "expressions": [
                { "op": "includes", "field": "claims.claimTypes", "value": "overtime" },
                { "op": "ne", "field": "paid", "value": true }
            ]
        }))
        .expect("deserialize");
        let fields: Vec<String> = expr.fields().iter().map(|f| f.to_string()).collect();
        assert_eq!(fields, vec!["claims.claimTypes", "paid"]);
        let round = serde_json::to_value(&expr).expect("serialize");
        assert_eq!(round["expressions"][0]["field"], "claims.claimTypes");
    }
}
