use std::collections::{BTreeMap, BTreeSet};

use regex::Regex;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::expr::{Expr, FieldRef};
use crate::spec::{
    QuestionSpec, QuestionType, QuestionnaireSpec, SectionSpec, StepSpec,
};

/// Errors raised while loading a questionnaire definition. All of them are
/// fatal: a schema that fails to load must never start a run.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("failed to parse questionnaire definition: {0}")]
    Parse(#[source] serde_json::Error),
    #[error("questionnaire '{0}' declares no sections")]
    EmptySchema(String),
    #[error("duplicate {kind} id '{id}' in {scope}")]
    DuplicateId {
        kind: &'static str,
        id: String,
        scope: String,
    },
    #[error("invalid predicate at {location}: {reason}")]
    InvalidPredicate { location: String, reason: String },
    #[error("invalid question '{question}': {reason}")]
    InvalidQuestion { question: String, reason: String },
    #[error("section '{0}' sets both always_shown and show_if")]
    ConflictingVisibility(String),
    #[error("section '{0}' has no visibility rule (set always_shown or show_if)")]
    NoVisibilityRule(String),
    #[error("step '{step}' references unknown section '{section}'")]
    UnknownSection { step: String, section: String },
    #[error("step '{step}' references unknown step '{target}'")]
    UnknownStep { step: String, target: String },
    #[error("step '{step}' jumps backwards to '{target}'")]
    BackwardJump { step: String, target: String },
    #[error("step '{0}' contains no sections")]
    EmptyStep(String),
    #[error("section '{0}' is not assigned to any step")]
    UnassignedSection(String),
}

/// A validated, immutable questionnaire definition.
///
/// Every predicate inside has had its field references qualified with the
/// owning step, and every structural rule has been checked.
#[derive(Debug, Clone)]
pub struct Schema {
    spec: QuestionnaireSpec,
    section_step: BTreeMap<String, usize>,
    step_positions: BTreeMap<String, usize>,
}

/// A question together with the step and section that own it.
#[derive(Debug, Clone, Copy)]
pub struct QuestionLocation<'a> {
    pub step: &'a StepSpec,
    pub section: &'a SectionSpec,
    pub question: &'a QuestionSpec,
}

impl<'a> QuestionLocation<'a> {
    pub fn qualified_id(&self) -> String {
        format!("{}.{}", self.step.id, self.question.id)
    }
}

impl Schema {
    pub fn from_json(json: &str) -> Result<Self, SchemaError> {
        let spec: QuestionnaireSpec = serde_json::from_str(json).map_err(SchemaError::Parse)?;
        Self::from_spec(spec)
    }

    pub fn from_value(value: Value) -> Result<Self, SchemaError> {
        let spec: QuestionnaireSpec = serde_json::from_value(value).map_err(SchemaError::Parse)?;
        Self::from_spec(spec)
    }

    pub fn from_spec(mut spec: QuestionnaireSpec) -> Result<Self, SchemaError> {
        if spec.sections.is_empty() {
            return Err(SchemaError::EmptySchema(spec.id.clone()));
        }
        check_sections(&spec)?;

        if spec.steps.is_empty() {
            spec.steps = spec
                .sections
                .iter()
                .map(|section| StepSpec {
                    id: section.id.clone(),
                    label: section.label.clone(),
                    sections: vec![section.id.clone()],
                    next: Vec::new(),
                })
                .collect();
        }
        let (section_step, step_positions) = check_steps(&spec)?;

        let index = FieldIndex::build(&spec, &section_step)?;
        resolve_predicates(&mut spec, &index)?;

        debug!(
            questionnaire = %spec.id,
            sections = spec.sections.len(),
            steps = spec.steps.len(),
            "questionnaire schema loaded"
        );

        Ok(Self {
            spec,
            section_step,
            step_positions,
        })
    }

    pub fn spec(&self) -> &QuestionnaireSpec {
        &self.spec
    }

    pub fn id(&self) -> &str {
        &self.spec.id
    }

    pub fn title(&self) -> &str {
        &self.spec.title
    }

    pub fn version(&self) -> &str {
        &self.spec.version
    }

    pub fn sections(&self) -> &[SectionSpec] {
        &self.spec.sections
    }

    pub fn section(&self, id: &str) -> Option<&SectionSpec> {
        self.spec.sections.iter().find(|section| section.id == id)
    }

    pub fn steps(&self) -> &[StepSpec] {
        &self.spec.steps
    }

    pub fn step(&self, id: &str) -> Option<&StepSpec> {
        self.step_index(id).map(|index| &self.spec.steps[index])
    }

    pub fn step_index(&self, id: &str) -> Option<usize> {
        self.step_positions.get(id).copied()
    }

    pub fn first_step(&self) -> &StepSpec {
        &self.spec.steps[0]
    }

    /// The step whose namespace holds the answers of `section_id`.
    pub fn step_of_section(&self, section_id: &str) -> Option<&StepSpec> {
        self.section_step
            .get(section_id)
            .map(|index| &self.spec.steps[*index])
    }

    /// Sections of a step in the order the step lists them.
    pub fn step_sections<'a>(
        &'a self,
        step: &'a StepSpec,
    ) -> impl Iterator<Item = &'a SectionSpec> + 'a {
        step.sections
            .iter()
            .filter_map(move |section_id| self.section(section_id))
    }

    /// Every question in declared section order.
    pub fn questions(&self) -> impl Iterator<Item = QuestionLocation<'_>> + '_ {
        self.spec.sections.iter().flat_map(move |section| {
            let step = self
                .step_of_section(&section.id)
                .unwrap_or_else(|| self.first_step());
            section.questions.iter().map(move |question| QuestionLocation {
                step,
                section,
                question,
            })
        })
    }

    pub fn question(&self, step_id: &str, field: &str) -> Option<QuestionLocation<'_>> {
        let step = self.step(step_id)?;
        self.step_sections(step).find_map(|section| {
            section.question(field).map(|question| QuestionLocation {
                step,
                section,
                question,
            })
        })
    }
}

fn check_sections(spec: &QuestionnaireSpec) -> Result<(), SchemaError> {
    let mut section_ids = BTreeSet::new();
    let mut slugs = BTreeSet::new();

    for section in &spec.sections {
        if !section_ids.insert(section.id.as_str()) {
            return Err(SchemaError::DuplicateId {
                kind: "section",
                id: section.id.clone(),
                scope: format!("questionnaire '{}'", spec.id),
            });
        }
        match (section.always_shown, section.show_if.is_some()) {
            (true, true) => return Err(SchemaError::ConflictingVisibility(section.id.clone())),
            (false, false) => return Err(SchemaError::NoVisibilityRule(section.id.clone())),
            _ => {}
        }

        let mut question_ids = BTreeSet::new();
        for question in &section.questions {
            if question.id.contains('.') {
                return Err(SchemaError::InvalidQuestion {
                    question: question.id.clone(),
                    reason: "ids may not contain '.'".into(),
                });
            }
            if !question_ids.insert(question.id.as_str()) {
                return Err(SchemaError::DuplicateId {
                    kind: "question",
                    id: question.id.clone(),
                    scope: format!("section '{}'", section.id),
                });
            }
            check_question(question)?;
            for requirement in &question.file_requirements {
                if !slugs.insert(requirement.slug.as_str()) {
                    return Err(SchemaError::DuplicateId {
                        kind: "document",
                        id: requirement.slug.clone(),
                        scope: format!("questionnaire '{}'", spec.id),
                    });
                }
            }
        }
    }
    Ok(())
}

fn check_question(question: &QuestionSpec) -> Result<(), SchemaError> {
    let invalid = |reason: &str| SchemaError::InvalidQuestion {
        question: question.id.clone(),
        reason: reason.to_string(),
    };

    if question.kind.has_choices() {
        let choices = question.choices.as_deref().unwrap_or_default();
        if choices.is_empty() {
            return Err(invalid("choice questions require at least one choice"));
        }
        let unique: BTreeSet<_> = choices.iter().collect();
        if unique.len() != choices.len() {
            return Err(invalid("choices must be unique"));
        }
    } else if question.choices.is_some() {
        return Err(invalid("only choice questions may declare choices"));
    }

    if matches!(question.kind, QuestionType::File) && question.file_requirements.is_empty() {
        return Err(invalid("file questions require at least one file requirement"));
    }

    if let Some(constraint) = &question.constraint {
        if let Some(pattern) = &constraint.pattern
            && Regex::new(pattern).is_err()
        {
            return Err(invalid("constraint pattern is not a valid regular expression"));
        }
        if let (Some(min), Some(max)) = (constraint.min_len, constraint.max_len)
            && min > max
        {
            return Err(invalid("min_len exceeds max_len"));
        }
        if let (Some(min), Some(max)) = (constraint.min, constraint.max)
            && min > max
        {
            return Err(invalid("min exceeds max"));
        }
    }

    for requirement in &question.file_requirements {
        if requirement.max_size_bytes == 0 {
            return Err(invalid("file requirements need a positive max_size_bytes"));
        }
    }
    Ok(())
}

type StepMaps = (BTreeMap<String, usize>, BTreeMap<String, usize>);

fn check_steps(spec: &QuestionnaireSpec) -> Result<StepMaps, SchemaError> {
    let mut positions = BTreeMap::new();
    for (index, step) in spec.steps.iter().enumerate() {
        if step.id.contains('.') {
            return Err(SchemaError::InvalidQuestion {
                question: step.id.clone(),
                reason: "step ids may not contain '.'".into(),
            });
        }
        if positions.insert(step.id.clone(), index).is_some() {
            return Err(SchemaError::DuplicateId {
                kind: "step",
                id: step.id.clone(),
                scope: format!("questionnaire '{}'", spec.id),
            });
        }
    }

    let known_sections: BTreeSet<_> = spec.sections.iter().map(|s| s.id.as_str()).collect();
    let mut section_step = BTreeMap::new();
    for (index, step) in spec.steps.iter().enumerate() {
        if step.sections.is_empty() {
            return Err(SchemaError::EmptyStep(step.id.clone()));
        }
        for section in &step.sections {
            if !known_sections.contains(section.as_str()) {
                return Err(SchemaError::UnknownSection {
                    step: step.id.clone(),
                    section: section.clone(),
                });
            }
            if section_step.insert(section.clone(), index).is_some() {
                return Err(SchemaError::DuplicateId {
                    kind: "section assignment",
                    id: section.clone(),
                    scope: format!("steps of questionnaire '{}'", spec.id),
                });
            }
        }
        for rule in &step.next {
            match positions.get(&rule.goto) {
                None => {
                    return Err(SchemaError::UnknownStep {
                        step: step.id.clone(),
                        target: rule.goto.clone(),
                    });
                }
                Some(target) if *target <= index => {
                    return Err(SchemaError::BackwardJump {
                        step: step.id.clone(),
                        target: rule.goto.clone(),
                    });
                }
                Some(_) => {}
            }
        }
    }

    if let Some(section) = spec
        .sections
        .iter()
        .find(|section| !section_step.contains_key(&section.id))
    {
        return Err(SchemaError::UnassignedSection(section.id.clone()));
    }

    Ok((section_step, positions))
}

/// Everything predicate resolution needs to know about a declared question.
struct FieldInfo {
    kind: QuestionType,
    choices: Option<Vec<String>>,
}

struct FieldIndex {
    fields: BTreeMap<(String, String), FieldInfo>,
    owners: BTreeMap<String, Vec<String>>,
}

impl FieldIndex {
    fn build(
        spec: &QuestionnaireSpec,
        section_step: &BTreeMap<String, usize>,
    ) -> Result<Self, SchemaError> {
        let mut fields = BTreeMap::new();
        let mut owners: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for section in &spec.sections {
            let step = &spec.steps[section_step[&section.id]];
            for question in &section.questions {
                let key = (step.id.clone(), question.id.clone());
                if fields.contains_key(&key) {
                    return Err(SchemaError::DuplicateId {
                        kind: "question",
                        id: question.id.clone(),
                        scope: format!("step '{}'", step.id),
                    });
                }
                fields.insert(
                    key,
                    FieldInfo {
                        kind: question.kind,
                        choices: question.choices.clone(),
                    },
                );
                owners
                    .entry(question.id.clone())
                    .or_default()
                    .push(step.id.clone());
            }
        }
        Ok(Self { fields, owners })
    }

    fn resolve(&self, field: &mut FieldRef, location: &str) -> Result<&FieldInfo, SchemaError> {
        let invalid = |reason: String| SchemaError::InvalidPredicate {
            location: location.to_string(),
            reason,
        };
        if field.step.is_none() {
            match self.owners.get(&field.field).map(Vec::as_slice) {
                Some([step]) => field.step = Some(step.clone()),
                Some(steps) if steps.len() > 1 => {
                    return Err(invalid(format!(
                        "field '{}' is ambiguous; qualify it with one of: {}",
                        field.field,
                        steps.join(", ")
                    )));
                }
                _ => return Err(invalid(format!("unknown field '{}'", field.field))),
            }
        }
        let step = field.step.clone().unwrap_or_default();
        self.fields
            .get(&(step, field.field.clone()))
            .ok_or_else(|| invalid(format!("unknown field '{}'", field)))
    }
}

fn resolve_predicates(spec: &mut QuestionnaireSpec, index: &FieldIndex) -> Result<(), SchemaError> {
    for section in &mut spec.sections {
        if let Some(expr) = &mut section.show_if {
            resolve_expr(expr, index, &format!("section '{}' show_if", section.id))?;
        }
        for question in &mut section.questions {
            if let Some(expr) = &mut question.show_if {
                resolve_expr(expr, index, &format!("question '{}' show_if", question.id))?;
            }
            if let Some(expr) = &mut question.required_if {
                resolve_expr(expr, index, &format!("question '{}' required_if", question.id))?;
            }
        }
    }
    for step in &mut spec.steps {
        for (position, rule) in step.next.iter_mut().enumerate() {
            let location = format!("step '{}' next[{}]", step.id, position);
            resolve_expr(&mut rule.when, index, &location)?;
        }
    }
    Ok(())
}

fn resolve_expr(expr: &mut Expr, index: &FieldIndex, location: &str) -> Result<(), SchemaError> {
    let invalid = |reason: String| SchemaError::InvalidPredicate {
        location: location.to_string(),
        reason,
    };
    match expr {
        Expr::Eq { field, value } | Expr::Ne { field, value } => {
            let info = index.resolve(field, location)?;
            if matches!(info.kind, QuestionType::MultiChoice) {
                return Err(invalid(format!(
                    "'{}' is multi-choice; compare its selections with 'includes'",
                    field
                )));
            }
            check_literal(info, value).map_err(|reason| invalid(format!("{}: {}", field, reason)))
        }
        Expr::Includes { field, value } => {
            let info = index.resolve(field, location)?;
            if !matches!(info.kind, QuestionType::MultiChoice) {
                return Err(invalid(format!(
                    "'includes' needs a multi-choice field but '{}' is {}",
                    field,
                    info.kind.as_str()
                )));
            }
            check_literal(info, value).map_err(|reason| invalid(format!("{}: {}", field, reason)))
        }
        Expr::And { expressions } | Expr::Or { expressions } => {
            if expressions.is_empty() {
                return Err(invalid("and/or need at least one expression".into()));
            }
            for nested in expressions.iter_mut() {
                resolve_expr(nested, index, location)?;
            }
            Ok(())
        }
    }
}

fn check_literal(info: &FieldInfo, value: &Value) -> Result<(), String> {
    match info.kind {
        QuestionType::SingleChoice | QuestionType::MultiChoice => {
            let text = value
                .as_str()
                .ok_or_else(|| "choice literals must be strings".to_string())?;
            let known = info
                .choices
                .as_ref()
                .is_some_and(|choices| choices.iter().any(|choice| choice == text));
            if known {
                Ok(())
            } else {
                Err(format!("'{}' is not a declared choice", text))
            }
        }
        QuestionType::Boolean if !value.is_boolean() => Err("expected a boolean literal".into()),
        QuestionType::Number if !value.is_number() => Err("expected a numeric literal".into()),
        QuestionType::Text | QuestionType::Date | QuestionType::Email | QuestionType::Tel
            if !value.is_string() =>
        {
            Err("expected a string literal".into())
        }
        QuestionType::File => Err("file questions cannot be compared".into()),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base() -> Value {
        json!({
            "id": "intake",
            "title": "Intake",
            "version": "1",
            "sections": [
                {
                    "id": "claims",
                    "label": "Claims",
                    "always_shown": true,
                    "questions": [
                        {
                            "id": "claimTypes",
                            "type": "multi-choice",
                            "label": "Claims",
                            "required": true,
                            "choices": ["overtime", "dismissal", "other"]
                        },
                        { "id": "employed", "type": "boolean", "label": "Employed?" }
                    ]
                },
                {
                    "id": "overtime-details",
                    "label": "Overtime",
                    "show_if": { "op": "includes", "field": "claimTypes", "value": "overtime" },
                    "questions": []
                }
            ]
        })
    }

    fn load(value: Value) -> Result<Schema, SchemaError> {
        Schema::from_value(value)
    }

    #[test]
    fn derives_one_step_per_section_and_qualifies_fields() {
        let schema = load(base()).expect("schema");
        assert_eq!(schema.steps().len(), 2);
        assert_eq!(schema.steps()[1].id, "overtime-details");
        let expr = schema.section("overtime-details").unwrap().show_if.as_ref().unwrap();
        assert_eq!(expr.fields()[0].to_string(), "claims.claimTypes");
        assert_eq!(schema.step_of_section("claims").unwrap().id, "claims");
    }

    #[test]
    fn rejects_unknown_field() {
        let mut value = base();
        value["sections"][1]["show_if"]["field"] = json!("nope");
        let err = load(value).unwrap_err();
        assert!(matches!(err, SchemaError::InvalidPredicate { .. }), "{err}");
    }

    #[test]
    fn rejects_membership_on_scalar_field() {
        let mut value = base();
        value["sections"][1]["show_if"] = json!({ "op": "includes", "field": "employed", "value": true });
        assert!(matches!(load(value), Err(SchemaError::InvalidPredicate { .. })));
    }

    #[test]
    fn rejects_equality_on_multi_choice_field() {
        for op in ["eq", "ne"] {
            let mut value = base();
            value["sections"][1]["show_if"] =
                json!({ "op": op, "field": "claimTypes", "value": "overtime" });
            let err = load(value).unwrap_err();
            assert!(matches!(err, SchemaError::InvalidPredicate { .. }), "{err}");
            assert!(err.to_string().contains("includes"), "{err}");
        }
    }

    #[test]
    fn rejects_undeclared_choice_literal() {
        let mut value = base();
        value["sections"][1]["show_if"]["value"] = json!("holiday");
        assert!(matches!(load(value), Err(SchemaError::InvalidPredicate { .. })));
    }

    #[test]
    fn rejects_empty_conjunction() {
        let mut value = base();
        value["sections"][1]["show_if"] = json!({ "op": "and", "expressions": [] });
        assert!(matches!(load(value), Err(SchemaError::InvalidPredicate { .. })));
    }

    #[test]
    fn rejects_conflicting_or_missing_visibility() {
        let mut value = base();
        value["sections"][1]["always_shown"] = json!(true);
        assert!(matches!(load(value), Err(SchemaError::ConflictingVisibility(_))));

        let mut value = base();
        value["sections"][1].as_object_mut().unwrap().remove("show_if");
        assert!(matches!(load(value), Err(SchemaError::NoVisibilityRule(_))));
    }

    #[test]
    fn rejects_duplicate_question_ids() {
        let mut value = base();
        value["sections"][0]["questions"][1]["id"] = json!("claimTypes");
        assert!(matches!(load(value), Err(SchemaError::DuplicateId { .. })));
    }

    #[test]
    fn rejects_ambiguous_bare_reference() {
        let mut value = base();
        value["sections"][1]["questions"] =
            json!([{ "id": "employed", "type": "boolean", "label": "Still employed?" }]);
        value["sections"][1]["show_if"] = json!({ "op": "eq", "field": "employed", "value": true });
        let err = load(value).unwrap_err();
        assert!(err.to_string().contains("ambiguous"), "{err}");
    }

    #[test]
    fn validates_explicit_steps() {
        let mut value = base();
        value["steps"] = json!([
            { "id": "start", "label": "Start", "sections": ["claims"],
              "next": [{ "when": { "op": "eq", "field": "employed", "value": false }, "goto": "start" }] },
            { "id": "details", "label": "Details", "sections": ["overtime-details"] }
        ]);
        assert!(matches!(load(value.clone()), Err(SchemaError::BackwardJump { .. })));

        value["steps"][0]["next"][0]["goto"] = json!("details");
        let schema = load(value.clone()).expect("schema");
        assert_eq!(schema.step_of_section("claims").unwrap().id, "start");
        assert_eq!(
            schema.steps()[0].next[0].when.fields()[0].to_string(),
            "start.employed"
        );

        value["steps"][1]["sections"] = json!([]);
        assert!(matches!(load(value), Err(SchemaError::EmptyStep(_))));
    }

    #[test]
    fn rejects_unassigned_section() {
        let mut value = base();
        value["steps"] = json!([{ "id": "start", "label": "Start", "sections": ["claims"] }]);
        assert!(matches!(load(value), Err(SchemaError::UnassignedSection(_))));
    }

    #[test]
    fn rejects_choice_question_without_choices() {
        let mut value = base();
        value["sections"][0]["questions"][0]
            .as_object_mut()
            .unwrap()
            .remove("choices");
        assert!(matches!(load(value), Err(SchemaError::InvalidQuestion { .. })));
    }

    #[test]
    fn reports_parse_errors() {
        assert!(matches!(Schema::from_json("{"), Err(SchemaError::Parse(_))));
    }
}
