use std::collections::BTreeSet;
use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::answers::AnswerSet;
use crate::documents::expected_documents;
use crate::schema::{QuestionLocation, Schema};
use crate::spec::{Constraint, QuestionSpec, QuestionType, StepSpec};
use crate::sequencer::route;
use crate::visibility::{question_visible, visible_step_sections};

static EMAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("email pattern compiles")
});

static TEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\+?[0-9][0-9 ()./-]{4,}$").expect("tel pattern compiles"));

pub const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    MissingRequired,
    MissingDocument,
    TypeMismatch,
    InvalidChoice,
    DuplicateChoice,
    InvalidDate,
    InvalidEmail,
    InvalidTel,
    PatternMismatch,
    MinLength,
    MaxLength,
    Min,
    Max,
}

/// One unmet requirement, located precisely enough to send the applicant
/// back to the offending step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationError {
    pub step: String,
    pub section: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<String>,
    pub path: String,
    pub message: String,
    pub code: ErrorCode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<ValidationError>,
    /// Answers stored under ids the schema does not declare. Reported but
    /// never blocking.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unknown_fields: Vec<String>,
}

impl ValidationResult {
    fn from_errors(errors: Vec<ValidationError>, unknown_fields: Vec<String>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
            unknown_fields,
        }
    }

    /// Qualified `step.question` ids that still need an answer.
    pub fn missing_required(&self) -> Vec<String> {
        self.errors
            .iter()
            .filter(|error| error.code == ErrorCode::MissingRequired)
            .filter_map(|error| {
                error
                    .question_id
                    .as_ref()
                    .map(|question| format!("{}.{}", error.step, question))
            })
            .collect()
    }

    /// Slugs of required documents without an accepted upload.
    pub fn missing_documents(&self) -> Vec<String> {
        self.errors
            .iter()
            .filter_map(|error| error.document.clone())
            .collect()
    }

    /// The step the applicant should be sent to first.
    pub fn first_step(&self, schema: &Schema) -> Option<String> {
        self.errors
            .iter()
            .min_by_key(|error| schema.step_index(&error.step).unwrap_or(usize::MAX))
            .map(|error| error.step.clone())
    }
}

/// Validity of a single step: every visible question that is required, or
/// required through `required_if`, has a present, well-typed value, and no
/// visible answer is malformed.
pub fn validate_step(schema: &Schema, step: &StepSpec, answers: &AnswerSet) -> ValidationResult {
    let mut errors = Vec::new();
    for section in visible_step_sections(schema, step, answers) {
        for question in section
            .questions
            .iter()
            .filter(|question| question_visible(question, answers))
        {
            let location = QuestionLocation {
                step,
                section,
                question,
            };
            check_question(&location, answers, &mut errors);
        }
    }
    ValidationResult::from_errors(errors, Vec::new())
}

/// Whole-questionnaire validation used before submission: every step on the
/// route plus the required documents those steps expect. Steps bypassed by a
/// jump rule keep their answers but do not block.
pub fn validate(schema: &Schema, answers: &AnswerSet) -> ValidationResult {
    let steps = route(schema, answers);
    let mut errors = Vec::new();
    for step in &steps {
        errors.extend(validate_step(schema, step, answers).errors);
    }

    let reported: BTreeSet<String> = errors
        .iter()
        .filter_map(|error| error.document.clone())
        .collect();
    for expected in expected_documents(schema, answers) {
        if expected.requirement.required
            && steps.iter().any(|step| step.id == expected.step)
            && !answers.has_upload(&expected.requirement.slug)
            && !reported.contains(&expected.requirement.slug)
        {
            errors.push(document_error(
                &expected.step,
                &expected.section,
                &expected.question,
                &expected.requirement.slug,
                &expected.requirement.label,
            ));
        }
    }

    ValidationResult::from_errors(errors, unknown_fields(schema, answers))
}

/// Whether the question has an answer that counts as supplied.
pub fn answer_present(location: &QuestionLocation<'_>, answers: &AnswerSet) -> bool {
    let question = location.question;
    if matches!(question.kind, QuestionType::File) {
        return missing_file_slugs(question, answers).is_empty()
            && question
                .file_requirements
                .iter()
                .any(|requirement| answers.has_upload(&requirement.slug));
    }
    answers
        .get(&location.step.id, &question.id)
        .is_some_and(is_filled)
}

fn check_question(
    location: &QuestionLocation<'_>,
    answers: &AnswerSet,
    errors: &mut Vec<ValidationError>,
) {
    let question = location.question;
    let required = question.is_required(answers);

    if matches!(question.kind, QuestionType::File) {
        if required {
            let mut missing = missing_file_slugs(question, answers);
            if missing.is_empty() && !answer_present(location, answers) {
                missing = question
                    .file_requirements
                    .iter()
                    .map(|requirement| requirement.slug.as_str())
                    .collect();
            }
            for slug in missing {
                let label = question
                    .file_requirements
                    .iter()
                    .find(|requirement| requirement.slug == slug)
                    .map(|requirement| requirement.label.as_str())
                    .unwrap_or(slug);
                errors.push(document_error(
                    &location.step.id,
                    &location.section.id,
                    &question.id,
                    slug,
                    label,
                ));
            }
        }
        return;
    }

    match answers
        .get(&location.step.id, &question.id)
        .filter(|value| is_filled(value))
    {
        None => {
            if required {
                errors.push(base_error(
                    location,
                    "this question requires an answer",
                    ErrorCode::MissingRequired,
                ));
            }
        }
        Some(value) => {
            if let Some((message, code)) = check_value(question, value) {
                errors.push(base_error(location, &message, code));
            }
        }
    }
}

/// Checks a supplied value against the declared type, choices, and
/// constraint of a question.
pub fn check_value(question: &QuestionSpec, value: &Value) -> Option<(String, ErrorCode)> {
    if !matches_type(question.kind, value) {
        return Some((
            format!("expected a {} answer", question.kind.as_str()),
            ErrorCode::TypeMismatch,
        ));
    }

    match question.kind {
        QuestionType::Date => {
            let text = value.as_str().unwrap_or_default();
            if NaiveDate::parse_from_str(text, DATE_FORMAT).is_err() {
                return Some(("dates must use YYYY-MM-DD".into(), ErrorCode::InvalidDate));
            }
        }
        QuestionType::Email => {
            if !EMAIL.is_match(value.as_str().unwrap_or_default()) {
                return Some(("not a valid email address".into(), ErrorCode::InvalidEmail));
            }
        }
        QuestionType::Tel => {
            if !TEL.is_match(value.as_str().unwrap_or_default()) {
                return Some(("not a valid phone number".into(), ErrorCode::InvalidTel));
            }
        }
        QuestionType::SingleChoice => {
            let choice = value.as_str().unwrap_or_default();
            if !question.allows_choice(choice) {
                return Some((format!("'{}' is not an option", choice), ErrorCode::InvalidChoice));
            }
        }
        QuestionType::MultiChoice => {
            let mut seen = BTreeSet::new();
            for choice in value.as_array().into_iter().flatten().filter_map(Value::as_str) {
                if !question.allows_choice(choice) {
                    return Some((
                        format!("'{}' is not an option", choice),
                        ErrorCode::InvalidChoice,
                    ));
                }
                if !seen.insert(choice) {
                    return Some((
                        format!("'{}' selected more than once", choice),
                        ErrorCode::DuplicateChoice,
                    ));
                }
            }
        }
        _ => {}
    }

    question
        .constraint
        .as_ref()
        .and_then(|constraint| enforce_constraint(value, constraint))
}

pub(crate) fn matches_type(kind: QuestionType, value: &Value) -> bool {
    match kind {
        QuestionType::Text
        | QuestionType::Date
        | QuestionType::Email
        | QuestionType::Tel
        | QuestionType::SingleChoice => value.is_string(),
        QuestionType::Number => value.is_number(),
        QuestionType::Boolean => value.is_boolean(),
        QuestionType::MultiChoice => value
            .as_array()
            .is_some_and(|items| items.iter().all(Value::is_string)),
        QuestionType::File => true,
    }
}

fn enforce_constraint(value: &Value, constraint: &Constraint) -> Option<(String, ErrorCode)> {
    if let Some(pattern) = &constraint.pattern
        && let Some(text) = value.as_str()
        && let Ok(regex) = Regex::new(pattern)
        && !regex.is_match(text)
    {
        return Some(("value does not match pattern".into(), ErrorCode::PatternMismatch));
    }

    let length = match value {
        Value::String(text) => Some(text.chars().count()),
        Value::Array(items) => Some(items.len()),
        _ => None,
    };

    if let Some(min_len) = constraint.min_len
        && let Some(length) = length
        && length < min_len
    {
        return Some(("answer shorter than min length".into(), ErrorCode::MinLength));
    }

    if let Some(max_len) = constraint.max_len
        && let Some(length) = length
        && length > max_len
    {
        return Some(("answer longer than max length".into(), ErrorCode::MaxLength));
    }

    if let Some(min) = constraint.min
        && let Some(number) = value.as_f64()
        && number < min
    {
        return Some(("value below minimum".into(), ErrorCode::Min));
    }

    if let Some(max) = constraint.max
        && let Some(number) = value.as_f64()
        && number > max
    {
        return Some(("value above maximum".into(), ErrorCode::Max));
    }

    None
}

fn is_filled(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(text) => !text.trim().is_empty(),
        Value::Array(items) => !items.is_empty(),
        _ => true,
    }
}

/// Required file requirements of a question that have no upload yet.
fn missing_file_slugs<'a>(question: &'a QuestionSpec, answers: &AnswerSet) -> Vec<&'a str> {
    question
        .file_requirements
        .iter()
        .filter(|requirement| requirement.required && !answers.has_upload(&requirement.slug))
        .map(|requirement| requirement.slug.as_str())
        .collect()
}

fn unknown_fields(schema: &Schema, answers: &AnswerSet) -> Vec<String> {
    answers
        .steps
        .iter()
        .flat_map(|(step, values)| values.keys().map(move |field| (step, field)))
        .filter(|(step, field)| schema.question(step, field).is_none())
        .map(|(step, field)| format!("{}.{}", step, field))
        .collect()
}

fn base_error(location: &QuestionLocation<'_>, message: &str, code: ErrorCode) -> ValidationError {
    ValidationError {
        step: location.step.id.clone(),
        section: location.section.id.clone(),
        question_id: Some(location.question.id.clone()),
        document: None,
        path: format!("/{}/{}", location.step.id, location.question.id),
        message: message.into(),
        code,
    }
}

fn document_error(
    step: &str,
    section: &str,
    question: &str,
    slug: &str,
    label: &str,
) -> ValidationError {
    ValidationError {
        step: step.to_string(),
        section: section.to_string(),
        question_id: Some(question.to_string()),
        document: Some(slug.to_string()),
        path: format!("/uploads/{}", slug),
        message: format!("document '{}' has not been uploaded", label),
        code: ErrorCode::MissingDocument,
    }
}
