use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use thiserror::Error;
use tracing::debug;

use intake_spec::{
    AnswerSet, IntakeConfig, IntakeError, IntakeSession, Schema, UploadedFile, answers_schema,
    render_json_ui as intake_render_json_ui, render_text as intake_render_text,
};

const DEFAULT_SPEC: &str = include_str!("../../intake-spec/tests/fixtures/claims_intake.json");

#[derive(Debug, Error)]
enum ComponentError {
    #[error("failed to parse config/{0}")]
    ConfigParse(#[source] serde_json::Error),
    #[error("questionnaire '{0}' is not available")]
    QuestionnaireUnavailable(String),
    #[error("failed to parse answers: {0}")]
    AnswersParse(#[source] serde_json::Error),
    #[error("failed to parse value: {0}")]
    ValueParse(#[source] serde_json::Error),
    #[error("json encode error: {0}")]
    JsonEncode(#[source] serde_json::Error),
    #[error(transparent)]
    Intake(#[from] IntakeError),
}

#[derive(Debug, Deserialize, Serialize, Default)]
struct ComponentConfig {
    #[serde(default)]
    questionnaire_json: Option<String>,
    #[serde(default)]
    settings: IntakeConfig,
}

fn load_config(config_json: &str) -> Result<ComponentConfig, ComponentError> {
    if config_json.trim().is_empty() {
        Ok(ComponentConfig::default())
    } else {
        serde_json::from_str(config_json).map_err(ComponentError::ConfigParse)
    }
}

fn load_schema(config: &ComponentConfig) -> Result<Schema, ComponentError> {
    let json = config.questionnaire_json.as_deref().unwrap_or(DEFAULT_SPEC);
    Schema::from_json(json).map_err(|err| IntakeError::from(err).into())
}

fn ensure_questionnaire(
    questionnaire_id: &str,
    config_json: &str,
) -> Result<(Schema, IntakeConfig), ComponentError> {
    let config = load_config(config_json)?;
    let schema = load_schema(&config)?;
    if schema.id() != questionnaire_id {
        Err(ComponentError::QuestionnaireUnavailable(
            questionnaire_id.to_string(),
        ))
    } else {
        Ok((schema, config.settings))
    }
}

fn parse_answers(schema: &Schema, answers_json: &str) -> Result<AnswerSet, ComponentError> {
    if answers_json.trim().is_empty() {
        return Ok(AnswerSet::new(schema.id(), schema.version()));
    }
    serde_json::from_str(answers_json).map_err(ComponentError::AnswersParse)
}

/// Rebuilds a session from the questionnaire config and a stored answer set.
fn open_session(
    questionnaire_id: &str,
    config_json: &str,
    answers_json: &str,
) -> Result<IntakeSession, ComponentError> {
    let (schema, settings) = ensure_questionnaire(questionnaire_id, config_json)?;
    let answers = parse_answers(&schema, answers_json)?;
    IntakeSession::with_answers(Arc::new(schema), answers, settings)
        .map_err(|err| IntakeError::from(err).into())
}

fn encode<T: Serialize>(value: &T) -> Result<Value, ComponentError> {
    serde_json::to_value(value).map_err(ComponentError::JsonEncode)
}

fn respond(result: Result<Value, ComponentError>) -> String {
    match result {
        Ok(value) => serde_json::to_string(&value).unwrap_or_else(|error| {
            json!({"error": format!("json encode: {}", error)}).to_string()
        }),
        Err(ComponentError::Intake(IntakeError::NavigationDenied(denied))) => json!({
            "error": denied.to_string(),
            "denied": denied,
        })
        .to_string(),
        Err(err) => json!({ "error": err.to_string() }).to_string(),
    }
}

fn respond_string(result: Result<String, ComponentError>) -> String {
    match result {
        Ok(value) => value,
        Err(err) => json!({ "error": err.to_string() }).to_string(),
    }
}

pub fn describe(questionnaire_id: &str, config_json: &str) -> String {
    respond(
        ensure_questionnaire(questionnaire_id, config_json)
            .and_then(|(schema, _)| encode(schema.spec())),
    )
}

pub fn get_answer_schema(questionnaire_id: &str, config_json: &str, answers_json: &str) -> String {
    respond(
        open_session(questionnaire_id, config_json, answers_json)
            .map(|session| answers_schema(session.schema(), session.answers())),
    )
}

pub fn visible_sections(questionnaire_id: &str, config_json: &str, answers_json: &str) -> String {
    respond(
        open_session(questionnaire_id, config_json, answers_json).map(|session| {
            let sections: Vec<Value> = session
                .visible_sections()
                .into_iter()
                .map(|section| {
                    json!({
                        "id": section.id,
                        "label": section.label,
                        "step": session.schema().step_of_section(&section.id).map(|step| step.id.clone()),
                    })
                })
                .collect();
            json!({ "sections": sections })
        }),
    )
}

pub fn expected_documents(questionnaire_id: &str, config_json: &str, answers_json: &str) -> String {
    respond(
        open_session(questionnaire_id, config_json, answers_json).map(|session| {
            let documents: Vec<Value> = session
                .expected_documents()
                .into_iter()
                .map(|document| {
                    let slug = document.requirement.slug;
                    json!({
                        "slug": slug,
                        "label": document.requirement.label,
                        "step": document.step,
                        "question": document.question,
                        "required": document.requirement.required,
                        "uploaded": session.answers().has_upload(&slug),
                    })
                })
                .collect();
            json!({
                "documents": documents,
                "hidden_uploads": session.hidden_uploads(),
                "completion": session.document_completion(),
                "warn_incomplete": session.should_warn_incomplete_documents(),
            })
        }),
    )
}

pub fn validate_answers(questionnaire_id: &str, config_json: &str, answers_json: &str) -> String {
    respond(
        open_session(questionnaire_id, config_json, answers_json)
            .and_then(|session| encode(&session.validate())),
    )
}

pub fn next(questionnaire_id: &str, config_json: &str, answers_json: &str) -> String {
    respond(
        open_session(questionnaire_id, config_json, answers_json).and_then(|session| {
            let view = session.view();
            Ok(json!({
                "status": view.status.as_str(),
                "position": encode(&session.position())?,
                "next_question_id": view.next_question_id,
                "progress": encode(&view.progress)?,
            }))
        }),
    )
}

/// Reports where a move to `target` (a step id, `next` or `previous`) would
/// land. Nothing is stored: the next call rebuilds the position from the
/// answers alone, so hosts that need `previous` or a backward `go_to` to
/// stick must keep the returned position themselves.
pub fn navigate(
    questionnaire_id: &str,
    config_json: &str,
    answers_json: &str,
    target: &str,
) -> String {
    respond(
        open_session(questionnaire_id, config_json, answers_json).and_then(|mut session| {
            let moved = match target {
                "next" => session.advance().map(|_| ()),
                "previous" => session.retreat().map(|_| ()),
                step => session.go_to(step),
            };
            moved.map_err(IntakeError::from)?;
            Ok(json!({
                "position": encode(&session.position())?,
                "progress": encode(&session.progress())?,
            }))
        }),
    )
}

pub fn render_text(questionnaire_id: &str, config_json: &str, answers_json: &str) -> String {
    respond_string(
        open_session(questionnaire_id, config_json, answers_json)
            .map(|session| intake_render_text(&session.view())),
    )
}

pub fn render_json_ui(questionnaire_id: &str, config_json: &str, answers_json: &str) -> String {
    respond(
        open_session(questionnaire_id, config_json, answers_json).map(|session| {
            intake_render_json_ui(&session.view(), session.schema(), session.answers())
        }),
    )
}

fn patch_status(session: &IntakeSession, field_errors: bool) -> &'static str {
    if field_errors {
        "error"
    } else if session.validate().valid {
        "complete"
    } else {
        "need_input"
    }
}

pub fn submit_patch(
    questionnaire_id: &str,
    config_json: &str,
    answers_json: &str,
    step: &str,
    field: &str,
    value_json: &str,
) -> String {
    respond(
        open_session(questionnaire_id, config_json, answers_json).and_then(|mut session| {
            let value: Value =
                serde_json::from_str(value_json).map_err(ComponentError::ValueParse)?;
            let mut partial = Map::new();
            partial.insert(field.to_string(), value);
            session.merge(step, partial).map_err(IntakeError::from)?;
            debug!(step, field, "patched answer");

            let validation = session
                .step_validity(step)
                .unwrap_or_else(|| session.validate());
            let field_errors = validation
                .errors
                .iter()
                .any(|error| error.question_id.as_deref() == Some(field));
            let view = session.view();
            Ok(json!({
                "status": patch_status(&session, field_errors),
                "next_question_id": view.next_question_id,
                "progress": encode(&view.progress)?,
                "answers": encode(session.answers())?,
                "validation": encode(&validation)?,
            }))
        }),
    )
}

/// Records metadata for an uploaded file after checking it against the
/// requirement it claims to satisfy.
pub fn record_upload(
    questionnaire_id: &str,
    config_json: &str,
    answers_json: &str,
    file_json: &str,
) -> String {
    respond(
        open_session(questionnaire_id, config_json, answers_json).and_then(|mut session| {
            let file: UploadedFile =
                serde_json::from_str(file_json).map_err(ComponentError::ValueParse)?;
            let requirement = session.record_upload(file).map_err(IntakeError::from)?;
            debug!(slug = %requirement.slug, "upload accepted");
            Ok(json!({
                "accepted": requirement.slug,
                "completion": session.document_completion(),
                "warn_incomplete": session.should_warn_incomplete_documents(),
                "answers": encode(session.answers())?,
            }))
        }),
    )
}

/// Checks that the answers can be handed to the case system. Delivery is
/// the host's job; this only reports readiness or what is missing.
pub fn submit_all(questionnaire_id: &str, config_json: &str, answers_json: &str) -> String {
    respond(
        open_session(questionnaire_id, config_json, answers_json).and_then(|session| {
            let validation = session.validate();
            if validation.valid {
                return Ok(json!({
                    "status": "ready_to_submit",
                    "documents_completion": session.document_completion(),
                    "answers": encode(session.answers())?,
                }));
            }
            Ok(json!({
                "status": "error",
                "first_step": validation.first_step(session.schema()),
                "validation": encode(&validation)?,
            }))
        }),
    )
}
