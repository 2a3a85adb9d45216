use serde::Serialize;
use serde_json::{Value, json};

use crate::{
    answers::AnswerSet,
    answers_schema,
    config::IntakeConfig,
    documents::{completion_ratio, expected_documents},
    progress::{Progress, compute, next_question},
    schema::Schema,
    sequencer::StepSequencer,
    spec::QuestionType,
    template::LabelRenderer,
    validate::{ValidationError, validate, validate_step},
    visibility::{question_visible, visible_step_sections},
};

/// Status labels returned by the renderers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderStatus {
    /// The current step still needs answers.
    NeedInput,
    /// Every visible requirement is met; the run can be submitted.
    ReadyToSubmit,
    Submitted,
}

impl RenderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RenderStatus::NeedInput => "need_input",
            RenderStatus::ReadyToSubmit => "ready_to_submit",
            RenderStatus::Submitted => "submitted",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RenderQuestion {
    pub id: String,
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub kind: QuestionType,
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub choices: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_value: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RenderSection {
    pub id: String,
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub questions: Vec<RenderQuestion>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RenderDocument {
    pub slug: String,
    pub label: String,
    pub step: String,
    pub required: bool,
    pub uploaded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

/// Read-only view of one moment in a run, shared by the text and JSON
/// renderers.
#[derive(Debug, Clone, Serialize)]
pub struct StepView {
    pub questionnaire_id: String,
    pub title: String,
    pub version: String,
    pub status: RenderStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_question_id: Option<String>,
    pub progress: Progress,
    pub sections: Vec<RenderSection>,
    pub step_valid: bool,
    pub errors: Vec<ValidationError>,
    pub documents: Vec<RenderDocument>,
    pub documents_ratio: f64,
    pub warn_incomplete_documents: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub help: Option<String>,
}

pub fn build_view(
    schema: &Schema,
    answers: &AnswerSet,
    sequencer: &StepSequencer,
    config: &IntakeConfig,
) -> StepView {
    let labels = LabelRenderer::new();
    let context = LabelRenderer::context(answers);
    let render = |text: &str| {
        if text.contains("{{") {
            labels.render_with(text, &context)
        } else {
            text.to_string()
        }
    };

    let current = sequencer.current(schema, answers);
    let mut sections = Vec::new();
    let mut errors = Vec::new();
    let mut step_valid = true;
    let mut next_question_id = None;

    if let Some(step) = current {
        for section in visible_step_sections(schema, step, answers) {
            let questions = section
                .questions
                .iter()
                .filter(|question| question_visible(question, answers))
                .map(|question| RenderQuestion {
                    id: question.id.clone(),
                    label: render(&question.label),
                    description: question.description.as_deref().map(&render),
                    kind: question.kind,
                    required: question.is_required(answers),
                    choices: question.choices.clone(),
                    current_value: answers.get(&step.id, &question.id).cloned(),
                })
                .collect();
            sections.push(RenderSection {
                id: section.id.clone(),
                label: render(&section.label),
                description: section.description.as_deref().map(&render),
                questions,
            });
        }
        let check = validate_step(schema, step, answers);
        step_valid = check.valid;
        errors = check.errors;
        next_question_id = next_question(schema, step, answers);
    }

    let expected = expected_documents(schema, answers);
    let documents_ratio = completion_ratio(&expected, answers);
    let documents = expected
        .iter()
        .map(|document| RenderDocument {
            slug: document.requirement.slug.clone(),
            label: render(&document.requirement.label),
            step: document.step.clone(),
            required: document.requirement.required,
            uploaded: answers.has_upload(&document.requirement.slug),
            filename: answers
                .upload(&document.requirement.slug)
                .map(|file| file.filename.clone()),
        })
        .collect();

    let status = if sequencer.is_done() {
        RenderStatus::Submitted
    } else if validate(schema, answers).valid {
        RenderStatus::ReadyToSubmit
    } else {
        RenderStatus::NeedInput
    };

    let help = schema
        .spec()
        .presentation
        .as_ref()
        .and_then(|presentation| presentation.intro.clone())
        .or_else(|| schema.spec().description.clone());

    StepView {
        questionnaire_id: schema.id().to_string(),
        title: schema.title().to_string(),
        version: schema.version().to_string(),
        status,
        step_id: current.map(|step| step.id.clone()),
        step_label: current.map(|step| render(&step.label)),
        next_question_id,
        progress: compute(schema, answers, sequencer),
        sections,
        step_valid,
        errors,
        documents,
        documents_ratio,
        warn_incomplete_documents: documents_ratio < config.completion_warning_threshold,
        help,
    }
}

/// Render the view as a structured JSON-friendly value, including the
/// schema of the currently visible answers.
pub fn render_json_ui(view: &StepView, schema: &Schema, answers: &AnswerSet) -> Value {
    let mut value = serde_json::to_value(view).unwrap_or_else(|_| json!({}));
    if let Value::Object(map) = &mut value {
        map.insert("schema".into(), answers_schema::generate(schema, answers));
    }
    value
}

/// Render the view as human-friendly text.
pub fn render_text(view: &StepView) -> String {
    let mut lines = Vec::new();
    lines.push(format!("Questionnaire: {} ({})", view.title, view.questionnaire_id));
    lines.push(format!(
        "Status: {} (step {}/{}, {:.0}%)",
        view.status.as_str(),
        (view.progress.step_index + 1).min(view.progress.total_steps.max(1)),
        view.progress.total_steps,
        view.progress.percent * 100.0
    ));
    if let Some(help) = &view.help {
        lines.push(format!("Help: {}", help));
    }

    if let (Some(id), Some(label)) = (&view.step_id, &view.step_label) {
        lines.push(format!("Step: {} ({})", label, id));
    }
    for section in &view.sections {
        lines.push(format!("[{}]", section.label));
        for question in &section.questions {
            let mut entry = format!(" - {} ({})", question.label, question.id);
            if question.required {
                entry.push_str(" [required]");
            }
            if let Some(value) = &question.current_value {
                entry.push_str(&format!(" = {}", value_to_display(value)));
            }
            lines.push(entry);
        }
    }

    for error in &view.errors {
        lines.push(format!("! {}: {}", error.path, error.message));
    }

    if !view.documents.is_empty() {
        lines.push(format!(
            "Documents ({:.0}% uploaded):",
            view.documents_ratio * 100.0
        ));
        for document in &view.documents {
            let state = match &document.filename {
                Some(filename) => format!("uploaded {}", filename),
                None if document.required => "missing (required)".to_string(),
                None => "missing".to_string(),
            };
            lines.push(format!(" - {} [{}]: {}", document.label, document.slug, state));
        }
        if view.warn_incomplete_documents {
            lines.push("Warning: several documents are still missing.".to_string());
        }
    }

    lines.join("\n")
}

pub fn value_to_display(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Bool(flag) => flag.to_string(),
        Value::Number(num) => num.to_string(),
        Value::Array(items) => items
            .iter()
            .map(value_to_display)
            .collect::<Vec<_>>()
            .join(", "),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::answers::UploadedFile;

    fn schema() -> Schema {
        Schema::from_value(json!({
            "id": "intake",
            "title": "Employment claim",
            "version": "1",
            "presentation": { "intro": "Tell us what happened." },
            "sections": [
                { "id": "claims", "label": "Claims", "always_shown": true,
                  "questions": [
                      { "id": "name", "type": "text", "label": "Name", "required": true },
                      { "id": "claimTypes", "type": "multi-choice", "label": "Claims for {{answers.claims.name}}",
                        "required": true, "choices": ["overtime", "dismissal"] }
                  ] },
                { "id": "overtime-details", "label": "Overtime",
                  "show_if": { "op": "includes", "field": "claimTypes", "value": "overtime" },
                  "questions": [
                      { "id": "badges", "type": "file", "label": "Badges", "required": true,
                        "file_requirements": [
                            { "slug": "badge_export", "label": "Badge export", "max_size_bytes": 100 }
                        ] }
                  ] }
            ]
        }))
        .expect("schema")
    }

    #[test]
    fn view_reflects_current_step() {
        let schema = schema();
        let mut answers = AnswerSet::new("intake", "1");
        answers.merge_step("claims", json!({ "name": "Ada" }).as_object().cloned().unwrap());
        let sequencer = StepSequencer::start(&schema, &answers);
        let view = build_view(&schema, &answers, &sequencer, &IntakeConfig::default());

        assert_eq!(view.status, RenderStatus::NeedInput);
        assert_eq!(view.step_id.as_deref(), Some("claims"));
        assert_eq!(view.next_question_id.as_deref(), Some("claimTypes"));
        assert_eq!(view.sections[0].questions[1].label, "Claims for Ada");
        assert!(!view.step_valid);
        assert!(view.documents.is_empty());
        assert!(!view.warn_incomplete_documents);

        let text = render_text(&view);
        assert!(text.contains("Questionnaire: Employment claim (intake)"));
        assert!(text.contains("Name (name) [required] = Ada"));
        assert!(text.contains("Help: Tell us what happened."));
    }

    #[test]
    fn documents_drive_warning_and_status() {
        let schema = schema();
        let mut answers = AnswerSet::new("intake", "1");
        answers.merge_step(
            "claims",
            json!({ "name": "Ada", "claimTypes": ["overtime"] }).as_object().cloned().unwrap(),
        );
        let sequencer = StepSequencer::start(&schema, &answers);
        let view = build_view(&schema, &answers, &sequencer, &IntakeConfig::default());
        assert!(view.warn_incomplete_documents);
        assert_eq!(view.status, RenderStatus::NeedInput);
        assert!(render_text(&view).contains("Badge export [badge_export]: missing (required)"));

        answers.insert_upload(UploadedFile::new("badge_export", "b.csv", 10, "csv"));
        let view = build_view(&schema, &answers, &sequencer, &IntakeConfig::default());
        assert_eq!(view.status, RenderStatus::ReadyToSubmit);
        assert_eq!(view.documents_ratio, 1.0);

        let ui = render_json_ui(&view, &schema, &answers);
        assert_eq!(ui["status"], "ready_to_submit");
        assert_eq!(ui["documents"][0]["filename"], "b.csv");
        assert!(ui["schema"]["properties"]["overtime-details"].is_object());
    }
}
