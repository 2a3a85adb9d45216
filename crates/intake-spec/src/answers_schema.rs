use serde_json::{Map, Value, json};

use crate::answers::AnswerSet;
use crate::schema::Schema;
use crate::spec::{QuestionSpec, QuestionType, QuestionnaireSpec};
use crate::validate::DATE_FORMAT;
use crate::visibility::{visible_questions, visible_step_sections, visible_steps};

/// JSON Schema describing the answers the applicant can currently give,
/// one object per visible step. File questions are answered through uploads
/// and are left out.
pub fn generate(schema: &Schema, answers: &AnswerSet) -> Value {
    let mut steps = Map::new();
    let mut required_steps = Vec::new();

    for step in visible_steps(schema, answers) {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for section in visible_step_sections(schema, step, answers) {
            for question in visible_questions(section, answers) {
                if matches!(question.kind, QuestionType::File) {
                    continue;
                }
                properties.insert(question.id.clone(), question_schema(question));
                if question.is_required(answers) {
                    required.push(Value::String(question.id.clone()));
                }
            }
        }
        if !required.is_empty() {
            required_steps.push(Value::String(step.id.clone()));
        }
        steps.insert(
            step.id.clone(),
            json!({
                "title": step.label,
                "type": "object",
                "properties": properties,
                "required": required,
                "additionalProperties": false,
            }),
        );
    }

    json!({
        "$schema": "https://json-schema.org/draft/2020-12/schema",
        "title": schema.title(),
        "type": "object",
        "properties": steps,
        "required": required_steps,
    })
}

fn question_schema(question: &QuestionSpec) -> Value {
    let mut map = Map::new();
    map.insert("title".into(), Value::String(question.label.clone()));
    if let Some(description) = &question.description {
        map.insert("description".into(), Value::String(description.clone()));
    }

    match question.kind {
        QuestionType::Text | QuestionType::Tel => {
            map.insert("type".into(), json!("string"));
        }
        QuestionType::Date => {
            map.insert("type".into(), json!("string"));
            map.insert("format".into(), json!("date"));
            map.insert("x-date-format".into(), json!(DATE_FORMAT));
        }
        QuestionType::Email => {
            map.insert("type".into(), json!("string"));
            map.insert("format".into(), json!("email"));
        }
        QuestionType::Number => {
            map.insert("type".into(), json!("number"));
        }
        QuestionType::Boolean => {
            map.insert("type".into(), json!("boolean"));
        }
        QuestionType::SingleChoice => {
            map.insert("type".into(), json!("string"));
            map.insert("enum".into(), json!(question.choices));
        }
        QuestionType::MultiChoice => {
            map.insert("type".into(), json!("array"));
            map.insert("items".into(), json!({ "type": "string", "enum": question.choices }));
            map.insert("uniqueItems".into(), json!(true));
        }
        QuestionType::File => {}
    }

    if let Some(constraint) = &question.constraint {
        let array = matches!(question.kind, QuestionType::MultiChoice);
        if let Some(pattern) = &constraint.pattern {
            map.insert("pattern".into(), json!(pattern));
        }
        if let Some(min_len) = constraint.min_len {
            let key = if array { "minItems" } else { "minLength" };
            map.insert(key.into(), json!(min_len));
        }
        if let Some(max_len) = constraint.max_len {
            let key = if array { "maxItems" } else { "maxLength" };
            map.insert(key.into(), json!(max_len));
        }
        if let Some(min) = constraint.min {
            map.insert("minimum".into(), json!(min));
        }
        if let Some(max) = constraint.max {
            map.insert("maximum".into(), json!(max));
        }
    }

    Value::Object(map)
}

/// JSON Schema of the questionnaire definition format itself.
pub fn authoring_schema() -> Value {
    serde_json::to_value(schemars::schema_for!(QuestionnaireSpec)).unwrap_or_default()
}
