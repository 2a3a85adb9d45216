use handlebars::Handlebars;
use serde_json::{Value, json};
use tracing::warn;

use crate::answers::AnswerSet;

/// Renders `{{answers.step.field}}` placeholders inside labels and
/// descriptions. Output is plain text; nothing is HTML-escaped.
pub struct LabelRenderer {
    engine: Handlebars<'static>,
}

impl Default for LabelRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl LabelRenderer {
    pub fn new() -> Self {
        let mut engine = Handlebars::new();
        engine.register_escape_fn(handlebars::no_escape);
        engine.set_strict_mode(false);
        Self { engine }
    }

    pub fn context(answers: &AnswerSet) -> Value {
        json!({
            "answers": answers.steps,
            "uploads": answers.uploads,
        })
    }

    /// Falls back to the raw label when the template does not render.
    pub fn render(&self, label: &str, answers: &AnswerSet) -> String {
        if !label.contains("{{") {
            return label.to_string();
        }
        self.render_with(label, &Self::context(answers))
    }

    pub fn render_with(&self, label: &str, context: &Value) -> String {
        match self.engine.render_template(label, context) {
            Ok(rendered) => rendered,
            Err(err) => {
                warn!(label, error = %err, "label template failed; using raw label");
                label.to_string()
            }
        }
    }
}
