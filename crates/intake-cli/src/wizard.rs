use std::path::Path;

use intake_spec::{
    AnswerSet, FileRequirement, NavigationDenied, Progress, QuestionType, RenderQuestion,
    StepView, ValidationError, ValidationIncomplete,
};

/// Controls which bits of state the wizard prints.
#[derive(Copy, Clone, Eq, PartialEq)]
pub enum Verbosity {
    /// Clean output: step headings and question prompts only.
    Clean,
    /// Verbose output: status, visible questions, documents, help text.
    Verbose,
}

impl Verbosity {
    pub fn from_verbose(verbose: bool) -> Self {
        if verbose {
            Verbosity::Verbose
        } else {
            Verbosity::Clean
        }
    }

    pub fn is_verbose(&self) -> bool {
        matches!(self, Verbosity::Verbose)
    }
}

/// Prints what the session yields: headings once per step, prompts, and
/// the outcome of each attempt.
pub struct WizardPresenter {
    verbosity: Verbosity,
    header_printed: bool,
    last_step: Option<String>,
    show_answers_json: bool,
}

impl WizardPresenter {
    pub fn new(verbosity: Verbosity, show_answers_json: bool) -> Self {
        Self {
            verbosity,
            header_printed: false,
            last_step: None,
            show_answers_json,
        }
    }

    pub fn show_header(&mut self, view: &StepView) {
        if self.header_printed {
            return;
        }
        println!("Questionnaire: {}", view.title);
        if self.verbosity.is_verbose()
            && let Some(help) = &view.help
        {
            println!("Help: {}", help);
        }
        self.header_printed = true;
    }

    pub fn show_step(&mut self, view: &StepView) {
        if view.step_id == self.last_step {
            return;
        }
        self.last_step = view.step_id.clone();
        let Some(label) = &view.step_label else {
            return;
        };
        println!(
            "== {} (step {}/{}, {:.0}%) ==",
            label,
            view.progress.step_index + 1,
            view.progress.total_steps,
            view.progress.percent * 100.0
        );
        for section in &view.sections {
            if let Some(description) = &section.description {
                println!("{}", description);
            }
        }
        if self.verbosity.is_verbose() {
            println!("Status: {}", view.status.as_str());
            println!("Visible questions:");
            for section in &view.sections {
                for question in &section.questions {
                    let mut entry = format!(" - {} ({})", question.id, question.label);
                    if question.required {
                        entry.push_str(" [required]");
                    }
                    println!("{}", entry);
                }
            }
            if !view.documents.is_empty() {
                println!(
                    "Documents: {:.0}% uploaded",
                    view.documents_ratio * 100.0
                );
            }
        }
    }

    pub fn show_prompt(&self, prompt: &PromptContext) {
        let mut line = if prompt.total > 0 {
            format!("{}/{} {}", prompt.index, prompt.total, prompt.title)
        } else {
            format!("{} {}", prompt.index, prompt.title)
        };
        if prompt.required {
            line.push_str(" *");
        }
        if let Some(hint) = &prompt.hint {
            line.push(' ');
            line.push_str(hint);
        }
        println!("{}", line);
        if let Some(description) = &prompt.description {
            println!("{}", description);
        }
        if self.verbosity.is_verbose() && !prompt.choices.is_empty() {
            println!("Choices: {}", prompt.choices.join(", "));
        }
    }

    pub fn show_parse_error(&self, error: &AnswerParseError) {
        eprintln!("Invalid answer: {}", error.user_message);
        if let Some(debug) = &error.debug_message {
            eprintln!("  Expected: {}", debug);
        }
    }

    pub fn show_validation_error(&self, error: &ValidationError) {
        eprintln!("! {}", error.message);
    }

    pub fn show_denied(&self, denied: &NavigationDenied) {
        eprintln!("Cannot continue: {}", denied);
        for error in &denied.blocking {
            eprintln!("  {} - {}", error.path, error.message);
        }
    }

    pub fn show_incomplete(&self, incomplete: &ValidationIncomplete) {
        eprintln!("Not ready to submit: {}", incomplete);
        for error in &incomplete.unmet {
            eprintln!("  {} - {}", error.path, error.message);
        }
    }

    pub fn show_document_warning(&self, ratio: f64) {
        println!(
            "Only {:.0}% of the expected documents are uploaded.",
            ratio * 100.0
        );
    }

    pub fn show_paused(&self, store: &Path) {
        println!("Progress saved to {}", store.display());
    }

    pub fn show_completion(&self, answer_set: &AnswerSet, case_file: &Path) {
        println!("Submitted ✅");
        println!("Case file: {}", case_file.display());
        match answer_set.to_cbor() {
            Ok(bytes) => {
                println!("Answers (CBOR hex): {}", encode_hex(&bytes));
            }
            Err(err) => {
                eprintln!("Failed to serialize answers to CBOR: {}", err);
            }
        }
        if self.show_answers_json {
            match answer_set.to_json_pretty() {
                Ok(pretty) => println!("{}", pretty),
                Err(err) => {
                    eprintln!("Failed to serialize answers to JSON: {}", err);
                }
            }
        }
    }
}

/// Context used to format a single prompt.
pub struct PromptContext {
    pub index: usize,
    pub total: usize,
    pub title: String,
    pub description: Option<String>,
    pub required: bool,
    pub hint: Option<String>,
    pub choices: Vec<String>,
}

impl PromptContext {
    pub fn new(
        question: &RenderQuestion,
        progress: &Progress,
        upload: Option<&FileRequirement>,
    ) -> Self {
        let choices = question.choices.clone().unwrap_or_default();
        let (title, required, hint) = match upload {
            Some(requirement) => (
                format!("{}: {}", question.label, requirement.label),
                requirement.required || question.required,
                Some(upload_hint(requirement)),
            ),
            None => (
                question.label.clone(),
                question.required,
                kind_hint(question.kind, &choices),
            ),
        };
        Self {
            index: (progress.answered + 1).max(1),
            total: progress.total_questions,
            title,
            description: question.description.clone(),
            required,
            hint,
            choices,
        }
    }
}

fn kind_hint(kind: QuestionType, choices: &[String]) -> Option<String> {
    match kind {
        QuestionType::Boolean => Some("(yes/no, y/n, true/false)".to_string()),
        QuestionType::Number => Some("(number)".to_string()),
        QuestionType::Date => Some("(YYYY-MM-DD)".to_string()),
        QuestionType::SingleChoice if !choices.is_empty() => {
            Some(format!("({})", choices.join("/")))
        }
        QuestionType::MultiChoice if !choices.is_empty() => {
            Some(format!("(comma separated: {})", choices.join(", ")))
        }
        _ => None,
    }
}

fn upload_hint(requirement: &FileRequirement) -> String {
    let mut hint = String::from("(path to file");
    if !requirement.allowed_extensions.is_empty() {
        let allowed: Vec<&str> = requirement
            .allowed_extensions
            .iter()
            .map(String::as_str)
            .collect();
        hint.push_str(&format!("; {}", allowed.join("/")));
    }
    hint.push(')');
    hint
}

/// Error produced when parsing answers from the user.
#[derive(Debug)]
pub struct AnswerParseError {
    pub user_message: String,
    pub debug_message: Option<String>,
}

impl AnswerParseError {
    pub fn new(user_message: impl Into<String>, debug_message: Option<String>) -> Self {
        Self {
            user_message: user_message.into(),
            debug_message,
        }
    }
}

fn encode_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{:02x}", byte)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn question(kind: QuestionType, choices: Option<Vec<String>>) -> RenderQuestion {
        RenderQuestion {
            id: "q".into(),
            label: "Question".into(),
            description: None,
            kind,
            required: true,
            choices,
            current_value: None,
        }
    }

    fn progress() -> Progress {
        Progress {
            step_index: 0,
            total_steps: 2,
            percent: 0.0,
            answered: 2,
            total_questions: 5,
            documents_ratio: 1.0,
            done: false,
        }
    }

    #[test]
    fn prompt_numbers_questions_and_lists_choices() {
        let choices = vec!["public".to_string(), "private".to_string()];
        let prompt = PromptContext::new(
            &question(QuestionType::SingleChoice, Some(choices)),
            &progress(),
            None,
        );
        assert_eq!(prompt.index, 3);
        assert_eq!(prompt.total, 5);
        assert_eq!(prompt.hint.as_deref(), Some("(public/private)"));
    }

    #[test]
    fn upload_prompts_name_the_requirement() {
        let requirement = FileRequirement {
            slug: "badge_export".into(),
            label: "Badge export".into(),
            allowed_extensions: ["csv".to_string(), "xlsx".to_string()].into_iter().collect(),
            max_size_bytes: 1024,
            required: false,
        };
        let prompt = PromptContext::new(
            &question(QuestionType::File, None),
            &progress(),
            Some(&requirement),
        );
        assert_eq!(prompt.title, "Question: Badge export");
        assert!(prompt.required);
        assert_eq!(prompt.hint.as_deref(), Some("(path to file; csv/xlsx)"));
    }

    #[test]
    fn hex_encoding_is_lowercase_pairs() {
        assert_eq!(encode_hex(&[0x0a, 0xff]), "0aff");
    }
}
