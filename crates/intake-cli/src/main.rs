mod telemetry;
mod wizard;

use std::collections::BTreeSet;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use component_intake::{
    expected_documents as intake_documents, get_answer_schema, validate_answers,
};
use intake_spec::{
    AnswerSet, DenialReason, ErrorCode, FilePersistence, FileRequirement, IntakeConfig,
    IntakeSession, OutboxSubmission, Persistence, QuestionType, RenderQuestion, Schema, StepView,
    SubmitError, SubmitOptions, UploadedFile, ValidationResult, authoring_schema, render_json_ui,
};
use serde_json::{Map, Number, Value, json};
use tracing::{debug, info};
use wizard::{AnswerParseError, PromptContext, Verbosity, WizardPresenter};

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

#[derive(Parser)]
#[command(
    author,
    version,
    about = "Conditional intake questionnaire CLI",
    long_about = "Runs intake questionnaires step by step, checks questionnaire definitions, and validates or submits stored answers"
)]
struct Cli {
    /// Log filter used when RUST_LOG is not set.
    #[arg(long, global = true, env = telemetry::LOG_ENV, default_value = "warn")]
    log: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum RenderMode {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Load a questionnaire definition and summarize its steps and documents.
    Check {
        /// Path to the questionnaire JSON.
        #[arg(long, value_name = "SPEC")]
        spec: PathBuf,
    },
    /// Print the JSON Schema of the currently visible answers, or of the
    /// questionnaire format itself.
    Schema {
        #[arg(long, value_name = "SPEC", required_unless_present = "authoring")]
        spec: Option<PathBuf>,
        /// Stored answers used to resolve visibility.
        #[arg(long, value_name = "ANSWERS")]
        answers: Option<PathBuf>,
        /// Emit the schema of the questionnaire definition format.
        #[arg(long, conflicts_with = "spec")]
        authoring: bool,
    },
    /// Validate stored answers against a questionnaire.
    Validate {
        #[arg(long, value_name = "SPEC")]
        spec: PathBuf,
        #[arg(long, value_name = "ANSWERS")]
        answers: PathBuf,
    },
    /// List the documents the stored answers call for.
    Documents {
        #[arg(long, value_name = "SPEC")]
        spec: PathBuf,
        #[arg(long, value_name = "ANSWERS")]
        answers: Option<PathBuf>,
    },
    /// Run a questionnaire interactively, resuming saved progress.
    Run(RunArgs),
    /// Submit stored answers to the outbox.
    Submit {
        #[arg(long, value_name = "SPEC")]
        spec: PathBuf,
        #[arg(long, value_name = "ANSWERS")]
        answers: PathBuf,
        /// Case identifier handed to the case system.
        #[arg(long)]
        case: String,
        #[arg(long, value_name = "DIR", env = "INTAKE_OUTBOX_DIR", default_value = ".intake/outbox")]
        outbox_dir: PathBuf,
        /// Give up on the submission after this many milliseconds.
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
}

#[derive(Args)]
struct RunArgs {
    #[arg(long, value_name = "SPEC")]
    spec: PathBuf,
    /// Case identifier; also the key of the saved progress.
    #[arg(long, default_value = "local")]
    case: String,
    #[arg(long, value_name = "DIR", env = "INTAKE_STORE_DIR", default_value = ".intake/answers")]
    store_dir: PathBuf,
    #[arg(long, value_name = "DIR", env = "INTAKE_OUTBOX_DIR", default_value = ".intake/outbox")]
    outbox_dir: PathBuf,
    /// Show verbose output (statuses, visible questions, documents).
    #[arg(long, alias = "debug")]
    verbose: bool,
    /// Also emit answer JSON after submission.
    #[arg(long)]
    answers_json: bool,
    #[arg(long, value_enum, default_value_t = RenderMode::Text)]
    format: RenderMode,
}

#[tokio::main]
async fn main() -> CliResult<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    telemetry::init(&cli.log)?;
    let config = IntakeConfig::from_env()?;
    debug!(?config, "configuration loaded");

    match cli.command {
        Command::Check { spec } => run_check(&spec),
        Command::Schema {
            spec,
            answers,
            authoring,
        } => run_schema(spec.as_deref(), answers.as_deref(), authoring),
        Command::Validate { spec, answers } => run_validate(&spec, &answers),
        Command::Documents { spec, answers } => run_documents(&spec, answers.as_deref()),
        Command::Run(args) => run_wizard(args, config).await,
        Command::Submit {
            spec,
            answers,
            case,
            outbox_dir,
            timeout_ms,
        } => run_submit(&spec, &answers, &case, outbox_dir, timeout_ms, config).await,
    }
}

fn load_spec(path: &Path) -> CliResult<(Schema, String)> {
    let raw = fs::read_to_string(path)?;
    let schema = Schema::from_json(&raw)?;
    Ok((schema, raw))
}

fn component_config(raw_spec: &str) -> String {
    json!({ "questionnaire_json": raw_spec }).to_string()
}

fn read_answers(path: Option<&Path>) -> CliResult<String> {
    match path {
        Some(path) => Ok(fs::read_to_string(path)?),
        None => Ok(String::new()),
    }
}

fn parse_component_result(response: &str) -> CliResult<Value> {
    let value: Value = serde_json::from_str(response)?;
    if let Some(error) = value.get("error").and_then(Value::as_str) {
        Err(error.into())
    } else {
        Ok(value)
    }
}

fn run_check(spec_path: &Path) -> CliResult<()> {
    let (schema, _) = load_spec(spec_path)?;
    println!(
        "Questionnaire: {} ({}, version {})",
        schema.title(),
        schema.id(),
        schema.version()
    );
    println!("Steps:");
    for step in schema.steps() {
        let conditional = step
            .sections
            .iter()
            .filter_map(|id| schema.section(id))
            .all(|section| !section.always_shown);
        let mut entry = format!(" - {} ({}): {}", step.label, step.id, step.sections.join(", "));
        if conditional {
            entry.push_str(" [conditional]");
        }
        if !step.next.is_empty() {
            entry.push_str(&format!(" [{} jump rule(s)]", step.next.len()));
        }
        println!("{}", entry);
    }

    let requirements: Vec<&FileRequirement> = schema
        .questions()
        .flat_map(|location| location.question.file_requirements.iter())
        .collect();
    if !requirements.is_empty() {
        println!("Documents:");
        for requirement in requirements {
            let allowed: Vec<&str> = requirement
                .allowed_extensions
                .iter()
                .map(String::as_str)
                .collect();
            println!(
                " - {} [{}]: {} up to {} bytes{}",
                requirement.label,
                requirement.slug,
                if allowed.is_empty() { "any".to_string() } else { allowed.join("/") },
                requirement.max_size_bytes,
                if requirement.required { " (required)" } else { "" }
            );
        }
    }
    Ok(())
}

fn run_schema(spec: Option<&Path>, answers: Option<&Path>, authoring: bool) -> CliResult<()> {
    let schema = match spec {
        Some(path) if !authoring => {
            let (schema, raw) = load_spec(path)?;
            let answers_json = read_answers(answers)?;
            parse_component_result(&get_answer_schema(
                schema.id(),
                &component_config(&raw),
                &answers_json,
            ))?
        }
        _ => authoring_schema(),
    };
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(())
}

fn run_validate(spec_path: &Path, answers_path: &Path) -> CliResult<()> {
    let (schema, raw) = load_spec(spec_path)?;
    let answers_json = fs::read_to_string(answers_path)?;
    let response = parse_component_result(&validate_answers(
        schema.id(),
        &component_config(&raw),
        &answers_json,
    ))?;
    let result: ValidationResult = serde_json::from_value(response)?;

    println!(
        "Validation result: {}",
        if result.valid { "valid" } else { "invalid" }
    );
    describe_validation(&result);

    if result.valid {
        Ok(())
    } else {
        Err("validation failed".into())
    }
}

fn describe_validation(result: &ValidationResult) {
    if !result.errors.is_empty() {
        println!("Errors:");
        for error in &result.errors {
            println!("  {} - {}", error.path, error.message);
        }
    }
    let missing = result.missing_required();
    if !missing.is_empty() {
        println!("Missing required answers: {}", missing.join(", "));
    }
    let documents = result.missing_documents();
    if !documents.is_empty() {
        println!("Missing documents: {}", documents.join(", "));
    }
    if !result.unknown_fields.is_empty() {
        println!(
            "Unknown answer fields: {}",
            result.unknown_fields.join(", ")
        );
    }
}

fn run_documents(spec_path: &Path, answers_path: Option<&Path>) -> CliResult<()> {
    let (schema, raw) = load_spec(spec_path)?;
    let answers_json = read_answers(answers_path)?;
    let response = parse_component_result(&intake_documents(
        schema.id(),
        &component_config(&raw),
        &answers_json,
    ))?;

    let documents = response["documents"].as_array().cloned().unwrap_or_default();
    if documents.is_empty() {
        println!("No documents are expected for these answers.");
        return Ok(());
    }
    println!("Expected documents:");
    for document in &documents {
        let state = match (document["uploaded"].as_bool(), document["required"].as_bool()) {
            (Some(true), _) => "uploaded",
            (_, Some(true)) => "missing (required)",
            _ => "missing",
        };
        println!(
            " - {} [{}] in {}: {}",
            document["label"].as_str().unwrap_or_default(),
            document["slug"].as_str().unwrap_or_default(),
            document["step"].as_str().unwrap_or_default(),
            state
        );
    }
    let completion = response["completion"].as_f64().unwrap_or(0.0);
    println!("Completion: {:.0}%", completion * 100.0);
    if response["warn_incomplete"].as_bool().unwrap_or(false) {
        println!("Warning: several documents are still missing.");
    }
    Ok(())
}

async fn run_submit(
    spec_path: &Path,
    answers_path: &Path,
    case_id: &str,
    outbox_dir: PathBuf,
    timeout_ms: Option<u64>,
    config: IntakeConfig,
) -> CliResult<()> {
    let (schema, _) = load_spec(spec_path)?;
    let answers: AnswerSet = serde_json::from_str(&fs::read_to_string(answers_path)?)?;
    let mut session = IntakeSession::with_answers(Arc::new(schema), answers, config)?;
    let outbox = OutboxSubmission::new(outbox_dir);
    let options = SubmitOptions {
        timeout: timeout_ms.map(Duration::from_millis),
    };

    match session.submit(case_id, &outbox, options).await {
        Ok(()) => {
            println!(
                "Submitted case '{}' to {}",
                case_id,
                outbox.path_for(case_id).display()
            );
            Ok(())
        }
        Err(SubmitError::ValidationIncomplete(incomplete)) => {
            println!("Submission blocked: {}", incomplete);
            for error in &incomplete.unmet {
                println!("  {} - {}", error.path, error.message);
            }
            Err(incomplete.into())
        }
        Err(err) => Err(err.into()),
    }
}

enum Outcome {
    Submitted,
    Paused,
    AlreadySubmitted,
}

enum Reply {
    Value(Value),
    Skip,
    Back,
    Exit,
}

async fn run_wizard(args: RunArgs, config: IntakeConfig) -> CliResult<()> {
    let (schema, _) = load_spec(&args.spec)?;
    let files = FilePersistence::new(&args.store_dir);
    let store_path = files.path_for(&args.case);
    let backend: Arc<dyn Persistence> = Arc::new(files);
    let mut session = IntakeSession::resume(Arc::new(schema), &args.case, backend, config).await?;
    let outbox = OutboxSubmission::new(&args.outbox_dir);
    let mut presenter =
        WizardPresenter::new(Verbosity::from_verbose(args.verbose), args.answers_json);

    let outcome = drive(&mut session, &outbox, &args.case, &mut presenter, args.format).await;
    let answers = session.close().await?;
    match outcome? {
        Outcome::Submitted => presenter.show_completion(&answers, &outbox.path_for(&args.case)),
        Outcome::Paused => presenter.show_paused(&store_path),
        Outcome::AlreadySubmitted => println!("Case '{}' has already been submitted.", args.case),
    }
    Ok(())
}

async fn drive(
    session: &mut IntakeSession,
    outbox: &OutboxSubmission,
    case_id: &str,
    presenter: &mut WizardPresenter,
    format: RenderMode,
) -> CliResult<Outcome> {
    if session.is_submitted() {
        return Ok(Outcome::AlreadySubmitted);
    }
    let mut skipped: BTreeSet<(String, String)> = BTreeSet::new();
    let mut focus: Option<String> = None;

    loop {
        let view = session.view();
        if matches!(format, RenderMode::Json) {
            let ui = render_json_ui(&view, session.schema(), session.answers());
            println!("JSON UI:\n{}", serde_json::to_string_pretty(&ui)?);
        }
        presenter.show_header(&view);
        presenter.show_step(&view);
        let step = view
            .step_id
            .clone()
            .ok_or("no step is visible for the current answers")?;

        let target = focus.take().or_else(|| {
            view.next_question_id
                .clone()
                .filter(|id| !skipped.contains(&(step.clone(), id.clone())))
        });
        if let Some(question_id) = target {
            let question = find_question(&view, &question_id)
                .ok_or_else(|| format!("question '{}' is not on step '{}'", question_id, step))?;
            match ask(session, presenter, &view, &step, &question)? {
                Some(Asked::Exit) => return Ok(Outcome::Paused),
                Some(Asked::Skipped) => {
                    skipped.insert((step.clone(), question.id.clone()));
                }
                Some(Asked::Retry) => focus = Some(question.id.clone()),
                None => {}
            }
            continue;
        }

        match session.advance() {
            Ok(next) => debug!(step = %next, "wizard advanced"),
            Err(denied) if denied.reason == DenialReason::NoFurtherStep => {
                if let Some(outcome) =
                    finish(session, outbox, case_id, presenter, &mut focus).await?
                {
                    return Ok(outcome);
                }
            }
            Err(denied) => {
                presenter.show_denied(&denied);
                focus = denied
                    .blocking
                    .iter()
                    .find_map(|error| error.question_id.clone());
                if focus.is_none() {
                    return Err(denied.into());
                }
            }
        }
    }
}

enum Asked {
    Skipped,
    Retry,
    Exit,
}

/// Prompts for one question (or one pending upload of a file question) and
/// applies the reply to the session.
fn ask(
    session: &mut IntakeSession,
    presenter: &WizardPresenter,
    view: &StepView,
    step: &str,
    question: &RenderQuestion,
) -> CliResult<Option<Asked>> {
    let upload = if question.kind == QuestionType::File {
        match pending_upload(session, step, &question.id) {
            Some(requirement) => Some(requirement),
            None => return Ok(Some(Asked::Skipped)),
        }
    } else {
        None
    };
    let prompt = PromptContext::new(question, &view.progress, upload.as_ref());
    let reply = match &upload {
        Some(_) => read_reply(&prompt, presenter, |raw| parse_path(prompt.required, raw))?,
        None => read_reply(&prompt, presenter, |raw| parse_answer(question, raw))?,
    };

    match reply {
        Reply::Exit => Ok(Some(Asked::Exit)),
        Reply::Back => {
            if let Err(denied) = session.retreat() {
                presenter.show_denied(&denied);
            }
            Ok(None)
        }
        Reply::Skip => {
            if upload.is_none() {
                session.clear(step, &question.id)?;
            }
            Ok(Some(Asked::Skipped))
        }
        Reply::Value(value) => match upload {
            Some(requirement) => {
                let path = value.as_str().unwrap_or_default();
                let accepted = upload_from_path(&requirement.slug, Path::new(path))
                    .and_then(|file| Ok(session.record_upload(file)?));
                match accepted {
                    Ok(attached) => {
                        info!(slug = %attached.slug, "document attached");
                        Ok(None)
                    }
                    Err(err) => {
                        eprintln!("Upload refused: {}", err);
                        Ok(Some(Asked::Retry))
                    }
                }
            }
            None => {
                let mut partial = Map::new();
                partial.insert(question.id.clone(), value);
                session.merge(step, partial)?;
                let mut retry = false;
                if let Some(result) = session.step_validity(step) {
                    for error in result.errors.iter().filter(|error| {
                        error.question_id.as_deref() == Some(question.id.as_str())
                            && error.code != ErrorCode::MissingRequired
                    }) {
                        presenter.show_validation_error(error);
                        retry = true;
                    }
                }
                Ok(retry.then_some(Asked::Retry))
            }
        },
    }
}

async fn finish(
    session: &mut IntakeSession,
    outbox: &OutboxSubmission,
    case_id: &str,
    presenter: &WizardPresenter,
    focus: &mut Option<String>,
) -> CliResult<Option<Outcome>> {
    if session.should_warn_incomplete_documents() {
        presenter.show_document_warning(session.document_completion());
    }
    if !prompt_bool("Submit now?", true)? {
        return Ok(Some(Outcome::Paused));
    }

    match session.submit(case_id, outbox, SubmitOptions::default()).await {
        Ok(()) => Ok(Some(Outcome::Submitted)),
        Err(SubmitError::ValidationIncomplete(incomplete)) => {
            presenter.show_incomplete(&incomplete);
            if let Some(step) = &incomplete.first_step {
                if let Err(denied) = session.go_to(step) {
                    presenter.show_denied(&denied);
                    return Err(incomplete.into());
                }
                *focus = incomplete
                    .unmet
                    .iter()
                    .filter(|error| &error.step == step)
                    .find_map(|error| error.question_id.clone());
            }
            if focus.is_none() {
                return Err(incomplete.into());
            }
            Ok(None)
        }
        Err(err) => Err(err.into()),
    }
}

fn find_question(view: &StepView, question_id: &str) -> Option<RenderQuestion> {
    view.sections
        .iter()
        .flat_map(|section| section.questions.iter())
        .find(|question| question.id == question_id)
        .cloned()
}

fn pending_upload(session: &IntakeSession, step: &str, question_id: &str) -> Option<FileRequirement> {
    let location = session.schema().question(step, question_id)?;
    let open: Vec<&FileRequirement> = location
        .question
        .file_requirements
        .iter()
        .filter(|requirement| !session.answers().has_upload(&requirement.slug))
        .collect();
    open.iter()
        .find(|requirement| requirement.required)
        .or_else(|| open.first())
        .map(|requirement| (*requirement).clone())
}

fn upload_from_path(slug: &str, path: &Path) -> CliResult<UploadedFile> {
    let metadata = fs::metadata(path)?;
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or("path has no file name")?;
    let extension = path
        .extension()
        .and_then(|extension| extension.to_str())
        .unwrap_or_default();
    Ok(UploadedFile::new(slug, filename, metadata.len(), extension))
}

fn read_reply(
    prompt: &PromptContext,
    presenter: &WizardPresenter,
    parse: impl Fn(&str) -> Result<Option<Value>, AnswerParseError>,
) -> CliResult<Reply> {
    loop {
        presenter.show_prompt(prompt);
        let Some(input) = read_line("> ")? else {
            return Ok(Reply::Exit);
        };
        let trimmed = input.trim();
        if trimmed.eq_ignore_ascii_case("exit") {
            return Ok(Reply::Exit);
        }
        if trimmed.eq_ignore_ascii_case("back") {
            return Ok(Reply::Back);
        }
        match parse(trimmed) {
            Ok(Some(value)) => return Ok(Reply::Value(value)),
            Ok(None) => return Ok(Reply::Skip),
            Err(err) => presenter.show_parse_error(&err),
        }
    }
}

/// Reads one line from stdin; `None` at end of input.
fn read_line(prompt: &str) -> CliResult<Option<String>> {
    print!("{}", prompt);
    io::stdout().flush()?;
    let mut line = String::new();
    if io::stdin().read_line(&mut line)? == 0 {
        return Ok(None);
    }
    Ok(Some(line))
}

fn prompt_bool(prompt: &str, default: bool) -> CliResult<bool> {
    let suffix = if default { "[Y/n]" } else { "[y/N]" };
    loop {
        let Some(line) = read_line(&format!("{} {} ", prompt, suffix))? else {
            return Ok(false);
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Ok(default);
        }
        match parse_boolean(trimmed) {
            Ok(Value::Bool(flag)) => return Ok(flag),
            _ => println!("Please answer yes or no."),
        }
    }
}

fn parse_path(required: bool, raw: &str) -> Result<Option<Value>, AnswerParseError> {
    if raw.is_empty() {
        return if required {
            Err(AnswerParseError::new("This document is required.", None))
        } else {
            Ok(None)
        };
    }
    Ok(Some(Value::String(raw.to_string())))
}

fn parse_answer(question: &RenderQuestion, raw: &str) -> Result<Option<Value>, AnswerParseError> {
    let raw = raw.trim();
    if raw.is_empty() {
        if question.required {
            return Err(AnswerParseError::new(
                "This question requires an answer.",
                None,
            ));
        }
        return Ok(None);
    }

    let choices = question.choices.as_deref().unwrap_or_default();
    let value = match question.kind {
        QuestionType::Boolean => parse_boolean(raw)?,
        QuestionType::Number => parse_number(raw)?,
        QuestionType::SingleChoice => Value::String(parse_choice(choices, raw)?),
        QuestionType::MultiChoice => Value::Array(
            raw.split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(|item| parse_choice(choices, item).map(Value::String))
                .collect::<Result<_, _>>()?,
        ),
        _ => Value::String(raw.to_string()),
    };
    Ok(Some(value))
}

fn parse_boolean(raw: &str) -> Result<Value, AnswerParseError> {
    match raw.to_lowercase().as_str() {
        "true" | "t" | "yes" | "y" | "1" => Ok(Value::Bool(true)),
        "false" | "f" | "no" | "n" | "0" => Ok(Value::Bool(false)),
        _ => Err(AnswerParseError::new(
            "Please enter yes or no.",
            Some("expected boolean (y/n/true/false)".to_string()),
        )),
    }
}

fn parse_number(raw: &str) -> Result<Value, AnswerParseError> {
    if let Ok(integer) = raw.parse::<i64>() {
        return Ok(Value::Number(Number::from(integer)));
    }
    raw.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
        .ok_or_else(|| {
            AnswerParseError::new("Please enter a number.", Some("expected number".to_string()))
        })
}

/// Accepts a choice by value (case-insensitive) or by its 1-based position.
fn parse_choice(choices: &[String], raw: &str) -> Result<String, AnswerParseError> {
    if let Some(choice) = choices
        .iter()
        .find(|choice| choice.eq_ignore_ascii_case(raw))
    {
        return Ok(choice.clone());
    }
    if let Ok(index) = raw.parse::<usize>()
        && let Some(choice) = index.checked_sub(1).and_then(|index| choices.get(index))
    {
        return Ok(choice.clone());
    }
    Err(AnswerParseError::new(
        format!("'{}' is not one of the choices.", raw),
        Some(format!("one of: {}", choices.join(", "))),
    ))
}
