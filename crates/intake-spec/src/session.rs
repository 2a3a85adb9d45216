use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::answers::{AnswerSet, UploadedFile};
use crate::config::IntakeConfig;
use crate::documents::{self, ExpectedDocument, UploadRejection};
use crate::persist::{Persistence, PersistenceError};
use crate::progress::{self, Progress};
use crate::render::{StepView, build_view};
use crate::schema::Schema;
use crate::sequencer::{NavigationDenied, Position, StepSequencer};
use crate::spec::{FileRequirement, QuestionType, SectionSpec, StepSpec};
use crate::store::AnswerStore;
use crate::submit::{SubmitError, SubmitOptions, Submission, ValidationIncomplete, dispatch};
use crate::validate::{self, ValidationResult, validate_step};
use crate::visibility;
use crate::writer::{PersistenceWriter, SaveStatus};

#[derive(Debug, Error)]
pub enum EditError {
    #[error("the questionnaire has been submitted and can no longer change")]
    Finished,
    #[error("unknown step '{0}'")]
    UnknownStep(String),
    #[error("step '{step}' has no question '{field}'")]
    UnknownField { step: String, field: String },
    #[error("'{step}.{field}' expects a {expected} answer")]
    TypeMismatch {
        step: String,
        field: String,
        expected: &'static str,
    },
    #[error(transparent)]
    Upload(#[from] UploadRejection),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("stored answers belong to questionnaire '{found}', expected '{expected}'")]
    QuestionnaireMismatch { expected: String, found: String },
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// One applicant run: the schema, the answers, and the navigation state.
pub struct IntakeSession {
    schema: Arc<Schema>,
    store: AnswerStore,
    sequencer: StepSequencer,
    config: IntakeConfig,
}

impl IntakeSession {
    pub fn new(schema: Arc<Schema>, config: IntakeConfig) -> Self {
        let answers = AnswerSet::new(schema.id(), schema.version());
        let sequencer = StepSequencer::start(&schema, &answers);
        Self {
            schema,
            store: AnswerStore::new(answers),
            sequencer,
            config,
        }
    }

    /// Continues a run from an answer set alone.
    pub fn with_answers(
        schema: Arc<Schema>,
        answers: AnswerSet,
        config: IntakeConfig,
    ) -> Result<Self, SessionError> {
        if answers.questionnaire_id != schema.id() {
            return Err(SessionError::QuestionnaireMismatch {
                expected: schema.id().to_string(),
                found: answers.questionnaire_id,
            });
        }
        if answers.spec_version != schema.version() {
            warn!(
                stored = %answers.spec_version,
                current = %schema.version(),
                "resuming answers recorded against another schema version"
            );
        }
        let sequencer = StepSequencer::resume(&schema, &answers);
        Ok(Self {
            schema,
            store: AnswerStore::new(answers),
            sequencer,
            config,
        })
    }

    /// Loads the stored answers for `key` (or starts fresh) and keeps them
    /// persisted through a debounced writer.
    pub async fn resume(
        schema: Arc<Schema>,
        key: &str,
        backend: Arc<dyn Persistence>,
        config: IntakeConfig,
    ) -> Result<Self, SessionError> {
        let mut session = match backend.load(key).await? {
            Some(answers) => {
                debug!(key, version = answers.version, "resuming stored answers");
                Self::with_answers(schema, answers, config)?
            }
            None => Self::new(schema, config),
        };
        session.attach_persistence(backend, key);
        Ok(session)
    }

    pub fn attach_persistence(&mut self, backend: Arc<dyn Persistence>, key: &str) {
        let writer = PersistenceWriter::spawn(
            backend,
            key,
            self.config.writer(),
            self.store.answers().version,
        );
        self.store.attach(writer);
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn answers(&self) -> &AnswerSet {
        self.store.answers()
    }

    pub fn config(&self) -> &IntakeConfig {
        &self.config
    }

    pub fn merge(&mut self, step: &str, partial: Map<String, Value>) -> Result<&AnswerSet, EditError> {
        self.ensure_editable()?;
        let step_spec = self
            .schema
            .step(step)
            .ok_or_else(|| EditError::UnknownStep(step.to_string()))?;

        let mut normalized = Map::new();
        for (field, value) in partial {
            let location = self.schema.question(step, &field).ok_or_else(|| {
                EditError::UnknownField {
                    step: step_spec.id.clone(),
                    field: field.clone(),
                }
            })?;
            let kind = location.question.kind;
            if !value.is_null() && !validate::matches_type(kind, &value) {
                return Err(EditError::TypeMismatch {
                    step: step_spec.id.clone(),
                    field,
                    expected: kind.as_str(),
                });
            }
            let value = match (kind, value) {
                (QuestionType::MultiChoice, Value::Array(items)) => Value::Array(dedup(items)),
                (_, value) => value,
            };
            normalized.insert(field, value);
        }

        self.store.merge(step, normalized);
        self.sequencer.settle(&self.schema, self.store.answers());
        Ok(self.store.answers())
    }

    pub fn clear(&mut self, step: &str, field: &str) -> Result<bool, EditError> {
        self.ensure_editable()?;
        if self.schema.step(step).is_none() {
            return Err(EditError::UnknownStep(step.to_string()));
        }
        let removed = self.store.clear(step, field);
        self.sequencer.settle(&self.schema, self.store.answers());
        Ok(removed)
    }

    /// Records upload metadata after checking it against the expected
    /// requirement.
    pub fn record_upload(&mut self, file: UploadedFile) -> Result<FileRequirement, EditError> {
        self.ensure_editable()?;
        let requirement = documents::accept_upload(&self.schema, self.store.answers(), &file)?;
        self.store.record_upload(file);
        Ok(requirement)
    }

    pub fn remove_upload(&mut self, slug: &str) -> Result<Option<UploadedFile>, EditError> {
        self.ensure_editable()?;
        Ok(self.store.remove_upload(slug))
    }

    pub fn visible_sections(&self) -> Vec<&SectionSpec> {
        visibility::visible_sections(&self.schema, self.store.answers())
    }

    pub fn visible_steps(&self) -> Vec<&StepSpec> {
        visibility::visible_steps(&self.schema, self.store.answers())
    }

    pub fn expected_documents(&self) -> Vec<ExpectedDocument> {
        documents::expected_documents(&self.schema, self.store.answers())
    }

    /// Uploads kept for requirements the current answers hide.
    pub fn hidden_uploads(&self) -> Vec<String> {
        documents::orphaned_uploads(&self.schema, self.store.answers())
    }

    pub fn document_completion(&self) -> f64 {
        documents::completion_ratio(&self.expected_documents(), self.store.answers())
    }

    pub fn should_warn_incomplete_documents(&self) -> bool {
        self.document_completion() < self.config.completion_warning_threshold
    }

    pub fn current_step(&self) -> Option<&StepSpec> {
        self.sequencer.current(&self.schema, self.store.answers())
    }

    pub fn position(&self) -> Option<Position> {
        self.sequencer.position(&self.schema, self.store.answers())
    }

    pub fn is_submitted(&self) -> bool {
        self.sequencer.is_done()
    }

    pub fn step_validity(&self, step: &str) -> Option<ValidationResult> {
        let step = self.schema.step(step)?;
        Some(validate_step(&self.schema, step, self.store.answers()))
    }

    pub fn validate(&self) -> ValidationResult {
        validate::validate(&self.schema, self.store.answers())
    }

    pub fn progress(&self) -> Progress {
        progress::compute(&self.schema, self.store.answers(), &self.sequencer)
    }

    pub fn view(&self) -> StepView {
        build_view(&self.schema, self.store.answers(), &self.sequencer, &self.config)
    }

    pub fn go_to(&mut self, step: &str) -> Result<(), NavigationDenied> {
        self.sequencer.go_to(&self.schema, self.store.answers(), step)
    }

    pub fn advance(&mut self) -> Result<String, NavigationDenied> {
        self.sequencer
            .advance(&self.schema, self.store.answers())
            .map(str::to_string)
    }

    pub fn retreat(&mut self) -> Result<String, NavigationDenied> {
        self.sequencer
            .retreat(&self.schema, self.store.answers())
            .map(str::to_string)
    }

    /// Validates everything, hands the answers to `collaborator` exactly
    /// once, and on success ends the run. A failed attempt leaves the answers
    /// untouched.
    pub async fn submit(
        &mut self,
        case_id: &str,
        collaborator: &dyn Submission,
        options: SubmitOptions,
    ) -> Result<(), SubmitError> {
        if self.sequencer.is_done() {
            return Err(SubmitError::AlreadySubmitted);
        }
        let result = self.validate();
        if !result.valid {
            let first_step = result.first_step(&self.schema);
            debug!(unmet = result.errors.len(), first_step = ?first_step, "submit blocked");
            return Err(ValidationIncomplete {
                unmet: result.errors,
                first_step,
            }
            .into());
        }

        let options = SubmitOptions {
            timeout: options.timeout.or(self.config.submit_timeout()),
        };
        if let Err(err) = dispatch(collaborator, case_id, self.store.answers(), options).await {
            warn!(case_id, error = %err, "submission failed; answers kept");
            return Err(err.into());
        }

        self.store.mark_submitted(Utc::now());
        self.sequencer.finish();
        info!(case_id, version = self.store.answers().version, "questionnaire submitted");
        if let Err(err) = self.flush().await {
            warn!(case_id, error = %err, "could not persist submitted answers");
        }
        Ok(())
    }

    pub fn save_status(&self) -> SaveStatus {
        self.store
            .writer()
            .map(PersistenceWriter::status)
            .unwrap_or(SaveStatus::Idle)
    }

    pub async fn flush(&self) -> Result<(), PersistenceError> {
        match self.store.writer() {
            Some(writer) => writer.flush().await,
            None => Ok(()),
        }
    }

    /// Persists the last answers, stops the writer, and returns the answers.
    pub async fn close(mut self) -> Result<AnswerSet, PersistenceError> {
        if let Some(writer) = self.store.detach() {
            writer.shutdown().await?;
        }
        Ok(self.store.snapshot())
    }

    fn ensure_editable(&self) -> Result<(), EditError> {
        if self.sequencer.is_done() {
            Err(EditError::Finished)
        } else {
            Ok(())
        }
    }
}

fn dedup(items: Vec<Value>) -> Vec<Value> {
    let mut unique: Vec<Value> = Vec::with_capacity(items.len());
    for item in items {
        if !unique.contains(&item) {
            unique.push(item);
        }
    }
    unique
}
