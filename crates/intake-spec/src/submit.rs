//! Hand-off of a completed answer set to the case system.

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::answers::AnswerSet;
use crate::validate::ValidationError;

#[derive(Debug, Error)]
pub enum SubmissionError {
    #[error("submission rejected: {0}")]
    Rejected(String),
    #[error("submission timed out after {}ms", .0.as_millis())]
    TimedOut(Duration),
    #[error("submission transport failed: {0}")]
    Transport(String),
}

/// Receives the final answer set. Called at most once per successful
/// terminal transition; the engine never retries.
#[async_trait]
pub trait Submission: Send + Sync {
    async fn submit(&self, case_id: &str, answers: &AnswerSet) -> Result<(), SubmissionError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubmitOptions {
    pub timeout: Option<Duration>,
}

impl SubmitOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }
}

/// Unmet requirements that block submission.
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[error(
    "{} requirement(s) unmet; first at step '{}'",
    .unmet.len(),
    .first_step.as_deref().unwrap_or("?")
)]
pub struct ValidationIncomplete {
    pub unmet: Vec<ValidationError>,
    pub first_step: Option<String>,
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error(transparent)]
    ValidationIncomplete(#[from] ValidationIncomplete),
    #[error("submission failed: {0}")]
    SubmissionFailure(#[from] SubmissionError),
    #[error("this questionnaire has already been submitted")]
    AlreadySubmitted,
}

/// Runs the collaborator once, bounded by the caller's timeout.
pub async fn dispatch(
    collaborator: &dyn Submission,
    case_id: &str,
    answers: &AnswerSet,
    options: SubmitOptions,
) -> Result<(), SubmissionError> {
    match options.timeout {
        Some(limit) => tokio::time::timeout(limit, collaborator.submit(case_id, answers))
            .await
            .map_err(|_| SubmissionError::TimedOut(limit))?,
        None => collaborator.submit(case_id, answers).await,
    }
}

/// Writes each submission to `<dir>/<case_id>.json`.
#[derive(Debug, Clone)]
pub struct OutboxSubmission {
    dir: PathBuf,
}

impl OutboxSubmission {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, case_id: &str) -> PathBuf {
        let name: String = case_id
            .chars()
            .map(|ch| if ch.is_ascii_alphanumeric() || ch == '-' { ch } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", name))
    }
}

#[async_trait]
impl Submission for OutboxSubmission {
    async fn submit(&self, case_id: &str, answers: &AnswerSet) -> Result<(), SubmissionError> {
        let path = self.path_for(case_id);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(SubmissionError::Rejected(format!(
                "case '{}' already has a submission",
                case_id
            )));
        }
        let body = answers
            .to_json_pretty()
            .map_err(|err| SubmissionError::Transport(err.to_string()))?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|err| SubmissionError::Transport(err.to_string()))?;
        tokio::fs::write(&path, body)
            .await
            .map_err(|err| SubmissionError::Transport(err.to_string()))?;
        info!(case_id, path = %path.display(), "submission written to outbox");
        Ok(())
    }
}

/// Records every submission in memory.
#[derive(Debug, Default)]
pub struct MemorySubmission {
    received: Mutex<Vec<(String, AnswerSet)>>,
}

impl MemorySubmission {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn received(&self) -> Vec<(String, AnswerSet)> {
        self.received
            .lock()
            .map(|received| received.clone())
            .unwrap_or_default()
    }

    pub fn count(&self) -> usize {
        self.received().len()
    }
}

#[async_trait]
impl Submission for MemorySubmission {
    async fn submit(&self, case_id: &str, answers: &AnswerSet) -> Result<(), SubmissionError> {
        let mut received = self
            .received
            .lock()
            .map_err(|_| SubmissionError::Transport("recorder poisoned".into()))?;
        received.push((case_id.to_string(), answers.clone()));
        Ok(())
    }
}
