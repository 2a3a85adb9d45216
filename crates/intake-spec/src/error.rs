use thiserror::Error;

use crate::config::ConfigError;
use crate::documents::UploadRejection;
use crate::persist::PersistenceError;
use crate::schema::SchemaError;
use crate::sequencer::NavigationDenied;
use crate::session::{EditError, SessionError};
use crate::submit::{SubmissionError, SubmitError, ValidationIncomplete};

/// Every failure the engine can report, for callers that want one type.
#[derive(Debug, Error)]
pub enum IntakeError {
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    NavigationDenied(#[from] NavigationDenied),
    #[error(transparent)]
    ValidationIncomplete(#[from] ValidationIncomplete),
    #[error(transparent)]
    Edit(#[from] EditError),
    #[error(transparent)]
    Upload(#[from] UploadRejection),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    SubmissionFailure(#[from] SubmissionError),
    #[error("this questionnaire has already been submitted")]
    AlreadySubmitted,
}

impl From<SubmitError> for IntakeError {
    fn from(err: SubmitError) -> Self {
        match err {
            SubmitError::ValidationIncomplete(incomplete) => IntakeError::ValidationIncomplete(incomplete),
            SubmitError::SubmissionFailure(failure) => IntakeError::SubmissionFailure(failure),
            SubmitError::AlreadySubmitted => IntakeError::AlreadySubmitted,
        }
    }
}
