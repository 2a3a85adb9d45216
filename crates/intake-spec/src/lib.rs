#![allow(missing_docs)]

pub mod answers;
pub mod answers_schema;
pub mod config;
pub mod documents;
pub mod error;
pub mod expr;
pub mod persist;
pub mod progress;
pub mod render;
pub mod schema;
pub mod sequencer;
pub mod session;
pub mod spec;
pub mod store;
pub mod submit;
pub mod template;
pub mod validate;
pub mod visibility;
pub mod writer;

pub use answers::{AnswerSet, UploadedFile};
pub use answers_schema::{authoring_schema, generate as answers_schema};
pub use config::{ConfigError, IntakeConfig};
pub use documents::{
    ExpectedDocument, UploadRejection, check_upload, completion_ratio, expected_documents,
};
pub use error::IntakeError;
pub use expr::{Expr, FieldRef};
pub use persist::{FilePersistence, MemoryPersistence, Persistence, PersistenceError, SnapshotFormat};
pub use progress::{Progress, next_question};
pub use render::{
    RenderDocument, RenderQuestion, RenderSection, RenderStatus, StepView, build_view,
    render_json_ui, render_text,
};
pub use schema::{QuestionLocation, Schema, SchemaError};
pub use sequencer::{DenialReason, NavigationDenied, Position, StepSequencer};
pub use session::{EditError, IntakeSession, SessionError};
pub use spec::{
    Constraint, FileRequirement, NextRule, QuestionSpec, QuestionType, QuestionnaireSpec,
    SectionSpec, StepId, StepSpec,
};
pub use store::AnswerStore;
pub use submit::{
    MemorySubmission, OutboxSubmission, Submission, SubmissionError, SubmitError, SubmitOptions,
    ValidationIncomplete,
};
pub use template::LabelRenderer;
pub use validate::{ErrorCode, ValidationError, ValidationResult, validate, validate_step};
pub use visibility::{VisibilityMap, resolve_visibility, visible_questions, visible_sections};
pub use writer::{PersistenceWriter, SaveStatus, WriterConfig};
