use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use intake_spec::{
    AnswerSet, EditError, ErrorCode, IntakeConfig, IntakeSession, MemorySubmission, Schema,
    SubmissionError, Submission, SubmitError, SubmitOptions, UploadRejection, UploadedFile,
};

const CLAIMS: &str = include_str!("fixtures/claims_intake.json");

fn schema() -> Arc<Schema> {
    Arc::new(Schema::from_json(CLAIMS).expect("fixture loads"))
}

fn partial(value: Value) -> Map<String, Value> {
    value.as_object().cloned().expect("object")
}

fn section_ids(session: &IntakeSession) -> Vec<String> {
    session
        .visible_sections()
        .iter()
        .map(|section| section.id.clone())
        .collect()
}

fn document_slugs(session: &IntakeSession) -> Vec<String> {
    session
        .expected_documents()
        .into_iter()
        .map(|document| document.requirement.slug)
        .collect()
}

fn fill_basics(session: &mut IntakeSession) {
    session
        .merge(
            "personal",
            partial(json!({ "fullName": "Ada Lovelace", "email": "ada@example.org" })),
        )
        .unwrap();
    session
        .merge("review", partial(json!({ "consent": true })))
        .unwrap();
}

#[tokio::test]
async fn overtime_claim_requires_badge_export_before_submission() {
    let mut session = IntakeSession::new(schema(), IntakeConfig::default());
    assert_eq!(section_ids(&session), vec!["personal", "claims", "review"]);

    fill_basics(&mut session);
    session
        .merge("claims", partial(json!({ "claimTypes": ["overtime"] })))
        .unwrap();
    assert_eq!(
        section_ids(&session),
        vec!["personal", "claims", "overtime-details", "review"]
    );
    assert_eq!(document_slugs(&session), vec!["badge_export", "payslips"]);

    session
        .merge("overtime-details", partial(json!({ "hoursPerWeek": 12 })))
        .unwrap();

    let collaborator = MemorySubmission::new();
    let before = session.answers().clone();
    let err = session
        .submit("case-100", &collaborator, SubmitOptions::default())
        .await
        .unwrap_err();
    let SubmitError::ValidationIncomplete(incomplete) = err else {
        panic!("expected validation failure, got {err}");
    };
    let slugs: Vec<&str> = incomplete
        .unmet
        .iter()
        .filter_map(|error| error.document.as_deref())
        .collect();
    assert_eq!(slugs, vec!["badge_export"]);
    assert_eq!(incomplete.first_step.as_deref(), Some("overtime-details"));
    assert_eq!(incomplete.unmet[0].code, ErrorCode::MissingDocument);
    assert_eq!(session.answers(), &before);
    assert_eq!(collaborator.count(), 0);

    session
        .record_upload(UploadedFile::new("badge_export", "badges.csv", 2048, "csv"))
        .unwrap();
    assert_eq!(session.document_completion(), 0.5);
    assert!(session.should_warn_incomplete_documents());

    session
        .submit("case-100", &collaborator, SubmitOptions::default())
        .await
        .unwrap();
    assert_eq!(collaborator.count(), 1);

    let (case_id, submitted) = collaborator.received().remove(0);
    assert_eq!(case_id, "case-100");
    assert!(submitted.has_upload("badge_export"));
    assert_eq!(
        submitted.get("claims", "claimTypes"),
        Some(&json!(["overtime"]))
    );
    assert!(session.answers().is_submitted());
    assert_eq!(session.progress().percent, 1.0);
}

#[test]
fn hidden_answers_are_kept_but_ignored() {
    let mut session = IntakeSession::new(schema(), IntakeConfig::default());
    fill_basics(&mut session);
    session
        .merge("claims", partial(json!({ "claimTypes": ["overtime"] })))
        .unwrap();
    session
        .merge("overtime-details", partial(json!({ "hoursPerWeek": 400 })))
        .unwrap();
    assert!(!session.validate().valid);

    session
        .merge("claims", partial(json!({ "claimTypes": ["dismissal"] })))
        .unwrap();
    assert_eq!(
        session.answers().get("overtime-details", "hoursPerWeek"),
        Some(&json!(400))
    );
    assert!(!document_slugs(&session).contains(&"badge_export".to_string()));

    let result = session.validate();
    assert!(result.errors.iter().all(|error| error.step != "overtime-details"));
    assert_eq!(result.missing_required(), vec!["dismissal-details.dismissalDate"]);
}

#[test]
fn required_if_follows_answers() {
    let mut session = IntakeSession::new(schema(), IntakeConfig::default());
    fill_basics(&mut session);
    session
        .merge("claims", partial(json!({ "claimTypes": ["dismissal"] })))
        .unwrap();
    session
        .merge(
            "dismissal-details",
            partial(json!({ "dismissalDate": "2024-03-01", "stillEmployed": true })),
        )
        .unwrap();
    assert!(session.validate().valid);

    session
        .merge("dismissal-details", partial(json!({ "stillEmployed": false })))
        .unwrap();
    let result = session.validate();
    assert_eq!(result.missing_documents(), vec!["dismissal_letter"]);
}

#[test]
fn uploads_for_hidden_or_unknown_requirements_are_refused() {
    let mut session = IntakeSession::new(schema(), IntakeConfig::default());
    session
        .merge("claims", partial(json!({ "claimTypes": ["dismissal"] })))
        .unwrap();

    let err = session
        .record_upload(UploadedFile::new("badge_export", "badges.csv", 10, "csv"))
        .unwrap_err();
    assert!(matches!(
        err,
        EditError::Upload(UploadRejection::NotExpected(_))
    ));

    let err = session
        .record_upload(UploadedFile::new("dismissal_letter", "letter.docx", 10, "docx"))
        .unwrap_err();
    assert!(matches!(
        err,
        EditError::Upload(UploadRejection::ExtensionNotAllowed { .. })
    ));
    assert!(session.answers().uploads.is_empty());
}

struct Rejecting;

#[async_trait]
impl Submission for Rejecting {
    async fn submit(&self, _: &str, _: &AnswerSet) -> Result<(), SubmissionError> {
        Err(SubmissionError::Rejected("case system unavailable".into()))
    }
}

struct Slow;

#[async_trait]
impl Submission for Slow {
    async fn submit(&self, _: &str, _: &AnswerSet) -> Result<(), SubmissionError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(())
    }
}

fn complete_session() -> IntakeSession {
    let mut session = IntakeSession::new(schema(), IntakeConfig::default());
    fill_basics(&mut session);
    session
        .merge("claims", partial(json!({ "claimTypes": ["other"], "otherDetails": "Unpaid bonus" })))
        .unwrap();
    assert!(session.validate().valid);
    session
}

#[tokio::test]
async fn failed_submission_leaves_answers_untouched() {
    let mut session = complete_session();
    let before = session.answers().clone();

    let err = session
        .submit("case-9", &Rejecting, SubmitOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, SubmitError::SubmissionFailure(SubmissionError::Rejected(_))));
    assert_eq!(session.answers(), &before);
    assert!(!session.is_submitted());

    let collaborator = MemorySubmission::new();
    session
        .submit("case-9", &collaborator, SubmitOptions::default())
        .await
        .unwrap();
    assert_eq!(collaborator.count(), 1);
}

#[tokio::test(start_paused = true)]
async fn slow_collaborator_times_out() {
    let mut session = complete_session();
    let before = session.answers().clone();
    let err = session
        .submit("case-3", &Slow, SubmitOptions::with_timeout(Duration::from_secs(5)))
        .await
        .unwrap_err();
    assert!(matches!(err, SubmitError::SubmissionFailure(SubmissionError::TimedOut(_))));
    assert_eq!(session.answers(), &before);
}

#[test]
fn view_renders_current_step_with_templated_description() {
    let mut session = IntakeSession::new(schema(), IntakeConfig::default());
    fill_basics(&mut session);
    session.advance().unwrap();
    let view = session.view();
    assert_eq!(view.step_id.as_deref(), Some("claims"));
    assert_eq!(
        view.sections[0].description.as_deref(),
        Some("Select everything that applies, Ada Lovelace.")
    );
    assert_eq!(view.progress.total_steps, 3);
    assert_eq!(view.progress.percent, 0.5);
}
