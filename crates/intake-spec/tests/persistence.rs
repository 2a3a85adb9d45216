use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value, json};
use tempfile::tempdir;

use intake_spec::{
    AnswerSet, FilePersistence, IntakeConfig, IntakeSession, MemoryPersistence, Persistence,
    Position, SaveStatus, Schema, SnapshotFormat,
};

fn schema() -> Arc<Schema> {
    Arc::new(Schema::from_json(include_str!("fixtures/claims_intake.json")).expect("claims loads"))
}

fn partial(value: Value) -> Map<String, Value> {
    value.as_object().cloned().expect("object")
}

fn personal() -> Map<String, Value> {
    partial(json!({ "fullName": "Ada Lovelace", "email": "ada@example.org" }))
}

#[tokio::test]
async fn answers_survive_a_restart() {
    let dir = tempdir().unwrap();
    let backend: Arc<dyn Persistence> = Arc::new(FilePersistence::new(dir.path()));

    let mut session = IntakeSession::resume(schema(), "case-7", backend.clone(), IntakeConfig::default())
        .await
        .unwrap();
    session.merge("personal", personal()).unwrap();
    session.advance().unwrap();
    session
        .merge("claims", partial(json!({ "claimTypes": ["overtime"] })))
        .unwrap();
    let stored = session.close().await.unwrap();
    assert!(dir.path().join("case-7.json").exists());

    let resumed = IntakeSession::resume(schema(), "case-7", backend, IntakeConfig::default())
        .await
        .unwrap();
    assert_eq!(resumed.answers(), &stored);
    assert_eq!(
        resumed.position(),
        Some(Position::Step("overtime-details".into()))
    );
}

#[tokio::test]
async fn cbor_snapshots_load_back() {
    let dir = tempdir().unwrap();
    let files = FilePersistence::new(dir.path()).with_format(SnapshotFormat::Cbor);
    assert!(files.path_for("case-8").ends_with("case-8.cbor"));
    let backend: Arc<dyn Persistence> = Arc::new(files);

    let mut session = IntakeSession::resume(schema(), "case-8", backend.clone(), IntakeConfig::default())
        .await
        .unwrap();
    session.merge("personal", personal()).unwrap();
    session.flush().await.unwrap();
    assert_eq!(session.save_status(), SaveStatus::Saved { version: 1 });

    let loaded = backend.load("case-8").await.unwrap().expect("snapshot");
    assert_eq!(loaded.get("personal", "fullName"), Some(&json!("Ada Lovelace")));
}

#[tokio::test]
async fn older_snapshots_never_overwrite_newer_ones() {
    let dir = tempdir().unwrap();
    let backend = FilePersistence::new(dir.path());

    let mut newer = AnswerSet::new("employment-claim", "2024.1");
    newer.version = 5;
    let mut older = newer.clone();
    older.version = 3;

    backend.save("case-9", &newer).await.unwrap();
    backend.save("case-9", &older).await.unwrap();
    let loaded = backend.load("case-9").await.unwrap().expect("snapshot");
    assert_eq!(loaded.version, 5);
}

#[tokio::test]
async fn foreign_snapshots_are_not_resumed() {
    let backend = Arc::new(MemoryPersistence::new());
    backend
        .save("case-10", &AnswerSet::new("triage", "1"))
        .await
        .unwrap();
    let result =
        IntakeSession::resume(schema(), "case-10", backend, IntakeConfig::default()).await;
    assert!(result.is_err());
}

#[tokio::test(start_paused = true)]
async fn edits_are_debounced_into_one_write() {
    let backend = Arc::new(MemoryPersistence::new());
    let mut session = IntakeSession::resume(schema(), "case-11", backend.clone(), IntakeConfig::default())
        .await
        .unwrap();

    for name in ["A", "Ad", "Ada"] {
        session
            .merge("personal", partial(json!({ "fullName": name })))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(session.save_status(), SaveStatus::Pending { version: 3 });
    assert_eq!(backend.save_count(), 0);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(session.save_status(), SaveStatus::Saved { version: 3 });
    assert_eq!(backend.save_count(), 1);
    assert_eq!(
        backend
            .stored("case-11")
            .await
            .and_then(|set| set.get("personal", "fullName").cloned()),
        Some(json!("Ada"))
    );
}
