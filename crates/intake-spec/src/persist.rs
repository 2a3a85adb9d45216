//! Persistence contract for answer snapshots and the two provided backends.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use crate::answers::AnswerSet;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("i/o error for snapshot '{key}': {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode snapshot: {0}")]
    Encode(String),
    #[error("failed to decode snapshot '{key}': {reason}")]
    Decode { key: String, reason: String },
    #[error("persistence backend failed: {0}")]
    Backend(String),
    #[error("persistence writer has shut down")]
    Closed,
}

/// Durable storage for the answer set of one run, keyed by an opaque run key.
///
/// Implementations must not replace a stored snapshot with one carrying an
/// older logical version.
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn save(&self, key: &str, answers: &AnswerSet) -> Result<(), PersistenceError>;

    async fn load(&self, key: &str) -> Result<Option<AnswerSet>, PersistenceError>;
}

/// In-memory backend for tests and embedding hosts.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    snapshots: Mutex<BTreeMap<String, AnswerSet>>,
    saves: AtomicUsize,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of accepted writes.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub async fn stored(&self, key: &str) -> Option<AnswerSet> {
        self.snapshots.lock().await.get(key).cloned()
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn save(&self, key: &str, answers: &AnswerSet) -> Result<(), PersistenceError> {
        let mut snapshots = self.snapshots.lock().await;
        if let Some(existing) = snapshots.get(key)
            && existing.version > answers.version
        {
            debug!(key, stored = existing.version, offered = answers.version, "stale snapshot skipped");
            return Ok(());
        }
        snapshots.insert(key.to_string(), answers.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Option<AnswerSet>, PersistenceError> {
        Ok(self.snapshots.lock().await.get(key).cloned())
    }
}

/// On-disk encoding of snapshot files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SnapshotFormat {
    #[default]
    Json,
    Cbor,
}

impl SnapshotFormat {
    fn extension(self) -> &'static str {
        match self {
            SnapshotFormat::Json => "json",
            SnapshotFormat::Cbor => "cbor",
        }
    }

    fn encode(self, answers: &AnswerSet) -> Result<Vec<u8>, PersistenceError> {
        match self {
            SnapshotFormat::Json => serde_json::to_vec_pretty(answers)
                .map_err(|err| PersistenceError::Encode(err.to_string())),
            SnapshotFormat::Cbor => answers
                .to_cbor()
                .map_err(|err| PersistenceError::Encode(err.to_string())),
        }
    }

    fn decode(self, key: &str, bytes: &[u8]) -> Result<AnswerSet, PersistenceError> {
        let decoded = match self {
            SnapshotFormat::Json => serde_json::from_slice(bytes).map_err(|err| err.to_string()),
            SnapshotFormat::Cbor => AnswerSet::from_cbor(bytes).map_err(|err| err.to_string()),
        };
        decoded.map_err(|reason| PersistenceError::Decode {
            key: key.to_string(),
            reason,
        })
    }
}

/// One snapshot file per run key inside `dir`. Writes go to a temporary
/// file first and are renamed into place.
#[derive(Debug, Clone)]
pub struct FilePersistence {
    dir: PathBuf,
    format: SnapshotFormat,
}

impl FilePersistence {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            format: SnapshotFormat::Json,
        }
    }

    pub fn with_format(mut self, format: SnapshotFormat) -> Self {
        self.format = format;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{}", sanitize_key(key), self.format.extension()))
    }

    async fn read(&self, key: &str) -> Result<Option<AnswerSet>, PersistenceError> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => self.format.decode(key, &bytes).map(Some),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(PersistenceError::Io {
                key: key.to_string(),
                source,
            }),
        }
    }
}

#[async_trait]
impl Persistence for FilePersistence {
    async fn save(&self, key: &str, answers: &AnswerSet) -> Result<(), PersistenceError> {
        let io = |source| PersistenceError::Io {
            key: key.to_string(),
            source,
        };

        if let Ok(Some(existing)) = self.read(key).await
            && existing.version > answers.version
        {
            debug!(key, stored = existing.version, offered = answers.version, "stale snapshot skipped");
            return Ok(());
        }

        let bytes = self.format.encode(answers)?;
        tokio::fs::create_dir_all(&self.dir).await.map_err(io)?;
        let target = self.path_for(key);
        let staging = target.with_extension(format!("{}.tmp", self.format.extension()));
        tokio::fs::write(&staging, bytes).await.map_err(io)?;
        tokio::fs::rename(&staging, &target).await.map_err(io)?;
        debug!(key, version = answers.version, path = %target.display(), "snapshot written");
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Option<AnswerSet>, PersistenceError> {
        self.read(key).await
    }
}

fn sanitize_key(key: &str) -> String {
    let cleaned: String = key
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_') {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::answers::UploadedFile;
    use serde_json::json;

    fn sample(version_bumps: usize) -> AnswerSet {
        let mut set = AnswerSet::new("intake", "1");
        for round in 0..version_bumps {
            set.merge_step("claims", json!({ "round": round }).as_object().cloned().unwrap());
        }
        set.insert_upload(UploadedFile::new("badge_export", "b.csv", 12, "csv"));
        set
    }

    #[tokio::test]
    async fn memory_backend_round_trips_and_ignores_stale_writes() {
        let backend = MemoryPersistence::new();
        assert!(backend.load("run").await.unwrap().is_none());

        let newer = sample(3);
        backend.save("run", &newer).await.unwrap();
        backend.save("run", &sample(1)).await.unwrap();

        assert_eq!(backend.load("run").await.unwrap(), Some(newer));
        assert_eq!(backend.save_count(), 1);
    }

    #[tokio::test]
    async fn file_backend_round_trips_in_both_formats() {
        let dir = tempfile::tempdir().unwrap();
        for format in [SnapshotFormat::Json, SnapshotFormat::Cbor] {
            let backend = FilePersistence::new(dir.path()).with_format(format);
            let answers = sample(2);
            backend.save("case/42", &answers).await.unwrap();
            assert!(backend.path_for("case/42").exists());
            assert_eq!(backend.load("case/42").await.unwrap(), Some(answers));
        }
    }

    #[tokio::test]
    async fn file_backend_keeps_newer_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilePersistence::new(dir.path());
        let newer = sample(4);
        backend.save("run", &newer).await.unwrap();
        backend.save("run", &sample(1)).await.unwrap();
        assert_eq!(backend.load("run").await.unwrap(), Some(newer));
    }

    #[tokio::test]
    async fn missing_file_loads_as_none_and_garbage_fails() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilePersistence::new(dir.path());
        assert!(backend.load("absent").await.unwrap().is_none());

        std::fs::write(backend.path_for("broken"), b"{not json").unwrap();
        assert!(matches!(
            backend.load("broken").await,
            Err(PersistenceError::Decode { .. })
        ));
    }

    #[test]
    fn sanitizes_run_keys() {
        assert_eq!(sanitize_key("case/42 draft"), "case_42_draft");
        assert_eq!(sanitize_key(""), "_");
    }
}
