//! Debounced background writer that owns the timing of persistence.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, warn};

use crate::answers::AnswerSet;
use crate::persist::{Persistence, PersistenceError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterConfig {
    /// Quiet period after the last change before a snapshot is written.
    pub debounce: Duration,
    /// Delay before a failed write is attempted again.
    pub retry_delay: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(400),
            retry_delay: Duration::from_secs(2),
        }
    }
}

/// Last known outcome of background persistence, for "saving…" indicators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SaveStatus {
    Idle,
    Pending { version: u64 },
    Saved { version: u64 },
    Failed { version: u64, message: String },
}

enum Command {
    Flush(oneshot::Sender<Result<(), PersistenceError>>),
    Shutdown(oneshot::Sender<Result<(), PersistenceError>>),
}

/// Handle to the writer task. Snapshots handed to [`schedule`] replace each
/// other; only the newest one inside a debounce window reaches the backend.
///
/// [`schedule`]: PersistenceWriter::schedule
pub struct PersistenceWriter {
    latest: watch::Sender<Option<AnswerSet>>,
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<SaveStatus>,
    task: JoinHandle<()>,
}

impl PersistenceWriter {
    /// Starts the writer on the current tokio runtime. `persisted_version`
    /// is the version already durable in the backend (0 for a fresh run).
    pub fn spawn(
        backend: Arc<dyn Persistence>,
        key: impl Into<String>,
        config: WriterConfig,
        persisted_version: u64,
    ) -> Self {
        let (latest, latest_rx) = watch::channel(None);
        let (commands, commands_rx) = mpsc::channel(8);
        let (status_tx, status) = watch::channel(SaveStatus::Idle);
        let worker = Worker {
            backend,
            key: key.into(),
            config,
            latest: latest_rx,
            status: status_tx,
            persisted: persisted_version,
        };
        let task = tokio::spawn(worker.run(commands_rx));
        Self {
            latest,
            commands,
            status,
            task,
        }
    }

    /// Hands over the newest snapshot. Never blocks and never fails.
    pub fn schedule(&self, answers: AnswerSet) {
        self.latest.send_replace(Some(answers));
    }

    pub fn status(&self) -> SaveStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SaveStatus> {
        self.status.clone()
    }

    /// Writes the pending snapshot now instead of waiting for the debounce.
    pub async fn flush(&self) -> Result<(), PersistenceError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Flush(reply))
            .await
            .map_err(|_| PersistenceError::Closed)?;
        response.await.map_err(|_| PersistenceError::Closed)?
    }

    /// Persists the last snapshot and stops the task.
    pub async fn shutdown(self) -> Result<(), PersistenceError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Shutdown(reply))
            .await
            .map_err(|_| PersistenceError::Closed)?;
        let result = response.await.map_err(|_| PersistenceError::Closed)?;
        let _ = self.task.await;
        result
    }
}

struct Worker {
    backend: Arc<dyn Persistence>,
    key: String,
    config: WriterConfig,
    latest: watch::Receiver<Option<AnswerSet>>,
    status: watch::Sender<SaveStatus>,
    persisted: u64,
}

impl Worker {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let mut deadline: Option<Instant> = None;
        loop {
            tokio::select! {
                changed = self.latest.changed() => {
                    if changed.is_err() {
                        let _ = self.save_latest().await;
                        break;
                    }
                    let version = self.latest.borrow().as_ref().map(|answers| answers.version);
                    if let Some(version) = version
                        && version > self.persisted
                    {
                        self.status.send_replace(SaveStatus::Pending { version });
                        deadline = Some(Instant::now() + self.config.debounce);
                    }
                }
                command = commands.recv() => match command {
                    Some(Command::Flush(reply)) => {
                        let result = self.save_latest().await;
                        deadline = result
                            .is_err()
                            .then(|| Instant::now() + self.config.retry_delay);
                        let _ = reply.send(result);
                    }
                    Some(Command::Shutdown(reply)) => {
                        let _ = reply.send(self.save_latest().await);
                        break;
                    }
                    None => {
                        let _ = self.save_latest().await;
                        break;
                    }
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    deadline = match self.save_latest().await {
                        Ok(()) => None,
                        Err(_) => Some(Instant::now() + self.config.retry_delay),
                    };
                }
            }
        }
        debug!(key = %self.key, "persistence writer stopped");
    }

    async fn save_latest(&mut self) -> Result<(), PersistenceError> {
        let snapshot = self.latest.borrow().clone();
        let Some(snapshot) = snapshot else {
            return Ok(());
        };
        if snapshot.version <= self.persisted {
            return Ok(());
        }
        match self.backend.save(&self.key, &snapshot).await {
            Ok(()) => {
                self.persisted = snapshot.version;
                self.status.send_replace(SaveStatus::Saved {
                    version: snapshot.version,
                });
                debug!(key = %self.key, version = snapshot.version, "answers persisted");
                Ok(())
            }
            Err(err) => {
                warn!(key = %self.key, version = snapshot.version, error = %err, "failed to persist answers");
                self.status.send_replace(SaveStatus::Failed {
                    version: snapshot.version,
                    message: err.to_string(),
                });
                Err(err)
            }
        }
    }
}
