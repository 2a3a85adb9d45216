use serde_json::{Map, Value};
use tracing::debug;

use crate::answers::{AnswerSet, UploadedFile};
use crate::writer::PersistenceWriter;

/// Sole owner of the answer set for one run.
///
/// Mutations are synchronous. When a writer is attached, each mutation hands
/// it a snapshot; the writer decides when it reaches storage.
pub struct AnswerStore {
    answers: AnswerSet,
    writer: Option<PersistenceWriter>,
}

impl AnswerStore {
    pub fn new(answers: AnswerSet) -> Self {
        Self {
            answers,
            writer: None,
        }
    }

    pub fn attach(&mut self, writer: PersistenceWriter) {
        self.writer = Some(writer);
    }

    pub fn writer(&self) -> Option<&PersistenceWriter> {
        self.writer.as_ref()
    }

    pub fn detach(&mut self) -> Option<PersistenceWriter> {
        self.writer.take()
    }

    /// Shallow union of `partial` into the `step` namespace.
    pub fn merge(&mut self, step: &str, partial: Map<String, Value>) -> &AnswerSet {
        let fields = partial.len();
        self.answers.merge_step(step, partial);
        debug!(step, fields, version = self.answers.version, "answers merged");
        self.changed();
        &self.answers
    }

    pub fn get(&self, step: &str, field: &str) -> Option<&Value> {
        self.answers.get(step, field)
    }

    pub fn answers(&self) -> &AnswerSet {
        &self.answers
    }

    pub fn snapshot(&self) -> AnswerSet {
        self.answers.clone()
    }

    pub fn clear(&mut self, step: &str, field: &str) -> bool {
        let removed = self.answers.clear_field(step, field);
        if removed {
            self.changed();
        }
        removed
    }

    pub fn clear_step(&mut self, step: &str) -> bool {
        let removed = self.answers.clear_step(step);
        if removed {
            self.changed();
        }
        removed
    }

    pub fn record_upload(&mut self, file: UploadedFile) {
        debug!(slug = %file.slug, size = file.size_bytes, "upload recorded");
        self.answers.insert_upload(file);
        self.changed();
    }

    pub fn remove_upload(&mut self, slug: &str) -> Option<UploadedFile> {
        let removed = self.answers.remove_upload(slug);
        if removed.is_some() {
            self.changed();
        }
        removed
    }

    pub(crate) fn mark_submitted(&mut self, at: chrono::DateTime<chrono::Utc>) {
        self.answers.mark_submitted(at);
        self.changed();
    }

    fn changed(&self) {
        if let Some(writer) = &self.writer {
            writer.schedule(self.answers.clone());
        }
    }
}
