use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::expr::FieldRef;

/// Metadata reported by the upload transport for one stored file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedFile {
    pub slug: String,
    pub filename: String,
    pub size_bytes: u64,
    pub extension: String,
}

impl UploadedFile {
    pub fn new(
        slug: impl Into<String>,
        filename: impl Into<String>,
        size_bytes: u64,
        extension: impl Into<String>,
    ) -> Self {
        Self {
            slug: slug.into(),
            filename: filename.into(),
            size_bytes,
            extension: extension.into(),
        }
    }

    /// Extension without a leading dot, lowercased.
    pub fn normalized_extension(&self) -> String {
        self.extension.trim_start_matches('.').to_ascii_lowercase()
    }
}

/// Everything an applicant has supplied so far.
///
/// Answers are namespaced per step (`steps[step][field]`). `version` is a
/// logical clock bumped on every mutation and decides which snapshot wins
/// when persisted writes race.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerSet {
    pub questionnaire_id: String,
    pub spec_version: String,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub steps: BTreeMap<String, Map<String, Value>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub uploads: BTreeMap<String, UploadedFile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitted_at: Option<DateTime<Utc>>,
}

impl AnswerSet {
    pub fn new(questionnaire_id: impl Into<String>, spec_version: impl Into<String>) -> Self {
        Self {
            questionnaire_id: questionnaire_id.into(),
            spec_version: spec_version.into(),
            version: 0,
            steps: BTreeMap::new(),
            uploads: BTreeMap::new(),
            submitted_at: None,
        }
    }

    /// Returns the answer for `field` inside `step`; `null` counts as unanswered.
    pub fn get(&self, step: &str, field: &str) -> Option<&Value> {
        self.steps
            .get(step)
            .and_then(|values| values.get(field))
            .filter(|value| !value.is_null())
    }

    /// Resolves a predicate reference. Unqualified references never match.
    pub fn lookup(&self, field: &FieldRef) -> Option<&Value> {
        let step = field.step.as_deref()?;
        self.get(step, &field.field)
    }

    pub fn step(&self, step: &str) -> Option<&Map<String, Value>> {
        self.steps.get(step)
    }

    pub fn upload(&self, slug: &str) -> Option<&UploadedFile> {
        self.uploads.get(slug)
    }

    pub fn has_upload(&self, slug: &str) -> bool {
        self.uploads.contains_key(slug)
    }

    pub fn is_submitted(&self) -> bool {
        self.submitted_at.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.values().all(Map::is_empty) && self.uploads.is_empty()
    }

    pub(crate) fn merge_step(&mut self, step: &str, partial: Map<String, Value>) {
        let values = self.steps.entry(step.to_string()).or_default();
        for (field, value) in partial {
            values.insert(field, value);
        }
        self.version += 1;
    }

    pub(crate) fn clear_field(&mut self, step: &str, field: &str) -> bool {
        let removed = self
            .steps
            .get_mut(step)
            .and_then(|values| values.remove(field))
            .is_some();
        if removed {
            self.version += 1;
        }
        removed
    }

    pub(crate) fn clear_step(&mut self, step: &str) -> bool {
        let removed = self.steps.remove(step).is_some();
        if removed {
            self.version += 1;
        }
        removed
    }

    pub(crate) fn insert_upload(&mut self, file: UploadedFile) {
        self.uploads.insert(file.slug.clone(), file);
        self.version += 1;
    }

    pub(crate) fn remove_upload(&mut self, slug: &str) -> Option<UploadedFile> {
        let removed = self.uploads.remove(slug);
        if removed.is_some() {
            self.version += 1;
        }
        removed
    }

    pub(crate) fn mark_submitted(&mut self, at: DateTime<Utc>) {
        self.submitted_at = Some(at);
        self.version += 1;
    }

    pub fn to_cbor(&self) -> Result<Vec<u8>, serde_cbor::Error> {
        serde_cbor::to_vec(self)
    }

    pub fn from_cbor(bytes: &[u8]) -> Result<Self, serde_cbor::Error> {
        serde_cbor::from_slice(bytes)
    }

    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn partial(value: Value) -> Map<String, Value> {
        value.as_object().cloned().expect("object")
    }

    #[test]
    fn merge_is_shallow_union_per_step() {
        let mut set = AnswerSet::new("intake", "1");
        set.merge_step("personal", partial(json!({ "name": "Ada", "email": "a@x.io" })));
        set.merge_step("claims", partial(json!({ "claimTypes": ["overtime"] })));
        set.merge_step("personal", partial(json!({ "email": "ada@x.io" })));

        assert_eq!(set.get("personal", "name"), Some(&json!("Ada")));
        assert_eq!(set.get("personal", "email"), Some(&json!("ada@x.io")));
        assert_eq!(set.get("claims", "claimTypes"), Some(&json!(["overtime"])));
        assert_eq!(set.version, 3);
    }

    #[test]
    fn clearing_missing_values_keeps_version() {
        let mut set = AnswerSet::new("intake", "1");
        assert!(!set.clear_field("personal", "name"));
        assert!(!set.clear_step("personal"));
        assert_eq!(set.version, 0);
        set.merge_step("personal", partial(json!({ "name": "Ada" })));
        assert!(set.clear_field("personal", "name"));
        assert_eq!(set.version, 2);
        assert!(set.get("personal", "name").is_none());
    }

    #[test]
    fn cbor_round_trip_preserves_everything() {
        let mut set = AnswerSet::new("intake", "2");
        set.merge_step("claims", partial(json!({ "claimTypes": ["overtime"], "hours": 12.5 })));
        set.insert_upload(UploadedFile::new("badge_export", "badges.csv", 2048, "csv"));
        let bytes = set.to_cbor().expect("encode");
        let decoded = AnswerSet::from_cbor(&bytes).expect("decode");
        assert_eq!(decoded, set);
    }

    #[test]
    fn normalizes_upload_extension() {
        let file = UploadedFile::new("id", "scan.PDF", 10, ".PDF");
        assert_eq!(file.normalized_extension(), "pdf");
    }
}
