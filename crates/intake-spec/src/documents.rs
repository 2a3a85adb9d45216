use std::collections::BTreeSet;

use globset::{GlobBuilder, GlobSetBuilder};
use serde::Serialize;
use thiserror::Error;

use crate::answers::{AnswerSet, UploadedFile};
use crate::schema::Schema;
use crate::spec::FileRequirement;
use crate::visibility::visible_question_locations;

/// A document the applicant is currently expected to supply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExpectedDocument {
    pub step: String,
    pub section: String,
    pub question: String,
    pub requirement: FileRequirement,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UploadRejection {
    #[error("no document with slug '{0}' is declared")]
    UnknownRequirement(String),
    #[error("document '{0}' is not expected for the current answers")]
    NotExpected(String),
    #[error("'.{extension}' files are not accepted for '{slug}' (allowed: {allowed})")]
    ExtensionNotAllowed {
        slug: String,
        extension: String,
        allowed: String,
    },
    #[error("'{filename}' does not have the reported '.{extension}' extension")]
    ExtensionMismatch { filename: String, extension: String },
    #[error("'{slug}' is {size} bytes, above the {limit} byte limit")]
    TooLarge { slug: String, size: u64, limit: u64 },
    #[error("'{0}' is empty")]
    Empty(String),
}

/// File requirements attached to visible questions in visible sections,
/// in declared order. Hidden requirements never appear.
pub fn expected_documents(schema: &Schema, answers: &AnswerSet) -> Vec<ExpectedDocument> {
    visible_question_locations(schema, answers)
        .into_iter()
        .flat_map(|location| {
            location
                .question
                .file_requirements
                .iter()
                .map(move |requirement| ExpectedDocument {
                    step: location.step.id.clone(),
                    section: location.section.id.clone(),
                    question: location.question.id.clone(),
                    requirement: requirement.clone(),
                })
        })
        .collect()
}

/// Share of expected documents that have an upload. Nothing expected means
/// nothing is missing.
pub fn completion_ratio(expected: &[ExpectedDocument], answers: &AnswerSet) -> f64 {
    if expected.is_empty() {
        return 1.0;
    }
    let uploaded = expected
        .iter()
        .filter(|document| answers.has_upload(&document.requirement.slug))
        .count();
    uploaded as f64 / expected.len() as f64
}

/// Required expected documents that still lack an upload.
pub fn missing_required<'a>(
    expected: &'a [ExpectedDocument],
    answers: &AnswerSet,
) -> Vec<&'a ExpectedDocument> {
    expected
        .iter()
        .filter(|document| {
            document.requirement.required && !answers.has_upload(&document.requirement.slug)
        })
        .collect()
}

/// Checks reported upload metadata against its requirement.
pub fn check_upload(
    requirement: &FileRequirement,
    file: &UploadedFile,
) -> Result<(), UploadRejection> {
    if file.size_bytes == 0 {
        return Err(UploadRejection::Empty(file.filename.clone()));
    }
    if file.size_bytes > requirement.max_size_bytes {
        return Err(UploadRejection::TooLarge {
            slug: requirement.slug.clone(),
            size: file.size_bytes,
            limit: requirement.max_size_bytes,
        });
    }

    let extension = file.normalized_extension();
    let reported = format!("x.{}", extension);
    let own = extension_matcher(std::slice::from_ref(&extension));
    if !own.is_some_and(|set| set.is_match(&file.filename)) {
        return Err(UploadRejection::ExtensionMismatch {
            filename: file.filename.clone(),
            extension,
        });
    }

    if requirement.allowed_extensions.is_empty() {
        return Ok(());
    }
    let allowed: Vec<String> = requirement.allowed_extensions.iter().cloned().collect();
    if extension_matcher(&allowed).is_some_and(|set| set.is_match(&reported)) {
        Ok(())
    } else {
        Err(UploadRejection::ExtensionNotAllowed {
            slug: requirement.slug.clone(),
            extension,
            allowed: allowed.join(", "),
        })
    }
}

/// Checks that `file` is declared, currently expected, and acceptable.
pub fn accept_upload(
    schema: &Schema,
    answers: &AnswerSet,
    file: &UploadedFile,
) -> Result<FileRequirement, UploadRejection> {
    let declared = schema
        .questions()
        .flat_map(|location| location.question.file_requirements.iter())
        .any(|requirement| requirement.slug == file.slug);
    if !declared {
        return Err(UploadRejection::UnknownRequirement(file.slug.clone()));
    }

    let requirement = expected_documents(schema, answers)
        .into_iter()
        .find(|document| document.requirement.slug == file.slug)
        .map(|document| document.requirement)
        .ok_or_else(|| UploadRejection::NotExpected(file.slug.clone()))?;
    check_upload(&requirement, file)?;
    Ok(requirement)
}

/// Slugs of uploads whose requirement is no longer expected.
pub fn orphaned_uploads(schema: &Schema, answers: &AnswerSet) -> Vec<String> {
    let expected: BTreeSet<String> = expected_documents(schema, answers)
        .into_iter()
        .map(|document| document.requirement.slug)
        .collect();
    answers
        .uploads
        .keys()
        .filter(|slug| !expected.contains(*slug))
        .cloned()
        .collect()
}

fn extension_matcher(extensions: &[String]) -> Option<globset::GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for extension in extensions {
        let pattern = format!("*.{}", extension.trim_start_matches('.'));
        let glob = GlobBuilder::new(&pattern)
            .case_insensitive(true)
            .literal_separator(false)
            .build()
            .ok()?;
        builder.add(glob);
    }
    builder.build().ok()
}
