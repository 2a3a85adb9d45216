use serde::Serialize;

use crate::answers::AnswerSet;
use crate::documents::{completion_ratio, expected_documents};
use crate::schema::{QuestionLocation, Schema};
use crate::sequencer::StepSequencer;
use crate::spec::StepSpec;
use crate::validate::answer_present;
use crate::visibility::{question_visible, visible_question_locations, visible_step_sections, visible_steps};

/// Progress counters exposed to renderers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Progress {
    /// Zero-based index of the current step among the visible steps.
    pub step_index: usize,
    pub total_steps: usize,
    /// Fraction in `[0, 1]`.
    pub percent: f64,
    pub answered: usize,
    pub total_questions: usize,
    pub documents_ratio: f64,
    pub done: bool,
}

pub fn compute(schema: &Schema, answers: &AnswerSet, sequencer: &StepSequencer) -> Progress {
    let steps = visible_steps(schema, answers);
    let step_index = sequencer
        .current(schema, answers)
        .and_then(|current| steps.iter().position(|step| step.id == current.id))
        .unwrap_or(0);

    let questions = visible_question_locations(schema, answers);
    let answered = answered_count(&questions, answers);
    let expected = expected_documents(schema, answers);

    Progress {
        step_index,
        total_steps: steps.len(),
        percent: sequencer.progress(schema, answers),
        answered,
        total_questions: questions.len(),
        documents_ratio: completion_ratio(&expected, answers),
        done: sequencer.is_done(),
    }
}

pub fn answered_count(questions: &[QuestionLocation<'_>], answers: &AnswerSet) -> usize {
    questions
        .iter()
        .filter(|location| answer_present(location, answers))
        .count()
}

/// First visible question of `step` still waiting for an answer, preferring
/// required ones.
pub fn next_question(schema: &Schema, step: &StepSpec, answers: &AnswerSet) -> Option<String> {
    let open: Vec<QuestionLocation<'_>> = visible_step_sections(schema, step, answers)
        .into_iter()
        .flat_map(|section| {
            section
                .questions
                .iter()
                .filter(|question| question_visible(question, answers))
                .map(move |question| QuestionLocation {
                    step,
                    section,
                    question,
                })
        })
        .filter(|location| !answer_present(location, answers))
        .collect();

    open.iter()
        .find(|location| location.question.is_required(answers))
        .or_else(|| open.first())
        .map(|location| location.question.id.clone())
}
