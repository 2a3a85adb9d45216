use crate::answers::AnswerSet;
use crate::schema::{QuestionLocation, Schema};
use crate::spec::{QuestionSpec, SectionSpec, StepSpec};

/// Visibility of every question keyed by `step.question`.
pub type VisibilityMap = std::collections::BTreeMap<String, bool>;

pub fn section_visible(section: &SectionSpec, answers: &AnswerSet) -> bool {
    section.always_shown
        || section
            .show_if
            .as_ref()
            .is_some_and(|expr| expr.evaluate(answers))
}

pub fn question_visible(question: &QuestionSpec, answers: &AnswerSet) -> bool {
    question
        .show_if
        .as_ref()
        .is_none_or(|expr| expr.evaluate(answers))
}

/// Sections currently shown, in declared order.
pub fn visible_sections<'a>(schema: &'a Schema, answers: &AnswerSet) -> Vec<&'a SectionSpec> {
    schema
        .sections()
        .iter()
        .filter(|section| section_visible(section, answers))
        .collect()
}

/// Questions of a section currently shown, in declared order. Callers are
/// expected to have checked the section itself.
pub fn visible_questions<'a>(section: &'a SectionSpec, answers: &AnswerSet) -> Vec<&'a QuestionSpec> {
    section
        .questions
        .iter()
        .filter(|question| question_visible(question, answers))
        .collect()
}

/// Visible sections of one step, in the order the step lists them.
pub fn visible_step_sections<'a>(
    schema: &'a Schema,
    step: &'a StepSpec,
    answers: &AnswerSet,
) -> Vec<&'a SectionSpec> {
    schema
        .step_sections(step)
        .filter(|section| section_visible(section, answers))
        .collect()
}

/// A step is shown while at least one of its sections is.
pub fn step_visible(schema: &Schema, step: &StepSpec, answers: &AnswerSet) -> bool {
    schema
        .step_sections(step)
        .any(|section| section_visible(section, answers))
}

pub fn visible_steps<'a>(schema: &'a Schema, answers: &AnswerSet) -> Vec<&'a StepSpec> {
    schema
        .steps()
        .iter()
        .filter(|step| step_visible(schema, step, answers))
        .collect()
}

/// Questions that are shown right now, with their owning step and section.
pub fn visible_question_locations<'a>(
    schema: &'a Schema,
    answers: &AnswerSet,
) -> Vec<QuestionLocation<'a>> {
    schema
        .questions()
        .filter(|location| {
            section_visible(location.section, answers)
                && question_visible(location.question, answers)
        })
        .collect()
}

pub fn resolve_visibility(schema: &Schema, answers: &AnswerSet) -> VisibilityMap {
    schema
        .questions()
        .map(|location| {
            let visible = section_visible(location.section, answers)
                && question_visible(location.question, answers);
            (location.qualified_id(), visible)
        })
        .collect()
}
