use std::collections::BTreeSet;
use std::fmt;

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::answers::AnswerSet;
use crate::schema::Schema;
use crate::spec::StepSpec;
use crate::validate::{ValidationError, validate_step};
use crate::visibility::{step_visible, visible_steps};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "step", rename_all = "snake_case")]
pub enum Position {
    Step(String),
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    UnknownStep,
    HiddenStep,
    NotReachable,
    CurrentStepIncomplete,
    NoFurtherStep,
    NoPreviousStep,
    Finished,
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            DenialReason::UnknownStep => "no such step",
            DenialReason::HiddenStep => "step is hidden by the current answers",
            DenialReason::NotReachable => "an earlier step is incomplete",
            DenialReason::CurrentStepIncomplete => "current step is incomplete",
            DenialReason::NoFurtherStep => "there is no further step; submit instead",
            DenialReason::NoPreviousStep => "already at the first step",
            DenialReason::Finished => "the questionnaire has been submitted",
        };
        f.write_str(text)
    }
}

/// A rejected navigation request. The sequencer state is unchanged.
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[error("cannot move from '{current}' to '{requested}': {reason}")]
pub struct NavigationDenied {
    pub requested: String,
    pub current: String,
    pub reason: DenialReason,
    /// Unmet requirements that block the move, when any.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub blocking: Vec<ValidationError>,
}

/// Navigation state over the steps of one schema.
///
/// Holds no answers itself; every operation is evaluated against the answer
/// set passed in, so visibility changes are picked up on the next call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepSequencer {
    trail: Vec<String>,
    visited: BTreeSet<String>,
    done: bool,
}

impl StepSequencer {
    pub fn start(schema: &Schema, answers: &AnswerSet) -> Self {
        let mut sequencer = Self::default();
        if let Some(first) = visible_steps(schema, answers).first() {
            sequencer.enter(&first.id);
        }
        sequencer
    }

    /// Rebuilds navigation from a stored answer set alone: walks forward from
    /// the first visible step while steps are valid and stops at the first
    /// invalid one.
    pub fn resume(schema: &Schema, answers: &AnswerSet) -> Self {
        let mut sequencer = Self::default();
        for step in walk(schema, answers) {
            sequencer.enter(&step.id);
        }
        sequencer.done = answers.is_submitted();
        debug!(position = ?sequencer.position(schema, answers), "navigation resumed");
        sequencer
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn visited(&self) -> &BTreeSet<String> {
        &self.visited
    }

    /// The current step. A step hidden by an answer change yields the
    /// nearest preceding visible step on the trail.
    pub fn current<'a>(&self, schema: &'a Schema, answers: &AnswerSet) -> Option<&'a StepSpec> {
        self.trail
            .iter()
            .rev()
            .filter_map(|id| schema.step(id))
            .find(|step| step_visible(schema, step, answers))
            .or_else(|| visible_steps(schema, answers).into_iter().next())
    }

    pub fn position(&self, schema: &Schema, answers: &AnswerSet) -> Option<Position> {
        if self.done {
            return Some(Position::Done);
        }
        self.current(schema, answers)
            .map(|step| Position::Step(step.id.clone()))
    }

    /// Drops trail entries whose steps are no longer visible.
    pub fn settle(&mut self, schema: &Schema, answers: &AnswerSet) {
        self.trail.retain(|id| {
            schema
                .step(id)
                .is_some_and(|step| step_visible(schema, step, answers))
        });
        if self.trail.is_empty()
            && let Some(first) = visible_steps(schema, answers).first()
        {
            self.enter(&first.id);
        }
    }

    pub fn go_to(
        &mut self,
        schema: &Schema,
        answers: &AnswerSet,
        target: &str,
    ) -> Result<(), NavigationDenied> {
        let current = self.ensure_open(schema, answers, target)?;
        let deny = |reason, blocking| NavigationDenied {
            requested: target.to_string(),
            current: current.clone(),
            reason,
            blocking,
        };

        let Some(step) = schema.step(target) else {
            return Err(deny(DenialReason::UnknownStep, Vec::new()));
        };
        if !step_visible(schema, step, answers) {
            return Err(deny(DenialReason::HiddenStep, Vec::new()));
        }
        if step.id == current {
            return Ok(());
        }

        let path = walk(schema, answers);
        if !path.iter().any(|candidate| candidate.id == step.id) {
            let blocking = path
                .last()
                .map(|stop| validate_step(schema, stop, answers).errors)
                .unwrap_or_default();
            return Err(deny(DenialReason::NotReachable, blocking));
        }

        let follows_current = schema.step(&current).is_some_and(|from| {
            next_step(schema, from, answers).is_some_and(|next| next.id == step.id)
        });
        if !self.visited.contains(&step.id) {
            if !follows_current {
                return Err(deny(DenialReason::NotReachable, Vec::new()));
            }
            if let Some(from) = schema.step(&current) {
                let check = validate_step(schema, from, answers);
                if !check.valid {
                    return Err(deny(DenialReason::CurrentStepIncomplete, check.errors));
                }
            }
        }

        if self.trail.contains(&step.id) {
            self.enter(&step.id);
        } else {
            for on_path in &path {
                self.enter(&on_path.id);
                if on_path.id == step.id {
                    break;
                }
            }
        }
        debug!(from = %current, to = %step.id, "moved to step");
        Ok(())
    }

    /// Moves to the computed next step. The current step must be valid.
    pub fn advance<'a>(
        &mut self,
        schema: &'a Schema,
        answers: &AnswerSet,
    ) -> Result<&'a str, NavigationDenied> {
        let current = self.ensure_open(schema, answers, "next")?;
        let deny = |reason, blocking| NavigationDenied {
            requested: "next".to_string(),
            current: current.clone(),
            reason,
            blocking,
        };
        let Some(from) = schema.step(&current) else {
            return Err(deny(DenialReason::UnknownStep, Vec::new()));
        };

        let check = validate_step(schema, from, answers);
        if !check.valid {
            return Err(deny(DenialReason::CurrentStepIncomplete, check.errors));
        }
        let Some(next) = next_step(schema, from, answers) else {
            return Err(deny(DenialReason::NoFurtherStep, Vec::new()));
        };

        self.enter(&next.id);
        debug!(from = %current, to = %next.id, "advanced");
        Ok(&next.id)
    }

    /// Moves back to the step before the current one on the trail. A forward
    /// `go_to` rebuilds the trail along the navigable path, so this is the
    /// preceding step of the flow rather than the last step shown.
    pub fn retreat<'a>(
        &mut self,
        schema: &'a Schema,
        answers: &AnswerSet,
    ) -> Result<&'a str, NavigationDenied> {
        let current = self.ensure_open(schema, answers, "previous")?;
        self.settle(schema, answers);

        let target = self
            .trail
            .iter()
            .rposition(|id| *id == current)
            .filter(|index| *index > 0)
            .map(|index| self.trail[index - 1].clone());
        let Some(target) = target else {
            return Err(NavigationDenied {
                requested: "previous".to_string(),
                current,
                reason: DenialReason::NoPreviousStep,
                blocking: Vec::new(),
            });
        };

        self.enter(&target);
        debug!(from = %current, to = %target, "retreated");
        Ok(schema
            .step(&target)
            .map(|step| step.id.as_str())
            .unwrap_or_default())
    }

    /// Enters the terminal state. Callers validate the whole answer set first.
    pub fn finish(&mut self) {
        self.done = true;
    }

    /// Progress as `index(current) / (visible_steps - 1)`, recomputed from
    /// the current answers on every call.
    pub fn progress(&self, schema: &Schema, answers: &AnswerSet) -> f64 {
        if self.done {
            return 1.0;
        }
        let steps = visible_steps(schema, answers);
        if steps.len() <= 1 {
            return 0.0;
        }
        let index = self
            .current(schema, answers)
            .and_then(|current| steps.iter().position(|step| step.id == current.id))
            .unwrap_or(0);
        index as f64 / (steps.len() - 1) as f64
    }

    fn ensure_open(
        &self,
        schema: &Schema,
        answers: &AnswerSet,
        requested: &str,
    ) -> Result<String, NavigationDenied> {
        let current = self
            .current(schema, answers)
            .map(|step| step.id.clone())
            .unwrap_or_default();
        if self.done {
            return Err(NavigationDenied {
                requested: requested.to_string(),
                current: "done".to_string(),
                reason: DenialReason::Finished,
                blocking: Vec::new(),
            });
        }
        Ok(current)
    }

    /// Makes `step` current, cutting the trail back if it was already on it.
    fn enter(&mut self, step: &str) {
        match self.trail.iter().position(|id| id == step) {
            Some(index) => self.trail.truncate(index + 1),
            None => self.trail.push(step.to_string()),
        }
        self.visited.insert(step.to_string());
    }
}

/// The step that follows `from`: the first matching jump rule whose target
/// is visible, otherwise the next visible step in declared order.
pub fn next_step<'a>(schema: &'a Schema, from: &StepSpec, answers: &AnswerSet) -> Option<&'a StepSpec> {
    let jump = from
        .next
        .iter()
        .filter(|rule| rule.when.evaluate(answers))
        .filter_map(|rule| schema.step(&rule.goto))
        .find(|step| step_visible(schema, step, answers));
    if jump.is_some() {
        return jump;
    }
    let start = schema.step_index(&from.id)? + 1;
    schema.steps()[start..]
        .iter()
        .find(|step| step_visible(schema, step, answers))
}

/// The navigable path for the current answers: from the first visible step,
/// following [`next_step`] through valid steps, ending at the first invalid
/// step or the last reachable one.
pub fn walk<'a>(schema: &'a Schema, answers: &AnswerSet) -> Vec<&'a StepSpec> {
    let mut path = Vec::new();
    let Some(mut step) = visible_steps(schema, answers).into_iter().next() else {
        return path;
    };
    loop {
        path.push(step);
        if !validate_step(schema, step, answers).valid {
            break;
        }
        match next_step(schema, step, answers) {
            Some(next) if !path.iter().any(|seen| seen.id == next.id) => step = next,
            _ => break,
        }
    }
    path
}

/// Every visible step a finished run passes through: the chain of
/// [`next_step`] from the first visible step, regardless of validity. Steps
/// a jump rule skips over are not on the route.
pub fn route<'a>(schema: &'a Schema, answers: &AnswerSet) -> Vec<&'a StepSpec> {
    let mut path: Vec<&StepSpec> = Vec::new();
    let mut step = visible_steps(schema, answers).into_iter().next();
    while let Some(current) = step {
        if path.iter().any(|seen| seen.id == current.id) {
            break;
        }
        path.push(current);
        step = next_step(schema, current, answers);
    }
    path
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    fn schema() -> Schema {
        Schema::from_value(json!({
            "id": "intake",
            "title": "Intake",
            "version": "1",
            "sections": [
                { "id": "personal", "label": "You", "always_shown": true,
                  "questions": [ { "id": "name", "type": "text", "label": "Name", "required": true } ] },
                { "id": "claims", "label": "Claims", "always_shown": true,
                  "questions": [ { "id": "claimTypes", "type": "multi-choice", "label": "Claims",
                                   "required": true, "choices": ["overtime", "dismissal"] } ] },
                { "id": "overtime-details", "label": "Overtime",
                  "show_if": { "op": "includes", "field": "claimTypes", "value": "overtime" },
                  "questions": [ { "id": "hours", "type": "number", "label": "Hours", "required": true } ] },
                { "id": "review", "label": "Review", "always_shown": true,
                  "questions": [ { "id": "confirm", "type": "boolean", "label": "Correct?" } ] }
            ]
        }))
        .expect("schema")
    }

    fn answer(set: &mut AnswerSet, step: &str, values: Value) {
        set.merge_step(step, values.as_object().cloned().unwrap());
    }

    fn current(sequencer: &StepSequencer, schema: &Schema, answers: &AnswerSet) -> String {
        sequencer.current(schema, answers).map(|step| step.id.clone()).unwrap_or_default()
    }

    #[test]
    fn advance_requires_valid_current_step() {
        let schema = schema();
        let mut answers = AnswerSet::new("intake", "1");
        let mut sequencer = StepSequencer::start(&schema, &answers);
        assert_eq!(current(&sequencer, &schema, &answers), "personal");

        let denied = sequencer.advance(&schema, &answers).unwrap_err();
        assert_eq!(denied.reason, DenialReason::CurrentStepIncomplete);
        assert_eq!(denied.blocking[0].question_id.as_deref(), Some("name"));
        assert_eq!(current(&sequencer, &schema, &answers), "personal");

        answer(&mut answers, "personal", json!({ "name": "Ada" }));
        assert_eq!(sequencer.advance(&schema, &answers).unwrap(), "claims");
    }

    #[test]
    fn conditional_steps_join_and_leave_the_path() {
        let schema = schema();
        let mut answers = AnswerSet::new("intake", "1");
        answer(&mut answers, "personal", json!({ "name": "Ada" }));
        answer(&mut answers, "claims", json!({ "claimTypes": ["overtime"] }));
        let mut sequencer = StepSequencer::start(&schema, &answers);
        sequencer.advance(&schema, &answers).unwrap();
        assert_eq!(sequencer.advance(&schema, &answers).unwrap(), "overtime-details");
        assert_eq!(sequencer.progress(&schema, &answers), 2.0 / 3.0);

        answer(&mut answers, "claims", json!({ "claimTypes": ["dismissal"] }));
        assert_eq!(current(&sequencer, &schema, &answers), "claims");
        assert_eq!(sequencer.progress(&schema, &answers), 0.5);
        assert_eq!(sequencer.advance(&schema, &answers).unwrap(), "review");
    }

    #[test]
    fn retreat_after_jumping_forward_follows_the_path() {
        let schema = schema();
        let mut answers = AnswerSet::new("intake", "1");
        answer(&mut answers, "personal", json!({ "name": "Ada" }));
        answer(&mut answers, "claims", json!({ "claimTypes": ["dismissal"] }));
        let mut sequencer = StepSequencer::start(&schema, &answers);
        sequencer.advance(&schema, &answers).unwrap();
        assert_eq!(sequencer.advance(&schema, &answers).unwrap(), "review");

        sequencer.go_to(&schema, &answers, "personal").unwrap();
        sequencer.go_to(&schema, &answers, "review").unwrap();
        assert_eq!(current(&sequencer, &schema, &answers), "review");
        assert_eq!(sequencer.retreat(&schema, &answers).unwrap(), "claims");
        assert_eq!(sequencer.retreat(&schema, &answers).unwrap(), "personal");
    }

    #[test]
    fn go_to_is_limited_to_reachable_steps() {
        let schema = schema();
        let mut answers = AnswerSet::new("intake", "1");
        let mut sequencer = StepSequencer::start(&schema, &answers);

        let denied = sequencer.go_to(&schema, &answers, "review").unwrap_err();
        assert_eq!(denied.reason, DenialReason::NotReachable);
        assert_eq!(denied.blocking[0].step, "personal");

        assert_eq!(
            sequencer.go_to(&schema, &answers, "overtime-details").unwrap_err().reason,
            DenialReason::HiddenStep
        );
        assert_eq!(
            sequencer.go_to(&schema, &answers, "nope").unwrap_err().reason,
            DenialReason::UnknownStep
        );
        assert!(sequencer.go_to(&schema, &answers, "personal").is_ok());

        answer(&mut answers, "personal", json!({ "name": "Ada" }));
        sequencer.go_to(&schema, &answers, "claims").unwrap();
        answer(&mut answers, "claims", json!({ "claimTypes": ["dismissal"] }));
        sequencer.advance(&schema, &answers).unwrap();
        sequencer.go_to(&schema, &answers, "personal").unwrap();
        sequencer.go_to(&schema, &answers, "review").unwrap();
        assert_eq!(current(&sequencer, &schema, &answers), "review");
    }

    #[test]
    fn retreat_walks_back_along_the_trail() {
        let schema = schema();
        let mut answers = AnswerSet::new("intake", "1");
        let mut sequencer = StepSequencer::start(&schema, &answers);
        assert_eq!(
            sequencer.retreat(&schema, &answers).unwrap_err().reason,
            DenialReason::NoPreviousStep
        );
        answer(&mut answers, "personal", json!({ "name": "Ada" }));
        sequencer.advance(&schema, &answers).unwrap();
        assert_eq!(sequencer.retreat(&schema, &answers).unwrap(), "personal");
    }

    #[test]
    fn resume_stops_at_first_invalid_step() {
        let schema = schema();
        let mut answers = AnswerSet::new("intake", "1");
        answer(&mut answers, "personal", json!({ "name": "Ada" }));
        answer(&mut answers, "claims", json!({ "claimTypes": ["overtime"] }));
        let sequencer = StepSequencer::resume(&schema, &answers);
        assert_eq!(
            sequencer.position(&schema, &answers),
            Some(Position::Step("overtime-details".into()))
        );
        assert!(sequencer.visited().contains("claims"));
    }

    #[test]
    fn finished_sequencer_denies_navigation() {
        let schema = schema();
        let answers = AnswerSet::new("intake", "1");
        let mut sequencer = StepSequencer::start(&schema, &answers);
        sequencer.finish();
        assert_eq!(sequencer.progress(&schema, &answers), 1.0);
        assert_eq!(sequencer.position(&schema, &answers), Some(Position::Done));
        assert_eq!(
            sequencer.advance(&schema, &answers).unwrap_err().reason,
            DenialReason::Finished
        );
    }

    #[test]
    fn jump_rules_skip_ahead() {
        let schema = Schema::from_value(json!({
            "id": "intake", "title": "Intake", "version": "1",
            "sections": [
                { "id": "start", "label": "Start", "always_shown": true,
                  "questions": [ { "id": "employed", "type": "boolean", "label": "Employed?", "required": true } ] },
                { "id": "employer", "label": "Employer", "always_shown": true, "questions": [] },
                { "id": "end", "label": "End", "always_shown": true, "questions": [] }
            ],
            "steps": [
                { "id": "start", "label": "Start", "sections": ["start"],
                  "next": [ { "when": { "op": "eq", "field": "employed", "value": false }, "goto": "end" } ] },
                { "id": "employer", "label": "Employer", "sections": ["employer"] },
                { "id": "end", "label": "End", "sections": ["end"] }
            ]
        }))
        .expect("schema");
        let mut answers = AnswerSet::new("intake", "1");
        answer(&mut answers, "start", json!({ "employed": false }));
        let mut sequencer = StepSequencer::start(&schema, &answers);
        assert_eq!(sequencer.advance(&schema, &answers).unwrap(), "end");
        assert_eq!(
            sequencer.advance(&schema, &answers).unwrap_err().reason,
            DenialReason::NoFurtherStep
        );
        assert_eq!(sequencer.retreat(&schema, &answers).unwrap(), "start");

        let ids: Vec<&str> = route(&schema, &answers).iter().map(|step| step.id.as_str()).collect();
        assert_eq!(ids, vec!["start", "end"]);
        answer(&mut answers, "start", json!({ "employed": true }));
        assert_eq!(route(&schema, &answers).len(), 3);
    }
}
