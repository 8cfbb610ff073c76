//! Cross-checks state claims against the event log.
//!
//! The integrity record hash covers every field of the state except the hash
//! itself and its timestamp. Any out-of-band edit is detectable on the next
//! read.

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::core::event::Event;
use crate::core::state::RunState;
use crate::core::types::{PhaseStatus, StepStatus};
use crate::plan::Plan;

/// Digest over the canonical JSON of `state`, minus `integrity.steps_hash`
/// and `integrity.computed_at`.
pub fn compute_state_hash(state: &RunState) -> serde_json::Result<String> {
    let mut value = serde_json::to_value(state)?;
    if let Some(integrity) = value.get_mut("integrity").and_then(Value::as_object_mut) {
        integrity.remove("steps_hash");
        integrity.remove("computed_at");
    }
    let canonical = serde_json::to_vec(&value)?;
    Ok(hex::encode(Sha256::digest(&canonical)))
}

/// True if the stored integrity hash matches the state's content.
pub fn integrity_hash_matches(state: &RunState) -> bool {
    compute_state_hash(state).is_ok_and(|hash| hash == state.integrity.steps_hash)
}

/// Which set of checks to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationMode {
    /// After every step completion and on resume.
    PostStep,
    /// Before the run may transition to `completed`.
    Completion,
}

impl ValidationMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ValidationMode::PostStep => "post-step",
            ValidationMode::Completion => "completion",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Discrepancy {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub check: &'static str,
    pub detail: String,
}

impl Discrepancy {
    fn run(check: &'static str, detail: String) -> Self {
        Self {
            phase: None,
            step_id: None,
            check,
            detail,
        }
    }

    fn phase(phase: &str, check: &'static str, detail: String) -> Self {
        Self {
            phase: Some(phase.to_string()),
            step_id: None,
            check,
            detail,
        }
    }

    fn step(phase: &str, step_id: &str, check: &'static str, detail: String) -> Self {
        Self {
            phase: Some(phase.to_string()),
            step_id: Some(step_id.to_string()),
            check,
            detail,
        }
    }
}

impl std::fmt::Display for Discrepancy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.phase, &self.step_id) {
            (Some(phase), Some(step)) => write!(f, "[{}] {phase}/{step}: {}", self.check, self.detail),
            (Some(phase), None) => write!(f, "[{}] {phase}: {}", self.check, self.detail),
            _ => write!(f, "[{}] {}", self.check, self.detail),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    pub discrepancies: Vec<Discrepancy>,
}

impl ValidationResult {
    pub fn passed(&self) -> bool {
        self.discrepancies.is_empty()
    }

    /// One-line summary suitable for a pause/failure reason.
    pub fn summary(&self) -> String {
        self.discrepancies
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Validate `state` against `events` (the full log of the run, in order).
pub fn validate_state_integrity(
    plan: &Plan,
    state: &RunState,
    events: &[Event],
    mode: ValidationMode,
) -> ValidationResult {
    let mut discrepancies = Vec::new();
    check_sequence(state, events, &mut discrepancies);
    check_step_events(state, events, &mut discrepancies);
    check_event_uniqueness(events, &mut discrepancies);
    check_completed_phases(state, &mut discrepancies);
    if mode == ValidationMode::Completion {
        check_completion(plan, state, events, &mut discrepancies);
    }
    ValidationResult { discrepancies }
}

fn check_sequence(state: &RunState, events: &[Event], out: &mut Vec<Discrepancy>) {
    for (index, event) in events.iter().enumerate() {
        let expected = index as u64 + 1;
        if event.sequence != expected {
            out.push(Discrepancy::run(
                "event_sequence",
                format!(
                    "expected sequence {expected}, found {} ({})",
                    event.sequence, event.event_id
                ),
            ));
            return;
        }
        if event.run_id != state.run_id {
            out.push(Discrepancy::run(
                "event_run",
                format!("{} belongs to run '{}'", event.event_id, event.run_id),
            ));
        }
    }
}

fn check_step_events(state: &RunState, events: &[Event], out: &mut Vec<Discrepancy>) {
    let by_id: HashMap<&str, &Event> = events
        .iter()
        .map(|event| (event.event_id.as_str(), event))
        .collect();

    for step in &state.steps {
        if !step.status.is_terminal() {
            continue;
        }
        let Some(event_id) = step.event_id.as_deref() else {
            out.push(Discrepancy::step(
                &step.phase,
                &step.step_id,
                "event_reference",
                format!("{} without an event reference", step.status.as_str()),
            ));
            continue;
        };
        let Some(event) = by_id.get(event_id) else {
            out.push(Discrepancy::step(
                &step.phase,
                &step.step_id,
                "event_exists",
                format!("event {event_id} not found in the log"),
            ));
            continue;
        };
        if !event.proves_step(&step.step_id, step.status, step.attempt()) {
            out.push(Discrepancy::step(
                &step.phase,
                &step.step_id,
                "event_matches",
                format!(
                    "event {event_id} records {} {} attempt {} but state claims {} attempt {}",
                    event.step_id.as_deref().unwrap_or("-"),
                    event.status.as_deref().unwrap_or("-"),
                    event
                        .attempt()
                        .map_or_else(|| "-".to_string(), |n| n.to_string()),
                    step.status.as_str(),
                    step.attempt()
                ),
            ));
        }
    }
}

fn check_event_uniqueness(events: &[Event], out: &mut Vec<Discrepancy>) {
    let mut seen = HashSet::new();
    for event in events {
        let (Some(step_id), Some(status)) = (event.step_id.as_deref(), event.status.as_deref())
        else {
            continue;
        };
        if !seen.insert((step_id, status, event.attempt())) {
            out.push(Discrepancy::step(
                event.phase.as_deref().unwrap_or("-"),
                step_id,
                "event_unique",
                format!("duplicate {status} event {}", event.event_id),
            ));
        }
    }
}

fn check_completed_phases(state: &RunState, out: &mut Vec<Discrepancy>) {
    for phase in &state.phases {
        if phase.status != PhaseStatus::Completed {
            continue;
        }
        for step in state.steps_in_phase(&phase.name) {
            if step.status != StepStatus::Success {
                out.push(Discrepancy::step(
                    &phase.name,
                    &step.step_id,
                    "phase_completion",
                    format!("phase completed while step is {}", step.status.as_str()),
                ));
            }
        }
    }
}

fn check_completion(plan: &Plan, state: &RunState, events: &[Event], out: &mut Vec<Discrepancy>) {
    let declared = plan.step_count();
    if state.steps.len() != declared {
        out.push(Discrepancy::run(
            "step_count",
            format!(
                "state records {} steps, plan declares {declared}",
                state.steps.len()
            ),
        ));
    }
    for phase in &plan.phases {
        for step in &phase.steps {
            if state.step(&step.step_id).is_none() {
                out.push(Discrepancy::step(
                    &phase.name,
                    &step.step_id,
                    "step_recorded",
                    "declared step missing from state".to_string(),
                ));
            }
        }
        let Some(recorded) = state.phase(&phase.name) else {
            out.push(Discrepancy::phase(
                &phase.name,
                "phase_recorded",
                "declared phase missing from state".to_string(),
            ));
            continue;
        };
        if phase.enabled && recorded.status != PhaseStatus::Completed {
            out.push(Discrepancy::phase(
                &phase.name,
                "phase_completion",
                format!("enabled phase is {}", recorded.status.as_str()),
            ));
        }
    }

    if !integrity_hash_matches(state) {
        out.push(Discrepancy::run(
            "integrity_hash",
            "stored steps_hash does not match recomputed hash".to_string(),
        ));
    }

    match state.integrity.last_event_id.as_deref() {
        Some(last) if events.iter().any(|event| event.event_id == last) => {}
        Some(last) => out.push(Discrepancy::run(
            "last_event",
            format!("last_event_id {last} not found in the log"),
        )),
        None => out.push(Discrepancy::run(
            "last_event",
            "no events recorded for the run".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event::{NewEvent, event_id_for};
    use crate::core::types::EventKind;
    use crate::test_support::{event_from, plan_with_phases, started_state, step};

    fn completed_fixture() -> (Plan, RunState, Vec<Event>) {
        let plan = plan_with_phases(vec![("build", vec![step("a"), step("b")])]);
        let mut state = started_state(&plan);
        let mut events = vec![event_from(&state.run_id, 1, NewEvent::new(EventKind::WorkflowStart))];
        for (index, id) in ["a", "b"].iter().enumerate() {
            let seq = index as u64 + 2;
            events.push(event_from(
                &state.run_id,
                seq,
                NewEvent::new(EventKind::StepComplete)
                    .phase("build")
                    .step(*id, StepStatus::Success)
                    .meta("attempt", 1),
            ));
            let recorded = state.step_mut(id).expect("step");
            recorded.status = StepStatus::Success;
            recorded.event_id = Some(event_id_for(seq));
        }
        state.phases[0].status = PhaseStatus::Completed;
        state.integrity.last_event_id = Some(event_id_for(3));
        state.integrity.steps_hash = compute_state_hash(&state).expect("hash");
        (plan, state, events)
    }

    #[test]
    fn consistent_state_passes_completion_check() {
        let (plan, state, events) = completed_fixture();
        let result = validate_state_integrity(&plan, &state, &events, ValidationMode::Completion);
        assert!(result.passed(), "{}", result.summary());
    }

    #[test]
    fn dangling_success_claim_is_reported() {
        let (plan, mut state, mut events) = completed_fixture();
        events.pop();
        state.integrity.last_event_id = Some(event_id_for(2));

        let result = validate_state_integrity(&plan, &state, &events, ValidationMode::PostStep);
        assert_eq!(result.discrepancies.len(), 1);
        assert_eq!(result.discrepancies[0].check, "event_exists");
        assert_eq!(result.discrepancies[0].step_id.as_deref(), Some("b"));
    }

    #[test]
    fn mismatched_event_status_is_reported() {
        let (plan, state, mut events) = completed_fixture();
        events[2].status = Some("failure".to_string());

        let result = validate_state_integrity(&plan, &state, &events, ValidationMode::PostStep);
        assert!(result.discrepancies.iter().any(|d| d.check == "event_matches"));
    }

    #[test]
    fn dropped_step_fails_completion() {
        let (mut plan, state, events) = completed_fixture();
        plan.phases[0].steps.push(step("c"));

        let result = validate_state_integrity(&plan, &state, &events, ValidationMode::Completion);
        let checks: Vec<&str> = result.discrepancies.iter().map(|d| d.check).collect();
        assert!(checks.contains(&"step_count"));
        assert!(checks.contains(&"step_recorded"));
    }

    #[test]
    fn sequence_gaps_are_reported() {
        let (plan, state, mut events) = completed_fixture();
        events.remove(1);

        let result = validate_state_integrity(&plan, &state, &events, ValidationMode::PostStep);
        assert!(result.discrepancies.iter().any(|d| d.check == "event_sequence"));
    }

    #[test]
    fn completed_phase_with_pending_step_is_reported() {
        let (plan, mut state, events) = completed_fixture();
        let b = state.step_mut("b").expect("b");
        b.status = StepStatus::Pending;
        b.event_id = None;

        let result = validate_state_integrity(&plan, &state, &events, ValidationMode::PostStep);
        assert_eq!(result.discrepancies.len(), 1);
        assert_eq!(result.discrepancies[0].check, "phase_completion");
    }

    #[test]
    fn hash_detects_status_edits() {
        let (_, mut state, _) = completed_fixture();
        assert!(integrity_hash_matches(&state));
        state.steps[0].status = StepStatus::Failure;
        assert!(!integrity_hash_matches(&state));
    }

    #[test]
    fn hash_covers_fields_beyond_statuses() {
        let (_, state, _) = completed_fixture();
        let edits: [fn(&mut RunState); 6] = [
            |s| s.plan_digest = "0".repeat(64),
            |s| s.workspace.branch = Some("main".to_string()),
            |s| s.pause_reason = Some("edited".to_string()),
            |s| s.current_step = Some("b".to_string()),
            |s| s.sessions.current_session_id = Some("sess-forged".to_string()),
            |s| s.integrity.last_event_id = None,
        ];
        for edit in edits {
            let mut edited = state.clone();
            edit(&mut edited);
            assert!(!integrity_hash_matches(&edited), "{edited:?}");
        }

        let mut resealed = state.clone();
        resealed.integrity.computed_at = resealed.integrity.computed_at + chrono::Duration::seconds(5);
        assert!(integrity_hash_matches(&resealed));
    }
}
