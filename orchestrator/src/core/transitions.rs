//! State-validity rules for consecutive state writes.
//!
//! Every write to the state store is checked against the previously persisted
//! state. Steps move `pending -> in_progress -> {success | failure}`, at most
//! one step becomes terminal per write, and every terminal step must point at
//! the event that proves it.

use crate::core::event::parse_event_id;
use crate::core::state::{PhaseState, RunState, StepState};
use crate::core::types::{PhaseStatus, RunStatus, StepStatus};

/// Message used when a write batches several step completions.
pub const BATCH_VIOLATION: &str = "cannot advance more than 1 step per update";

/// Step ids that became terminal (or were re-pointed at a new event) in `next`.
pub fn newly_terminal_steps<'a>(prev: &RunState, next: &'a RunState) -> Vec<&'a StepState> {
    next.steps
        .iter()
        .filter(|step| step.status.is_terminal())
        .filter(|step| match prev.step(&step.step_id) {
            Some(before) => before.status != step.status || before.event_id != step.event_id,
            None => true,
        })
        .collect()
}

/// Detect the degenerate batch where several steps turn terminal with no
/// events at all. Returns the offending step ids (empty when not fabricated).
pub fn detect_fabrication(prev: &RunState, next: &RunState) -> Vec<String> {
    let fresh = newly_terminal_steps(prev, next);
    if fresh.len() > 1 && fresh.iter().all(|step| step.event_id.is_none()) {
        return fresh.iter().map(|step| step.step_id.clone()).collect();
    }
    Vec::new()
}

/// Validate the very first write of a run.
pub fn validate_initial_state(state: &RunState) -> Vec<String> {
    let mut errors = Vec::new();
    if state.status != RunStatus::Pending {
        errors.push(format!(
            "new run must start pending (got {})",
            state.status.as_str()
        ));
    }
    for phase in &state.phases {
        if phase.status != PhaseStatus::Pending || phase.retry_count != 0 {
            errors.push(format!("phase '{}' must start pending", phase.name));
        }
    }
    for step in &state.steps {
        if step.status != StepStatus::Pending || step.event_id.is_some() || step.retries_used != 0 {
            errors.push(format!("step '{}' must start pending", step.step_id));
        }
    }
    errors
}

/// Validate the transition `prev -> next`. Returns stable error messages
/// (empty on success).
pub fn validate_state_write(prev: &RunState, next: &RunState) -> Vec<String> {
    let mut errors = Vec::new();
    validate_identity(prev, next, &mut errors);
    validate_run_transition(prev, next, &mut errors);
    validate_phases(prev, next, &mut errors);
    validate_steps(prev, next, &mut errors);
    validate_event_cursor(prev, next, &mut errors);
    errors
}

fn validate_identity(prev: &RunState, next: &RunState, errors: &mut Vec<String>) {
    if prev.run_id != next.run_id {
        errors.push("run_id is immutable".to_string());
    }
    if prev.plan_id != next.plan_id || prev.plan_digest != next.plan_digest {
        errors.push("plan reference is immutable".to_string());
    }
    if prev.started_at != next.started_at {
        errors.push("started_at is immutable".to_string());
    }
    if prev.workspace != next.workspace {
        errors.push("workspace binding is immutable".to_string());
    }
}

fn validate_run_transition(prev: &RunState, next: &RunState, errors: &mut Vec<String>) {
    let allowed = prev.status == next.status
        || matches!(
            (prev.status, next.status),
            (RunStatus::Pending, RunStatus::InProgress)
                | (RunStatus::Pending, RunStatus::Paused)
                | (RunStatus::Pending, RunStatus::Failed)
                | (RunStatus::InProgress, RunStatus::Paused)
                | (RunStatus::InProgress, RunStatus::Completed)
                | (RunStatus::InProgress, RunStatus::Failed)
                | (RunStatus::Paused, RunStatus::InProgress)
                | (RunStatus::Paused, RunStatus::Failed)
        );
    if !allowed {
        errors.push(format!(
            "run: illegal transition {} -> {}",
            prev.status.as_str(),
            next.status.as_str()
        ));
    }
    match next.status {
        RunStatus::Completed => {
            if next.completed_at.is_none() {
                errors.push("run: completed without completed_at".to_string());
            }
            for phase in &next.phases {
                let expected = if phase.enabled {
                    PhaseStatus::Completed
                } else {
                    PhaseStatus::Skipped
                };
                if phase.status != expected {
                    errors.push(format!(
                        "run: completed but phase '{}' is {}",
                        phase.name,
                        phase.status.as_str()
                    ));
                }
            }
        }
        RunStatus::Paused if next.pause_reason.is_none() => {
            errors.push("run: paused without pause_reason".to_string());
        }
        RunStatus::Failed if next.failure_reason.is_none() => {
            errors.push("run: failed without failure_reason".to_string());
        }
        _ => {}
    }
}

fn validate_phases(prev: &RunState, next: &RunState, errors: &mut Vec<String>) {
    if prev.phases.len() != next.phases.len() {
        errors.push(format!(
            "phase list changed length ({} -> {})",
            prev.phases.len(),
            next.phases.len()
        ));
        return;
    }
    for (before, after) in prev.phases.iter().zip(&next.phases) {
        if before.name != after.name
            || before.enabled != after.enabled
            || before.max_retries != after.max_retries
        {
            errors.push(format!("phase '{}' definition changed", before.name));
            continue;
        }
        validate_phase_transition(before, after, next, errors);
    }
}

fn validate_phase_transition(
    before: &PhaseState,
    after: &PhaseState,
    next: &RunState,
    errors: &mut Vec<String>,
) {
    let name = &after.name;
    if after.retry_count < before.retry_count || after.retry_count > before.retry_count + 1 {
        errors.push(format!(
            "phase '{name}': retry_count {} -> {} is not a single increment",
            before.retry_count, after.retry_count
        ));
    }
    if after.retry_count > after.max_retries {
        errors.push(format!(
            "phase '{name}': retry_count {} exceeds max_retries {}",
            after.retry_count, after.max_retries
        ));
    }

    let allowed = before.status == after.status
        || matches!(
            (before.status, after.status),
            (PhaseStatus::Pending, PhaseStatus::InProgress)
                | (PhaseStatus::Pending, PhaseStatus::Skipped)
                | (PhaseStatus::InProgress, PhaseStatus::Completed)
                | (PhaseStatus::InProgress, PhaseStatus::Failed)
        );
    if !allowed {
        errors.push(format!(
            "phase '{name}': illegal transition {} -> {}",
            before.status.as_str(),
            after.status.as_str()
        ));
    }

    match after.status {
        PhaseStatus::Completed => {
            let unfinished: Vec<&str> = next
                .steps_in_phase(name)
                .filter(|step| step.status != StepStatus::Success)
                .map(|step| step.step_id.as_str())
                .collect();
            if !unfinished.is_empty() {
                errors.push(format!(
                    "phase '{name}': completed but steps not successful: {}",
                    unfinished.join(", ")
                ));
            }
        }
        PhaseStatus::Skipped if after.enabled => {
            errors.push(format!("phase '{name}': enabled phases cannot be skipped"));
        }
        PhaseStatus::Failed => {
            if !next
                .steps_in_phase(name)
                .any(|step| step.status == StepStatus::Failure)
            {
                errors.push(format!("phase '{name}': failed without a failed step"));
            }
        }
        _ => {}
    }
}

fn validate_steps(prev: &RunState, next: &RunState, errors: &mut Vec<String>) {
    if prev.steps.len() != next.steps.len() {
        errors.push(format!(
            "step list changed length ({} -> {})",
            prev.steps.len(),
            next.steps.len()
        ));
        return;
    }

    for (before, after) in prev.steps.iter().zip(&next.steps) {
        if before.step_id != after.step_id
            || before.phase != after.phase
            || before.evidence_type != after.evidence_type
        {
            errors.push(format!("step '{}' definition changed", before.step_id));
            continue;
        }
        validate_step_transition(prev, next, before, after, errors);
    }

    let fresh = newly_terminal_steps(prev, next);
    if fresh.len() > 1 {
        let ids: Vec<&str> = fresh.iter().map(|step| step.step_id.as_str()).collect();
        errors.push(format!(
            "{BATCH_VIOLATION} ({} steps: {})",
            fresh.len(),
            ids.join(", ")
        ));
    }
    for step in fresh {
        if step.event_id.is_none() {
            errors.push(format!(
                "step '{}': marked {} without an event reference",
                step.step_id,
                step.status.as_str()
            ));
        }
    }
}

fn validate_step_transition(
    prev: &RunState,
    next: &RunState,
    before: &StepState,
    after: &StepState,
    errors: &mut Vec<String>,
) {
    let id = &after.step_id;
    if before.status == StepStatus::Success && before != after {
        errors.push(format!("step '{id}': already succeeded and is immutable"));
        return;
    }

    let retried = after.retries_used == before.retries_used + 1;
    if after.retries_used != before.retries_used && !retried {
        errors.push(format!(
            "step '{id}': retries_used {} -> {} is not a single increment",
            before.retries_used, after.retries_used
        ));
    }

    match (before.status, after.status) {
        (from, to) if from == to => {
            if before.event_id != after.event_id {
                errors.push(format!("step '{id}': event reference changed"));
            }
        }
        (StepStatus::Pending, StepStatus::InProgress)
        | (StepStatus::InProgress, StepStatus::Success)
        | (StepStatus::InProgress, StepStatus::Failure) => {}
        (StepStatus::InProgress, StepStatus::Pending) => {
            if after.event_id.is_some() {
                errors.push(format!("step '{id}': pending step cannot carry an event"));
            }
        }
        (StepStatus::Pending, StepStatus::Skipped) => {
            let phase_skipped = next
                .phase(&after.phase)
                .is_some_and(|phase| phase.status == PhaseStatus::Skipped);
            if !phase_skipped {
                errors.push(format!(
                    "step '{id}': only steps of a skipped phase can be skipped"
                ));
            }
        }
        (StepStatus::Failure, StepStatus::Pending) => {
            let phase_retried = match (prev.phase(&after.phase), next.phase(&after.phase)) {
                (Some(p), Some(n)) => n.retry_count == p.retry_count + 1,
                _ => false,
            };
            if !phase_retried || !retried {
                errors.push(format!(
                    "step '{id}': failure can only be reset by a phase retry"
                ));
            }
            if after.event_id.is_some() {
                errors.push(format!("step '{id}': pending step cannot carry an event"));
            }
        }
        (from, to) => errors.push(format!(
            "step '{id}': illegal transition {} -> {}",
            from.as_str(),
            to.as_str()
        )),
    }
}

fn validate_event_cursor(prev: &RunState, next: &RunState, errors: &mut Vec<String>) {
    let before = prev
        .integrity
        .last_event_id
        .as_deref()
        .and_then(parse_event_id)
        .unwrap_or(0);
    let after = match next.integrity.last_event_id.as_deref() {
        Some(id) => match parse_event_id(id) {
            Some(sequence) => sequence,
            None => {
                errors.push(format!("integrity: malformed last_event_id '{id}'"));
                return;
            }
        },
        None => 0,
    };
    if after < before {
        errors.push(format!(
            "integrity: last_event_id moved backwards ({before} -> {after})"
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event::event_id_for;
    use crate::test_support::{plan_with_phases, started_state, step, workspace};

    fn two_step_state() -> RunState {
        let plan = plan_with_phases(vec![("build", vec![step("a"), step("b")])]);
        let mut state = started_state(&plan);
        state.phases[0].status = PhaseStatus::InProgress;
        state
    }

    fn finish(state: &mut RunState, step_id: &str, status: StepStatus, seq: u64) {
        let step = state.step_mut(step_id).expect("step");
        step.status = status;
        step.event_id = Some(event_id_for(seq));
        state.integrity.last_event_id = Some(event_id_for(seq));
    }

    #[test]
    fn single_step_completion_is_accepted() {
        let mut prev = two_step_state();
        prev.step_mut("a").expect("a").status = StepStatus::InProgress;
        let mut next = prev.clone();
        finish(&mut next, "a", StepStatus::Success, 2);

        assert!(validate_state_write(&prev, &next).is_empty());
        assert!(detect_fabrication(&prev, &next).is_empty());
    }

    #[test]
    fn batching_two_completions_is_rejected() {
        let mut prev = two_step_state();
        prev.step_mut("a").expect("a").status = StepStatus::InProgress;
        prev.step_mut("b").expect("b").status = StepStatus::InProgress;
        let mut next = prev.clone();
        finish(&mut next, "a", StepStatus::Success, 2);
        finish(&mut next, "b", StepStatus::Success, 3);

        let errors = validate_state_write(&prev, &next);
        assert!(errors.iter().any(|err| err.contains(BATCH_VIOLATION)));
        assert!(detect_fabrication(&prev, &next).is_empty());
    }

    #[test]
    fn batch_without_events_is_fabrication() {
        let prev = two_step_state();
        let mut next = prev.clone();
        for step in &mut next.steps {
            step.status = StepStatus::Success;
        }

        assert_eq!(
            detect_fabrication(&prev, &next),
            vec!["a".to_string(), "b".to_string()]
        );
    }

    #[test]
    fn skipping_in_progress_is_rejected() {
        let prev = two_step_state();
        let mut next = prev.clone();
        finish(&mut next, "a", StepStatus::Success, 2);

        let errors = validate_state_write(&prev, &next);
        assert_eq!(
            errors,
            vec!["step 'a': illegal transition pending -> success".to_string()]
        );
    }

    #[test]
    fn terminal_step_without_event_is_rejected() {
        let mut prev = two_step_state();
        prev.step_mut("a").expect("a").status = StepStatus::InProgress;
        let mut next = prev.clone();
        next.step_mut("a").expect("a").status = StepStatus::Failure;

        let errors = validate_state_write(&prev, &next);
        assert!(
            errors
                .iter()
                .any(|err| err.contains("marked failure without an event reference"))
        );
    }

    #[test]
    fn success_is_immutable() {
        let mut prev = two_step_state();
        finish(&mut prev, "a", StepStatus::Success, 2);
        let mut next = prev.clone();
        next.step_mut("a").expect("a").status = StepStatus::Pending;
        next.step_mut("a").expect("a").event_id = None;

        let errors = validate_state_write(&prev, &next);
        assert!(errors.iter().any(|err| err.contains("immutable")));
    }

    #[test]
    fn failure_reset_requires_phase_retry() {
        let mut prev = two_step_state();
        prev.phases[0].max_retries = 1;
        finish(&mut prev, "a", StepStatus::Failure, 2);

        let mut next = prev.clone();
        {
            let step = next.step_mut("a").expect("a");
            step.status = StepStatus::Pending;
            step.event_id = None;
            step.retries_used = 1;
        }
        let errors = validate_state_write(&prev, &next);
        assert!(errors.iter().any(|err| err.contains("phase retry")));

        next.phases[0].retry_count = 1;
        assert!(validate_state_write(&prev, &next).is_empty());
    }

    #[test]
    fn phase_completion_requires_all_steps_successful() {
        let mut prev = two_step_state();
        finish(&mut prev, "a", StepStatus::Success, 2);
        let mut next = prev.clone();
        next.phases[0].status = PhaseStatus::Completed;

        let errors = validate_state_write(&prev, &next);
        assert_eq!(
            errors,
            vec!["phase 'build': completed but steps not successful: b".to_string()]
        );
    }

    #[test]
    fn completed_run_cannot_change_status() {
        let mut prev = two_step_state();
        prev.status = RunStatus::Failed;
        prev.failure_reason = Some("boom".to_string());
        let mut next = prev.clone();
        next.status = RunStatus::InProgress;

        let errors = validate_state_write(&prev, &next);
        assert!(
            errors
                .iter()
                .any(|err| err.contains("illegal transition failed -> in_progress"))
        );
    }

    #[test]
    fn pause_requires_reason() {
        let prev = two_step_state();
        let mut next = prev.clone();
        next.status = RunStatus::Paused;

        assert_eq!(
            validate_state_write(&prev, &next),
            vec!["run: paused without pause_reason".to_string()]
        );
    }

    #[test]
    fn initial_state_must_be_pending() {
        let plan = plan_with_phases(vec![("build", vec![step("a")])]);
        let mut state = RunState::initial("run-1", &plan, workspace(), chrono::Utc::now());
        assert!(validate_initial_state(&state).is_empty());

        state.steps[0].status = StepStatus::Success;
        assert_eq!(
            validate_initial_state(&state),
            vec!["step 'a' must start pending".to_string()]
        );
    }
}
