//! Retry and autonomy decisions.
//!
//! Gates block according to the plan's autonomy level; failed phases retry
//! their failed steps until the phase's `max_retries` budget is exhausted.

use crate::core::state::{PhaseState, RunState};
use crate::core::types::{AutonomyLevel, GatePoint, StepStatus};
use crate::plan::Plan;

/// True if the gate at `point` of `phase` must wait for an approval signal.
pub fn gate_blocks(plan: &Plan, phase: &str, point: GatePoint) -> bool {
    match plan.autonomy.level {
        AutonomyLevel::Autonomous => false,
        AutonomyLevel::Guarded => plan.has_gate(phase, point),
        AutonomyLevel::Assisted => point == GatePoint::Before || plan.has_gate(phase, point),
        AutonomyLevel::DryRun => true,
    }
}

/// Approval key consumed by a phase gate.
pub fn gate_approval_key(phase: &str, point: GatePoint) -> String {
    format!("gate-{}-{phase}", point.as_str())
}

/// Approval key consumed by a destructive step.
pub fn step_approval_key(step_id: &str) -> String {
    format!("step-{step_id}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureDecision {
    /// Reset the failed steps and run the phase again.
    Retry { retry_count: u32 },
    /// Retry budget exhausted; the phase (and the run) fails.
    Fail,
}

pub fn decide_on_failure(phase: &PhaseState) -> FailureDecision {
    if phase.retry_count < phase.max_retries {
        FailureDecision::Retry {
            retry_count: phase.retry_count + 1,
        }
    } else {
        FailureDecision::Fail
    }
}

/// Failed steps of `phase` that a retry would reset to `pending`.
pub fn steps_to_retry(state: &RunState, phase: &str) -> Vec<String> {
    state
        .steps_in_phase(phase)
        .filter(|step| step.status == StepStatus::Failure)
        .map(|step| step.step_id.clone())
        .collect()
}

/// Apply a phase retry in memory: bump the phase counter and reset failed
/// steps. Successful steps are never re-executed.
pub fn apply_retry(state: &mut RunState, phase: &str) -> Vec<String> {
    let reset = steps_to_retry(state, phase);
    if let Some(recorded) = state.phase_mut(phase) {
        recorded.retry_count += 1;
    }
    for step_id in &reset {
        if let Some(step) = state.step_mut(step_id) {
            step.status = StepStatus::Pending;
            step.event_id = None;
            step.retries_used += 1;
        }
    }
    reset
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::PhaseStatus;
    use crate::plan::GateSpec;
    use crate::test_support::{plan_with_phases, started_state, step};

    fn plan_at(level: AutonomyLevel) -> Plan {
        let mut plan = plan_with_phases(vec![("frame", vec![step("a")]), ("build", vec![step("b")])]);
        plan.autonomy.level = level;
        plan.autonomy.gates.push(GateSpec {
            phase: "build".to_string(),
            when: GatePoint::After,
        });
        plan
    }

    #[test]
    fn autonomy_levels_control_gates() {
        let autonomous = plan_at(AutonomyLevel::Autonomous);
        assert!(!gate_blocks(&autonomous, "build", GatePoint::After));

        let guarded = plan_at(AutonomyLevel::Guarded);
        assert!(gate_blocks(&guarded, "build", GatePoint::After));
        assert!(!gate_blocks(&guarded, "build", GatePoint::Before));
        assert!(!gate_blocks(&guarded, "frame", GatePoint::After));

        let assisted = plan_at(AutonomyLevel::Assisted);
        assert!(gate_blocks(&assisted, "frame", GatePoint::Before));
        assert!(!gate_blocks(&assisted, "frame", GatePoint::After));

        let dry_run = plan_at(AutonomyLevel::DryRun);
        assert!(gate_blocks(&dry_run, "frame", GatePoint::After));
    }

    #[test]
    fn approval_keys_are_stable() {
        assert_eq!(gate_approval_key("build", GatePoint::Before), "gate-before-build");
        assert_eq!(step_approval_key("wipe"), "step-wipe");
    }

    #[test]
    fn retry_until_budget_is_exhausted() {
        let plan = plan_with_phases(vec![("build", vec![step("a"), step("b")])]);
        let mut state = started_state(&plan);
        state.phases[0].max_retries = 1;
        state.phases[0].status = PhaseStatus::InProgress;
        state.steps[0].status = StepStatus::Success;
        state.steps[1].status = StepStatus::Failure;

        assert_eq!(
            decide_on_failure(&state.phases[0]),
            FailureDecision::Retry { retry_count: 1 }
        );
        let reset = apply_retry(&mut state, "build");
        assert_eq!(reset, vec!["b".to_string()]);
        assert_eq!(state.steps[0].status, StepStatus::Success);
        assert_eq!(state.steps[1].status, StepStatus::Pending);
        assert_eq!(state.steps[1].attempt(), 2);
        assert_eq!(decide_on_failure(&state.phases[0]), FailureDecision::Fail);
    }
}
