//! Human-readable operator reports for paused, failed and completed runs.

use crate::core::state::RunState;
use crate::core::types::{RunStatus, StepStatus};

/// Where a run stopped: the phase and step it would continue from.
pub fn stop_point(state: &RunState) -> (Option<String>, Option<String>) {
    let step = state
        .current_step
        .clone()
        .or_else(|| {
            state
                .steps
                .iter()
                .find(|step| !step.status.is_terminal())
                .map(|step| step.step_id.clone())
        });
    let phase = state.current_phase.clone().or_else(|| {
        step.as_deref()
            .and_then(|id| state.step(id))
            .map(|step| step.phase.clone())
    });
    (phase, step)
}

/// Render the operator report for `state`.
pub fn render_report(state: &RunState) -> String {
    let mut out = String::new();
    let done = state
        .steps
        .iter()
        .filter(|step| step.status == StepStatus::Success)
        .count();
    out.push_str(&format!("run {} ({})\n", state.run_id, state.status.as_str()));
    out.push_str(&format!("plan: {}\n", state.plan_id));
    out.push_str(&format!("steps: {done}/{} successful\n", state.steps.len()));

    for phase in &state.phases {
        out.push_str(&format!(
            "  [{}] {}",
            phase.status.as_str(),
            phase.name
        ));
        if phase.retry_count > 0 {
            out.push_str(&format!(" (retry {}/{})", phase.retry_count, phase.max_retries));
        }
        out.push('\n');
        for step in state.steps_in_phase(&phase.name) {
            out.push_str(&format!("    [{}] {}", step.status.as_str(), step.step_id));
            if let Some(event_id) = step.event_id.as_deref() {
                out.push_str(&format!(" ({event_id})"));
            }
            if let Some(reason) = step.reason.as_deref() {
                out.push_str(&format!(": {reason}"));
            }
            out.push('\n');
        }
    }

    let (phase, step) = stop_point(state);
    match state.status {
        RunStatus::Paused => {
            out.push_str(&format!(
                "paused at {}: {}\n",
                describe_position(phase.as_deref(), step.as_deref()),
                state.pause_reason.as_deref().unwrap_or("unknown reason")
            ));
            out.push_str(&format!(
                "to continue: orchestrator resume {}\n",
                state.run_id
            ));
        }
        RunStatus::Failed => {
            out.push_str(&format!(
                "failed at {}: {}\n",
                describe_position(phase.as_deref(), step.as_deref()),
                state.failure_reason.as_deref().unwrap_or("unknown reason")
            ));
        }
        RunStatus::Completed => {
            if let Some(completed_at) = state.completed_at {
                out.push_str(&format!("completed at {}\n", completed_at.to_rfc3339()));
            }
        }
        RunStatus::Pending | RunStatus::InProgress => {
            out.push_str(&format!(
                "next: {}\n",
                describe_position(phase.as_deref(), step.as_deref())
            ));
        }
    }
    out
}

fn describe_position(phase: Option<&str>, step: Option<&str>) -> String {
    match (phase, step) {
        (Some(phase), Some(step)) => format!("{phase}/{step}"),
        (Some(phase), None) => phase.to_string(),
        (None, Some(step)) => step.to_string(),
        (None, None) => "run boundary".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{plan_with_phases, started_state, step};

    #[test]
    fn paused_report_names_position_reason_and_resume_command() {
        let plan = plan_with_phases(vec![("build", vec![step("a"), step("b")])]);
        let mut state = started_state(&plan);
        state.status = RunStatus::Paused;
        state.current_phase = Some("build".to_string());
        state.current_step = Some("b".to_string());
        state.pause_reason = Some("awaiting approval 'step-b'".to_string());

        let report = render_report(&state);
        assert!(report.contains("paused at build/b: awaiting approval 'step-b'"));
        assert!(report.contains(&format!("orchestrator resume {}", state.run_id)));
    }

    #[test]
    fn stop_point_falls_back_to_first_unfinished_step() {
        let plan = plan_with_phases(vec![("frame", vec![step("a")]), ("build", vec![step("b")])]);
        let mut state = started_state(&plan);
        state.steps[0].status = StepStatus::Success;

        assert_eq!(
            stop_point(&state),
            (Some("build".to_string()), Some("b".to_string()))
        );
    }
}
