//! The run loop: phases in order, gates at phase boundaries, retries on
//! failure, and the completion check before a run may become `completed`.

use anyhow::Result;
use tracing::{info, instrument, warn};

use crate::core::event::NewEvent;
use crate::core::integrity::{ValidationMode, validate_state_integrity};
use crate::core::policy::{
    FailureDecision, apply_retry, decide_on_failure, gate_approval_key, gate_blocks,
};
use crate::core::state::RunState;
use crate::core::types::{EventKind, GatePoint, PhaseStatus, RunStatus, StepStatus};
use crate::engine::{RunContext, RunOutcome};
use crate::errors::{EngineError, engine_error};
use crate::guards::{ApprovalDecision, approval_guard};
use crate::plan::PhasePlan;
use crate::step::{StepAdvance, execute_step};

/// Progress of one pass over a phase's steps.
enum PhaseProgress {
    AllSucceeded,
    StepFailed { step_id: String, reason: String },
    Stopped(RunOutcome),
}

enum GateProgress {
    Proceed,
    Stopped(RunOutcome),
}

/// Drive an `in_progress` run until it completes, fails or pauses.
///
/// Unexpected errors pause the run with the error as `pause_reason`;
/// integrity errors are returned untouched.
#[instrument(skip_all, fields(run_id = %ctx.run_id))]
pub fn drive_run(ctx: &RunContext<'_>, state: &mut RunState) -> Result<RunOutcome> {
    match drive_phases(ctx, state) {
        Ok(outcome) => Ok(outcome),
        Err(err) => {
            if engine_error(&err).is_some_and(EngineError::is_integrity_error) {
                return Err(err);
            }
            if state.status != RunStatus::InProgress {
                return Err(err);
            }
            let reason = format!("internal error: {err:#}");
            let phase = state.current_phase.clone();
            let step = state
                .steps
                .iter()
                .find(|step| step.status == StepStatus::InProgress)
                .map(|step| step.step_id.clone());
            match ctx.pause(state, &reason, phase.as_deref(), step.as_deref()) {
                Ok(outcome) => Ok(outcome),
                Err(pause_err) => {
                    warn!(err = %format!("{pause_err:#}"), "could not record pause");
                    Err(err)
                }
            }
        }
    }
}

fn drive_phases(ctx: &RunContext<'_>, state: &mut RunState) -> Result<RunOutcome> {
    for phase in &ctx.plan.phases {
        let status = state
            .phase(&phase.name)
            .map_or(PhaseStatus::Pending, |recorded| recorded.status);
        match status {
            PhaseStatus::Completed | PhaseStatus::Skipped => continue,
            PhaseStatus::Failed => {
                let reason = format!("phase '{}' already failed", phase.name);
                return ctx.fail(state, &reason);
            }
            PhaseStatus::Pending if !phase.enabled => {
                skip_phase(ctx, state, phase)?;
                continue;
            }
            PhaseStatus::Pending => {
                if let GateProgress::Stopped(outcome) =
                    pass_gate(ctx, state, phase, GatePoint::Before)?
                {
                    return Ok(outcome);
                }
                let event = NewEvent::new(EventKind::PhaseStart).phase(&phase.name);
                ctx.record(state, event, |next, _| {
                    if let Some(recorded) = next.phase_mut(&phase.name) {
                        recorded.status = PhaseStatus::InProgress;
                    }
                    next.current_phase = Some(phase.name.clone());
                    next.current_step = None;
                    next.touch_phase(&phase.name);
                })?;
                info!(phase = %phase.name, "phase started");
            }
            PhaseStatus::InProgress => {}
        }

        if let Some(outcome) = run_phase(ctx, state, phase)? {
            return Ok(outcome);
        }

        if let GateProgress::Stopped(outcome) = pass_gate(ctx, state, phase, GatePoint::After)? {
            return Ok(outcome);
        }
        let event = NewEvent::new(EventKind::PhaseComplete).phase(&phase.name);
        ctx.record(state, event, |next, _| {
            if let Some(recorded) = next.phase_mut(&phase.name) {
                recorded.status = PhaseStatus::Completed;
            }
            next.current_step = None;
        })?;
        info!(phase = %phase.name, "phase completed");
    }

    finish(ctx, state)
}

/// Run the phase's steps, retrying failed steps while budget remains.
/// Returns `Some` when the run stopped.
fn run_phase(
    ctx: &RunContext<'_>,
    state: &mut RunState,
    phase: &PhasePlan,
) -> Result<Option<RunOutcome>> {
    loop {
        match run_phase_steps(ctx, state, phase)? {
            PhaseProgress::AllSucceeded => return Ok(None),
            PhaseProgress::Stopped(outcome) => return Ok(Some(outcome)),
            PhaseProgress::StepFailed { step_id, reason } => {
                let Some(recorded) = state.phase(&phase.name) else {
                    return Err(anyhow::anyhow!("phase '{}' missing from state", phase.name));
                };
                match decide_on_failure(recorded) {
                    FailureDecision::Retry { retry_count } => {
                        info!(phase = %phase.name, retry_count, "retrying phase");
                        let event = NewEvent::new(EventKind::PhaseRetry)
                            .phase(&phase.name)
                            .meta("retry_count", retry_count)
                            .meta("failed_step", step_id.as_str())
                            .meta("reason", reason.as_str());
                        ctx.record(state, event, |next, _| {
                            apply_retry(next, &phase.name);
                            next.current_step = None;
                        })?;
                    }
                    FailureDecision::Fail => {
                        let event = NewEvent::new(EventKind::PhaseFailed)
                            .phase(&phase.name)
                            .meta("failed_step", step_id.as_str())
                            .meta("reason", reason.as_str());
                        ctx.record(state, event, |next, _| {
                            if let Some(recorded) = next.phase_mut(&phase.name) {
                                recorded.status = PhaseStatus::Failed;
                            }
                            next.current_step = Some(step_id.clone());
                        })?;
                        let reason = EngineError::StepFailure { step_id, reason }.to_string();
                        return ctx.fail(state, &reason).map(Some);
                    }
                }
            }
        }
    }
}

fn run_phase_steps(
    ctx: &RunContext<'_>,
    state: &mut RunState,
    phase: &PhasePlan,
) -> Result<PhaseProgress> {
    for step in &phase.steps {
        let Some(recorded) = state.step(&step.step_id) else {
            return Err(anyhow::anyhow!("step '{}' missing from state", step.step_id));
        };
        match recorded.status {
            StepStatus::Success | StepStatus::Skipped => continue,
            StepStatus::Failure => {
                // A failure recorded before a crash still needs its retry decision.
                return Ok(PhaseProgress::StepFailed {
                    step_id: step.step_id.clone(),
                    reason: recorded
                        .reason
                        .clone()
                        .unwrap_or_else(|| "step failed".to_string()),
                });
            }
            StepStatus::Pending | StepStatus::InProgress => {}
        }
        if ctx.cancelled() {
            let reason = format!("cancelled before step '{}'", step.step_id);
            return ctx
                .pause(state, &reason, Some(&phase.name), Some(&step.step_id))
                .map(PhaseProgress::Stopped);
        }
        match execute_step(ctx, state, &phase.name, step)? {
            StepAdvance::Succeeded => {}
            StepAdvance::Failed { reason } => {
                return Ok(PhaseProgress::StepFailed {
                    step_id: step.step_id.clone(),
                    reason,
                });
            }
            StepAdvance::Stopped(outcome) => return Ok(PhaseProgress::Stopped(outcome)),
        }
    }
    Ok(PhaseProgress::AllSucceeded)
}

/// Record a disabled phase as skipped: one phase event, then one event per step.
fn skip_phase(ctx: &RunContext<'_>, state: &mut RunState, phase: &PhasePlan) -> Result<()> {
    info!(phase = %phase.name, "skipping disabled phase");
    let event = NewEvent::new(EventKind::PhaseSkipped).phase(&phase.name);
    ctx.record(state, event, |next, _| {
        if let Some(recorded) = next.phase_mut(&phase.name) {
            recorded.status = PhaseStatus::Skipped;
        }
    })?;
    for step in &phase.steps {
        let attempt = state
            .step(&step.step_id)
            .map_or(1, |recorded| recorded.attempt());
        let event = NewEvent::new(EventKind::StepComplete)
            .phase(&phase.name)
            .step(&step.step_id, StepStatus::Skipped)
            .meta("attempt", attempt)
            .meta("reason", "phase disabled");
        ctx.record(state, event, |next, event| {
            if let Some(recorded) = next.step_mut(&step.step_id) {
                recorded.status = StepStatus::Skipped;
                recorded.event_id = Some(event.event_id.clone());
                recorded.reason = Some("phase disabled".to_string());
            }
        })?;
    }
    Ok(())
}

fn pass_gate(
    ctx: &RunContext<'_>,
    state: &mut RunState,
    phase: &PhasePlan,
    point: GatePoint,
) -> Result<GateProgress> {
    if !gate_blocks(&ctx.plan, &phase.name, point) {
        return Ok(GateProgress::Proceed);
    }
    let key = gate_approval_key(&phase.name, point);
    let purpose = format!("{} phase '{}'", point.as_str(), phase.name);
    let events = ctx.events()?;
    let decision = approval_guard(
        ctx.approvals,
        &events,
        &key,
        &purpose,
        ctx.approval_policy(),
        &ctx.cancel,
    )?;
    match decision {
        ApprovalDecision::AlreadyConsumed => Ok(GateProgress::Proceed),
        ApprovalDecision::Granted(approval) => {
            let mut event = NewEvent::new(EventKind::ApprovalGranted)
                .phase(&phase.name)
                .meta("key", key.as_str())
                .meta("gate", point.as_str());
            if let Some(by) = approval.approved_by {
                event = event.meta("approved_by", by);
            }
            if let Some(note) = approval.note {
                event = event.meta("note", note);
            }
            ctx.record(state, event, |_, _| {})?;
            Ok(GateProgress::Proceed)
        }
        ApprovalDecision::Blocked { reason } => ctx
            .pause(state, &reason, Some(&phase.name), None)
            .map(GateProgress::Stopped),
    }
}

/// Completion check, then `workflow_complete`. A failed check fails the run.
fn finish(ctx: &RunContext<'_>, state: &mut RunState) -> Result<RunOutcome> {
    let events = ctx.events()?;
    let check = validate_state_integrity(&ctx.plan, state, &events, ValidationMode::Completion);
    if !check.passed() {
        warn!(discrepancies = %check.summary(), "completion check failed");
        let reason = format!("completion check failed: {}", check.summary());
        return ctx.fail(state, &reason);
    }
    ctx.complete(state)
}
