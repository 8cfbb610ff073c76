//! Execution of a single step attempt: BEFORE guards, EXECUTE, AFTER
//! evidence check, event append, incremental state write and the integrity
//! post-check.

use anyhow::Result;
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::core::event::NewEvent;
use crate::core::integrity::{ValidationMode, validate_state_integrity};
use crate::core::policy::step_approval_key;
use crate::core::state::RunState;
use crate::core::types::{EventKind, GuardVerdict, StepStatus};
use crate::engine::{RunContext, RunOutcome};
use crate::errors::EngineError;
use crate::guards::{
    ApprovalDecision, WORKSPACE_GUARD, approval_guard, evidence_guard, needs_workspace_guard,
    workspace_safety_guard,
};
use crate::io::executor::{ActionOutcome, StepRequest, StepResult};
use crate::plan::StepPlan;

/// What happened to the run after one step attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepAdvance {
    Succeeded,
    /// The step ended in `failure`; the caller applies the retry policy.
    Failed { reason: String },
    /// The run was paused or failed; stop driving.
    Stopped(RunOutcome),
}

/// Run one attempt of `step` inside the in-progress `phase`.
#[instrument(skip_all, fields(run_id = %ctx.run_id, phase = %phase, step_id = %step.step_id))]
pub fn execute_step(
    ctx: &RunContext<'_>,
    state: &mut RunState,
    phase: &str,
    step: &StepPlan,
) -> Result<StepAdvance> {
    let step_id = step.step_id.as_str();

    if needs_workspace_guard(step) {
        let verdict = workspace_safety_guard(
            &state.workspace,
            &ctx.config.workspace,
            &ctx.paths.workspace,
            step,
        )?;
        if let GuardVerdict::Fail { reason } = verdict {
            let reason = EngineError::GuardViolation {
                guard: WORKSPACE_GUARD,
                reason,
            }
            .to_string();
            return ctx
                .pause(state, &reason, Some(phase), Some(step_id))
                .map(StepAdvance::Stopped);
        }
    }

    if step.destructive {
        let key = step_approval_key(step_id);
        let events = ctx.events()?;
        let decision = approval_guard(
            ctx.approvals,
            &events,
            &key,
            "destructive step",
            ctx.approval_policy(),
            &ctx.cancel,
        )?;
        match decision {
            ApprovalDecision::AlreadyConsumed => {}
            ApprovalDecision::Granted(approval) => {
                let mut event = NewEvent::new(EventKind::ApprovalGranted)
                    .phase(phase)
                    .meta("key", key.as_str())
                    .meta("step_id", step_id);
                if let Some(by) = approval.approved_by {
                    event = event.meta("approved_by", by);
                }
                if let Some(note) = approval.note {
                    event = event.meta("note", note);
                }
                ctx.record(state, event, |_, _| {})?;
            }
            ApprovalDecision::Blocked { reason } => {
                return ctx
                    .pause(state, &reason, Some(phase), Some(step_id))
                    .map(StepAdvance::Stopped);
            }
        }
    }

    ctx.write(state, |next| {
        next.current_phase = Some(phase.to_string());
        next.current_step = Some(step_id.to_string());
        next.touch_phase(phase);
        if let Some(recorded) = next.step_mut(step_id) {
            recorded.status = StepStatus::InProgress;
            recorded.reason = None;
        }
    })?;
    let attempt = state
        .step(step_id)
        .map_or(1, |recorded| recorded.attempt());

    let baseline = ctx.evidence.baseline(&step.evidence)?;
    let request = StepRequest {
        run_id: ctx.run_id.clone(),
        phase: phase.to_string(),
        step: step.clone(),
        attempt,
        workdir: ctx.paths.workspace.clone(),
        attempt_dir: ctx.run_paths.attempt_dir(step_id, attempt),
        timeout: ctx.config.step_timeout(),
        output_limit_bytes: ctx.config.executor_output_limit_bytes,
    };
    info!(attempt, "executing step");
    let result = match ctx.executor.execute(&request) {
        Ok(result) => result,
        Err(err) => {
            warn!(err = %format!("{err:#}"), "step executor errored");
            StepResult::failed(format!("executor error: {err:#}"))
        }
    };

    let (status, reason) = match &result.outcome {
        ActionOutcome::Unavailable { reason } => {
            let reason = format!("step '{step_id}' cannot run: {reason}");
            return ctx
                .pause(state, &reason, Some(phase), Some(step_id))
                .map(StepAdvance::Stopped);
        }
        ActionOutcome::Failed { reason } if ctx.cancelled() => {
            // An interrupted attempt is redone on resume.
            let reason = format!("cancelled while step '{step_id}' was running: {reason}");
            return ctx
                .pause(state, &reason, Some(phase), Some(step_id))
                .map(StepAdvance::Stopped);
        }
        ActionOutcome::Failed { reason } => (StepStatus::Failure, Some(reason.clone())),
        ActionOutcome::Succeeded => {
            match evidence_guard(ctx.evidence, step, &baseline, &result.evidence) {
                GuardVerdict::Pass => (StepStatus::Success, None),
                GuardVerdict::Fail { reason } => {
                    let missing = EngineError::EvidenceMissing {
                        step_id: step_id.to_string(),
                        reason,
                    };
                    (StepStatus::Failure, Some(missing.to_string()))
                }
            }
        }
    };

    let mut event = NewEvent::new(EventKind::StepComplete)
        .phase(phase)
        .step(step_id, status)
        .meta("attempt", attempt)
        .meta("evidence_type", step.evidence.type_label());
    if let Some(reason) = &reason {
        event = event.meta("reason", reason.as_str());
    }
    if let Some(summary) = &result.summary {
        event = event.meta("summary", summary.as_str());
    }
    if !result.evidence.is_empty() {
        event = event.meta(
            "evidence",
            serde_json::to_value(&result.evidence).unwrap_or(Value::Null),
        );
    }
    ctx.record(state, event, |next, event| {
        if let Some(recorded) = next.step_mut(step_id) {
            recorded.status = status;
            recorded.event_id = Some(event.event_id.clone());
            recorded.reason = reason.clone();
        }
    })?;
    info!(status = status.as_str(), "step finished");

    let events = ctx.events()?;
    let check = validate_state_integrity(&ctx.plan, state, &events, ValidationMode::PostStep);
    if !check.passed() {
        warn!(discrepancies = %check.summary(), "integrity post-check failed");
        let reason = format!("integrity post-check failed: {}", check.summary());
        return ctx.fail(state, &reason).map(StepAdvance::Stopped);
    }

    Ok(match (status, reason) {
        (StepStatus::Success, _) => StepAdvance::Succeeded,
        (_, reason) => StepAdvance::Failed {
            reason: reason.unwrap_or_else(|| "step failed".to_string()),
        },
    })
}
