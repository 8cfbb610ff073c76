//! Resuming an interrupted or paused run.
//!
//! The event log is the source of truth: events appended after the state's
//! `last_event_id` (a crash between append and state write) are replayed one
//! write at a time, abandoned sessions are closed as interrupted, in-flight
//! steps go back to `pending`, and only then does the run loop continue.

use std::path::Path;

use anyhow::{Result, anyhow};
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::core::event::{Event, NewEvent, parse_event_id};
use crate::core::integrity::{ValidationMode, validate_state_integrity};
use crate::core::policy::apply_retry;
use crate::core::state::RunState;
use crate::core::types::{EventKind, PhaseStatus, RunStatus, StepStatus};
use crate::engine::{RunOptions, RunOutcome, RunSetup};
use crate::errors::EngineError;
use crate::io::config::load_config;
use crate::io::executor::StepExecutor;
use crate::io::fs_util::read_json;
use crate::io::paths::OrchestratorPaths;
use crate::io::plan_store::load_plan_snapshot;
use crate::io::session::{ActiveRunMarker, RunLock, WorkspaceLock, new_session, resolve_run_id};
use crate::io::state_store::StateStore;
use crate::looping::drive_run;
use crate::plan::Plan;

/// Resume `run_id` (default: the workspace's active run) and drive it until
/// it stops again.
#[instrument(skip_all, fields(run_id = ?run_id))]
pub fn resume_run(
    workspace: &Path,
    run_id: Option<&str>,
    executor: &dyn StepExecutor,
    options: &RunOptions<'_>,
) -> Result<RunOutcome> {
    let paths = OrchestratorPaths::new(workspace);
    if !paths.root.is_dir() {
        return Err(anyhow!("{} has no orchestrator runs", workspace.display()));
    }
    let marker = ActiveRunMarker::new(&paths.active_run);
    let claim = WorkspaceLock::acquire(&paths.workspace_lock)?;
    let active = marker.read()?;
    let run_id = resolve_run_id(&paths, run_id)?;
    let run_paths = paths.run(&run_id);
    if !run_paths.state.exists() {
        return Err(anyhow!("unknown run '{run_id}'"));
    }
    let _lock = RunLock::acquire(&run_paths.lock, &run_id)?;

    let config = load_config(&paths.config)?;
    let setup = RunSetup {
        run_id: run_id.clone(),
        paths,
        config,
        plan: load_plan_snapshot(&run_paths.plan)?,
    };
    let store = setup.store();
    let mut state = store.load()?;
    if setup.plan.digest() != state.plan_digest {
        return Err(EngineError::StateTampered {
            run_id: run_id.clone(),
            detail: "plan snapshot does not match the digest recorded at start".to_string(),
        }
        .into());
    }
    if state.status.is_terminal() {
        return Err(EngineError::RunTerminal {
            run_id: run_id.clone(),
            status: state.status.as_str().to_string(),
        }
        .into());
    }
    if let Some(other) = active.as_deref() {
        if other != run_id && owns_workspace(&setup, other)? {
            return Err(EngineError::ConcurrentRun {
                active_run_id: other.to_string(),
            }
            .into());
        }
    }

    replay_dangling_events(&store, &mut state)?;
    if state.status.is_terminal() {
        // A dangling terminal event finished the run before the crash.
        return Ok(RunOutcome::from_state(&state));
    }
    recover_interrupted(&store, &mut state)?;
    verify_against_log(&setup.plan, &store, &state)?;
    marker.write(&run_id)?;
    drop(claim);

    let branch = state.workspace.branch.clone();
    setup.with_context(branch, executor, options, |ctx| {
        let mut event = NewEvent::new(EventKind::WorkflowResumed)
            .status(RunStatus::InProgress.as_str())
            .meta("previous_status", state.status.as_str());
        if let Some(reason) = state.pause_reason.as_deref() {
            event = event.meta("pause_reason", reason);
        }
        ctx.record(&mut state, event, |next, event| {
            next.status = RunStatus::InProgress;
            next.pause_reason = None;
            next.open_session(new_session(event.timestamp));
        })?;
        info!(run_id = %ctx.run_id, "run resumed");
        drive_run(ctx, &mut state)
    })
}

fn owns_workspace(setup: &RunSetup, run_id: &str) -> Result<bool> {
    let path = setup.paths.run(run_id).state;
    if !path.exists() {
        return Ok(false);
    }
    let state: RunState = read_json(&path)?;
    Ok(!state.status.is_terminal())
}

/// Apply every event newer than the state's cursor, one write per event.
fn replay_dangling_events(store: &StateStore, state: &mut RunState) -> Result<()> {
    let after = match state.integrity.last_event_id.as_deref() {
        Some(event_id) => parse_event_id(event_id).ok_or_else(|| EngineError::StateTampered {
            run_id: state.run_id.clone(),
            detail: format!("malformed last_event_id '{event_id}'"),
        })?,
        None => 0,
    };
    let dangling = store.events().read_since(after)?;
    if dangling.is_empty() {
        return Ok(());
    }
    warn!(count = dangling.len(), "replaying events missing from state");
    for event in &dangling {
        replay_event(store, state, event)?;
    }
    Ok(())
}

fn replay_event(store: &StateStore, state: &mut RunState, event: &Event) -> Result<()> {
    debug!(event_id = %event.event_id, kind = event.kind.as_str(), "replaying event");
    let phase = event.phase.as_deref();
    match event.kind {
        EventKind::StepComplete => {
            let (Some(step_id), Some(status)) = (event.step_id.as_deref(), step_status(event))
            else {
                return Err(mismatch(state, event, "step event without step or status"));
            };
            let Some(recorded) = state.step(step_id) else {
                return Err(mismatch(state, event, "event names an unknown step"));
            };
            if recorded.status == StepStatus::Pending && status != StepStatus::Skipped {
                let mut next = state.clone();
                if let Some(step) = next.step_mut(step_id) {
                    step.status = StepStatus::InProgress;
                }
                *state = store.save(next)?;
            }
            let reason = event
                .metadata
                .get("reason")
                .and_then(|value| value.as_str())
                .map(str::to_string);
            apply(store, state, event, |next| {
                if let Some(step) = next.step_mut(step_id) {
                    step.status = status;
                    step.event_id = Some(event.event_id.clone());
                    step.reason = reason;
                }
            })
        }
        EventKind::PhaseStart => apply(store, state, event, |next| {
            set_phase(next, phase, PhaseStatus::InProgress);
            next.current_phase = phase.map(str::to_string);
        }),
        EventKind::PhaseSkipped => apply(store, state, event, |next| {
            set_phase(next, phase, PhaseStatus::Skipped);
        }),
        EventKind::PhaseComplete => apply(store, state, event, |next| {
            set_phase(next, phase, PhaseStatus::Completed);
        }),
        EventKind::PhaseFailed => apply(store, state, event, |next| {
            set_phase(next, phase, PhaseStatus::Failed);
        }),
        EventKind::PhaseRetry => apply(store, state, event, |next| {
            if let Some(phase) = phase {
                apply_retry(next, phase);
            }
        }),
        EventKind::WorkflowStart => apply(store, state, event, |next| {
            next.status = RunStatus::InProgress;
        }),
        EventKind::WorkflowFailed => {
            let reason = event
                .metadata
                .get("reason")
                .and_then(|value| value.as_str())
                .unwrap_or("run failed")
                .to_string();
            apply(store, state, event, |next| {
                next.status = RunStatus::Failed;
                next.failure_reason = Some(reason);
                next.close_session(event.timestamp, false);
            })
        }
        EventKind::WorkflowComplete => apply(store, state, event, |next| {
            next.status = RunStatus::Completed;
            next.completed_at = Some(event.timestamp);
            next.close_session(event.timestamp, false);
        }),
        EventKind::WorkflowPaused
        | EventKind::WorkflowResumed
        | EventKind::ApprovalGranted => apply(store, state, event, |_| {}),
    }
}

fn apply(
    store: &StateStore,
    state: &mut RunState,
    event: &Event,
    change: impl FnOnce(&mut RunState),
) -> Result<()> {
    let mut next = state.clone();
    change(&mut next);
    next.note_event(&event.event_id);
    *state = store.save(next)?;
    Ok(())
}

fn set_phase(state: &mut RunState, phase: Option<&str>, status: PhaseStatus) {
    if let Some(recorded) = phase.and_then(|name| state.phase_mut(name)) {
        recorded.status = status;
    }
}

fn step_status(event: &Event) -> Option<StepStatus> {
    serde_json::from_value(serde_json::Value::String(event.status.clone()?)).ok()
}

fn mismatch(state: &RunState, event: &Event, detail: &str) -> anyhow::Error {
    EngineError::EventStateMismatch {
        run_id: state.run_id.clone(),
        detail: format!("{}: {detail}", event.event_id),
    }
    .into()
}

/// Close a session that ended without shutting down and return in-flight
/// steps to `pending`.
fn recover_interrupted(store: &StateStore, state: &mut RunState) -> Result<()> {
    let open_session = state.sessions.current.is_some();
    let in_flight = state
        .steps
        .iter()
        .any(|step| step.status == StepStatus::InProgress);
    if !open_session && !in_flight {
        return Ok(());
    }
    warn!(open_session, in_flight, "recovering interrupted session");
    let mut next = state.clone();
    next.close_session(Utc::now(), true);
    for step in &mut next.steps {
        if step.status == StepStatus::InProgress {
            step.status = StepStatus::Pending;
        }
    }
    *state = store.save(next)?;
    Ok(())
}

fn verify_against_log(plan: &Plan, store: &StateStore, state: &RunState) -> Result<()> {
    let events = store.events().read_all()?;
    let check = validate_state_integrity(plan, state, &events, ValidationMode::PostStep);
    if check.passed() {
        return Ok(());
    }
    Err(EngineError::EventStateMismatch {
        run_id: state.run_id.clone(),
        detail: check.summary(),
    }
    .into())
}
