//! Shared run context for the orchestration modules.
//!
//! Every state change goes through [`RunContext::record`] (event first, then
//! an incremental state write) or [`RunContext::write`] (state only, for
//! non-terminal bookkeeping). Both end in `StateStore::save`, which runs the
//! state-validity guard.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use tracing::{info, warn};

use crate::core::event::{Event, NewEvent};
use crate::core::report::{render_report, stop_point};
use crate::core::state::RunState;
use crate::core::types::{EventKind, RunStatus, StepStatus};
use crate::guards::ApprovalWaitPolicy;
use crate::io::approvals::{ApprovalSource, FileApprovalStore};
use crate::io::config::OrchestratorConfig;
use crate::io::event_log::EventLog;
use crate::io::evidence::{EvidenceChecker, WorkspaceEvidenceChecker};
use crate::io::executor::StepExecutor;
use crate::io::paths::{OrchestratorPaths, RunPaths};
use crate::io::session::{ActiveRunMarker, WorkspaceLock};
use crate::io::state_store::StateStore;
use crate::plan::Plan;

/// Optional overrides for the default collaborators.
#[derive(Default, Clone)]
pub struct RunOptions<'a> {
    /// Defaults to the workspace checker bound to the run's branch.
    pub evidence: Option<&'a dyn EvidenceChecker>,
    /// Defaults to the file-backed approvals of the run.
    pub approvals: Option<&'a dyn ApprovalSource>,
    /// Set to stop the run at the next step boundary or approval wait; the
    /// run then pauses.
    pub cancel: Arc<AtomicBool>,
}

/// Result of driving a run until it stops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub run_id: String,
    pub status: RunStatus,
    pub stopped_phase: Option<String>,
    pub stopped_step: Option<String>,
    /// Pause or failure reason.
    pub reason: Option<String>,
    /// Operator-facing report.
    pub report: String,
}

impl RunOutcome {
    pub fn from_state(state: &RunState) -> Self {
        let (stopped_phase, stopped_step) = stop_point(state);
        let reason = match state.status {
            RunStatus::Paused => state.pause_reason.clone(),
            RunStatus::Failed => state.failure_reason.clone(),
            _ => None,
        };
        Self {
            run_id: state.run_id.clone(),
            status: state.status,
            stopped_phase,
            stopped_step,
            reason,
            report: render_report(state),
        }
    }
}

/// Inputs shared by `start` and `resume` before a [`RunContext`] exists.
#[derive(Debug, Clone)]
pub struct RunSetup {
    pub run_id: String,
    pub paths: OrchestratorPaths,
    pub config: OrchestratorConfig,
    pub plan: Plan,
}

impl RunSetup {
    pub fn run_paths(&self) -> RunPaths {
        self.paths.run(&self.run_id)
    }

    pub fn store(&self) -> StateStore {
        let run_paths = self.run_paths();
        StateStore::new(
            &self.run_id,
            &run_paths.state,
            EventLog::new(&self.run_id, &run_paths.events_dir),
        )
    }

    /// Build the context, filling collaborators `options` leaves unset with
    /// the workspace defaults, and hand it to `body`.
    pub fn with_context<R>(
        self,
        branch: Option<String>,
        executor: &dyn StepExecutor,
        options: &RunOptions<'_>,
        body: impl FnOnce(&RunContext<'_>) -> Result<R>,
    ) -> Result<R> {
        let run_paths = self.run_paths();
        let store = self.store();
        let default_evidence = WorkspaceEvidenceChecker::new(
            &self.paths.workspace,
            branch,
            self.config.evidence_timeout(),
            self.config.executor_output_limit_bytes,
        );
        let default_approvals = FileApprovalStore::new(&run_paths.approvals_dir);
        let evidence: &dyn EvidenceChecker = match options.evidence {
            Some(checker) => checker,
            None => &default_evidence,
        };
        let approvals: &dyn ApprovalSource = match options.approvals {
            Some(source) => source,
            None => &default_approvals,
        };
        let ctx = RunContext {
            run_id: self.run_id,
            paths: self.paths,
            run_paths,
            config: self.config,
            plan: self.plan,
            store,
            executor,
            evidence,
            approvals,
            cancel: options.cancel.clone(),
        };
        body(&ctx)
    }
}

pub struct RunContext<'a> {
    pub run_id: String,
    pub paths: OrchestratorPaths,
    pub run_paths: RunPaths,
    pub config: OrchestratorConfig,
    pub plan: Plan,
    pub store: StateStore,
    pub executor: &'a dyn StepExecutor,
    pub evidence: &'a dyn EvidenceChecker,
    pub approvals: &'a dyn ApprovalSource,
    pub cancel: Arc<AtomicBool>,
}

impl RunContext<'_> {
    /// Append `event`, apply `change` to a copy of `state` and persist it.
    /// `state` is only replaced once the write succeeded.
    pub fn record(
        &self,
        state: &mut RunState,
        event: NewEvent,
        change: impl FnOnce(&mut RunState, &Event),
    ) -> Result<Event> {
        let event = self.store.events().append(event)?;
        let mut next = state.clone();
        change(&mut next, &event);
        next.note_event(&event.event_id);
        *state = self.store.save(next)?;
        Ok(event)
    }

    /// Persist a change that has no event of its own.
    pub fn write(&self, state: &mut RunState, change: impl FnOnce(&mut RunState)) -> Result<()> {
        let mut next = state.clone();
        change(&mut next);
        *state = self.store.save(next)?;
        Ok(())
    }

    pub fn events(&self) -> Result<Vec<Event>> {
        self.store.events().read_all()
    }

    /// True once the operator asked the run to stop.
    pub fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub fn approval_policy(&self) -> ApprovalWaitPolicy {
        ApprovalWaitPolicy {
            wait: self.config.approval_wait(),
            poll: self.config.approval_poll(),
        }
    }

    /// Pause honestly: log the reason, return in-flight steps to `pending`
    /// and close the session.
    pub fn pause(
        &self,
        state: &mut RunState,
        reason: &str,
        phase: Option<&str>,
        step: Option<&str>,
    ) -> Result<RunOutcome> {
        warn!(run_id = %self.run_id, reason, "pausing run");
        let mut event = NewEvent::new(EventKind::WorkflowPaused).meta("reason", reason);
        if let Some(phase) = phase {
            event = event.phase(phase);
        }
        if let Some(step) = step {
            event = event.meta("step_id", step);
        }
        self.record(state, event, |next, event| {
            for step in &mut next.steps {
                if step.status == StepStatus::InProgress {
                    step.status = StepStatus::Pending;
                }
            }
            next.status = RunStatus::Paused;
            next.pause_reason = Some(reason.to_string());
            if phase.is_some() {
                next.current_phase = phase.map(str::to_string);
            }
            next.current_step = step.map(str::to_string);
            next.close_session(event.timestamp, false);
        })?;
        Ok(RunOutcome::from_state(state))
    }

    /// Fail the run with `reason` and release the workspace.
    pub fn fail(&self, state: &mut RunState, reason: &str) -> Result<RunOutcome> {
        warn!(run_id = %self.run_id, reason, "run failed");
        let event = NewEvent::new(EventKind::WorkflowFailed).meta("reason", reason);
        self.record(state, event, |next, event| {
            for step in &mut next.steps {
                if step.status == StepStatus::InProgress {
                    step.status = StepStatus::Pending;
                }
            }
            next.status = RunStatus::Failed;
            next.failure_reason = Some(reason.to_string());
            next.close_session(event.timestamp, false);
        })?;
        self.release_workspace();
        Ok(RunOutcome::from_state(state))
    }

    /// Mark the run completed. Callers must have passed the completion check.
    pub fn complete(&self, state: &mut RunState) -> Result<RunOutcome> {
        let event = NewEvent::new(EventKind::WorkflowComplete);
        self.record(state, event, |next, event| {
            next.status = RunStatus::Completed;
            next.completed_at = Some(event.timestamp);
            next.current_phase = None;
            next.current_step = None;
            next.close_session(event.timestamp, false);
        })?;
        info!(run_id = %self.run_id, "run completed");
        self.release_workspace();
        Ok(RunOutcome::from_state(state))
    }

    fn release_workspace(&self) {
        let marker = ActiveRunMarker::new(&self.paths.active_run);
        let cleared = WorkspaceLock::acquire(&self.paths.workspace_lock)
            .and_then(|_claim| marker.clear(&self.run_id));
        if let Err(err) = cleared {
            warn!(err = %format!("{err:#}"), "failed to clear active run marker");
        }
    }
}
