//! Persisted run state (`state.json`) and pure helpers over it.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::types::{PhaseStatus, RunStatus, StepStatus};
use crate::plan::Plan;

/// Mutable snapshot of run progress. Always validated against the event log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunState {
    pub run_id: String,
    pub plan_id: String,
    pub workflow_id: String,
    /// SHA-256 of the plan snapshot the run was started from.
    pub plan_digest: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_item_reference: Option<String>,
    pub status: RunStatus,
    pub current_phase: Option<String>,
    pub current_step: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pause_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub workspace: WorkspaceBinding,
    pub phases: Vec<PhaseState>,
    pub steps: Vec<StepState>,
    pub integrity: IntegrityRecord,
    pub sessions: SessionLedger,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Where the run is allowed to operate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkspaceBinding {
    pub root: PathBuf,
    /// Assigned branch; `None` when the workspace is not a git repository.
    pub branch: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PhaseState {
    pub name: String,
    pub status: PhaseStatus,
    pub enabled: bool,
    pub retry_count: u32,
    pub max_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepState {
    pub step_id: String,
    pub name: String,
    pub phase: String,
    pub status: StepStatus,
    /// Event proving the current terminal status (`None` while not terminal).
    pub event_id: Option<String>,
    pub evidence_type: String,
    pub retries_used: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl StepState {
    /// 1-indexed attempt number of the current (or next) execution.
    pub fn attempt(&self) -> u32 {
        self.retries_used + 1
    }
}

/// Checksum/reference pair used to detect out-of-band edits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityRecord {
    pub last_event_id: Option<String>,
    pub steps_hash: String,
    pub computed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionLedger {
    pub current_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<Session>,
    #[serde(default)]
    pub session_history: Vec<Session>,
}

/// One contiguous process lifetime that worked on the run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub phases_touched: Vec<String>,
    pub environment: Environment,
    /// Closed by a later process rather than by its own shutdown.
    #[serde(default)]
    pub interrupted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Environment {
    pub host: String,
    pub platform: String,
    pub cwd: String,
    pub pid: u32,
}

impl RunState {
    /// Build the initial `pending` state for a plan: every declared step is
    /// recorded up front so dropped steps are detectable later.
    pub fn initial(
        run_id: &str,
        plan: &Plan,
        workspace: WorkspaceBinding,
        now: DateTime<Utc>,
    ) -> Self {
        let phases = plan
            .phases
            .iter()
            .map(|phase| PhaseState {
                name: phase.name.clone(),
                status: PhaseStatus::Pending,
                enabled: phase.enabled,
                retry_count: 0,
                max_retries: phase.max_retries,
            })
            .collect();
        let steps = plan
            .phases
            .iter()
            .flat_map(|phase| {
                phase.steps.iter().map(|step| StepState {
                    step_id: step.step_id.clone(),
                    name: step.name.clone(),
                    phase: phase.name.clone(),
                    status: StepStatus::Pending,
                    event_id: None,
                    evidence_type: step.evidence.type_label().to_string(),
                    retries_used: 0,
                    reason: None,
                })
            })
            .collect();

        Self {
            run_id: run_id.to_string(),
            plan_id: plan.plan_id.clone(),
            workflow_id: plan.workflow_id.clone(),
            plan_digest: plan.digest(),
            work_item_reference: plan.work_item_reference.clone(),
            status: RunStatus::Pending,
            current_phase: None,
            current_step: None,
            pause_reason: None,
            failure_reason: None,
            workspace,
            phases,
            steps,
            integrity: IntegrityRecord {
                last_event_id: None,
                steps_hash: String::new(),
                computed_at: now,
            },
            sessions: SessionLedger::default(),
            started_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn phase(&self, name: &str) -> Option<&PhaseState> {
        self.phases.iter().find(|phase| phase.name == name)
    }

    pub fn phase_mut(&mut self, name: &str) -> Option<&mut PhaseState> {
        self.phases.iter_mut().find(|phase| phase.name == name)
    }

    pub fn step(&self, step_id: &str) -> Option<&StepState> {
        self.steps.iter().find(|step| step.step_id == step_id)
    }

    pub fn step_mut(&mut self, step_id: &str) -> Option<&mut StepState> {
        self.steps.iter_mut().find(|step| step.step_id == step_id)
    }

    /// Advance the integrity cursor to a freshly appended event.
    pub fn note_event(&mut self, event_id: &str) {
        self.integrity.last_event_id = Some(event_id.to_string());
    }

    pub fn steps_in_phase<'a>(&'a self, phase: &'a str) -> impl Iterator<Item = &'a StepState> {
        self.steps.iter().filter(move |step| step.phase == phase)
    }

    /// Record that this session worked on `phase`.
    pub fn touch_phase(&mut self, phase: &str) {
        let Some(session) = self.sessions.current.as_mut() else {
            return;
        };
        if !session.phases_touched.iter().any(|p| p == phase) {
            session.phases_touched.push(phase.to_string());
        }
    }

    /// Close the open session (if any) and move it into the history.
    pub fn close_session(&mut self, ended_at: DateTime<Utc>, interrupted: bool) {
        if let Some(mut session) = self.sessions.current.take() {
            session.ended_at = Some(ended_at);
            session.interrupted = interrupted;
            self.sessions.session_history.push(session);
        }
        self.sessions.current_session_id = None;
    }

    pub fn open_session(&mut self, session: Session) {
        self.sessions.current_session_id = Some(session.session_id.clone());
        self.sessions.current = Some(session);
    }
}
