//! Engine error taxonomy.
//!
//! Errors travel inside `anyhow::Error`; callers that need to branch on the
//! class recover it with [`engine_error`].

use thiserror::Error;

use crate::exit_codes;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// The external action reported failure or timed out.
    #[error("step '{step_id}' failed: {reason}")]
    StepFailure { step_id: String, reason: String },

    /// A success claim with no satisfied evidence.
    #[error("no evidence: {reason}")]
    EvidenceMissing { step_id: String, reason: String },

    /// Workspace-safety or approval guard refused to let the step run.
    #[error("{guard} guard: {reason}")]
    GuardViolation { guard: &'static str, reason: String },

    /// Integrity record mismatch on load; the run cannot continue automatically.
    #[error("state of run '{run_id}' was tampered with: {detail}")]
    StateTampered { run_id: String, detail: String },

    /// A state claim without a corresponding event.
    #[error("state of run '{run_id}' disagrees with its event log: {detail}")]
    EventStateMismatch { run_id: String, detail: String },

    /// Several steps marked terminal in one write with no events at all.
    #[error("fabrication attempt: steps {} marked terminal without events", .step_ids.join(", "))]
    FabricationAttempt { step_ids: Vec<String> },

    #[error("invalid state transition: {}", .violations.join("; "))]
    InvalidTransition { violations: Vec<String> },

    #[error("run '{active_run_id}' is already active in this workspace")]
    ConcurrentRun { active_run_id: String },

    #[error("run '{run_id}' is locked by another orchestrator process")]
    RunLocked { run_id: String },

    #[error("run '{run_id}' is {status} and cannot be resumed")]
    RunTerminal { run_id: String, status: String },
}

impl EngineError {
    /// Errors that must never be converted into an honest pause.
    pub fn is_integrity_error(&self) -> bool {
        matches!(
            self,
            EngineError::StateTampered { .. }
                | EngineError::EventStateMismatch { .. }
                | EngineError::FabricationAttempt { .. }
        )
    }
}

/// Find an [`EngineError`] anywhere in the error chain.
pub fn engine_error(err: &anyhow::Error) -> Option<&EngineError> {
    err.chain().find_map(|cause| cause.downcast_ref::<EngineError>())
}

/// Exit code for a command that failed with `err`.
pub fn exit_code_for_error(err: &anyhow::Error) -> i32 {
    match engine_error(err) {
        Some(engine) if engine.is_integrity_error() => exit_codes::TAMPERED,
        _ => exit_codes::INVALID,
    }
}
