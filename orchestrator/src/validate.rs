//! Read-only integrity validation of a run against its event log.

use std::path::Path;

use anyhow::Result;

use crate::core::integrity::{ValidationMode, ValidationResult, validate_state_integrity};
use crate::core::types::RunStatus;
use crate::io::event_log::EventLog;
use crate::io::paths::OrchestratorPaths;
use crate::io::plan_store::load_plan_snapshot;
use crate::io::session::resolve_run_id;
use crate::io::state_store::StateStore;

/// Outcome of `orchestrator validate`.
#[derive(Debug, Clone)]
pub struct ValidateOutcome {
    pub run_id: String,
    pub status: RunStatus,
    pub mode: ValidationMode,
    pub result: ValidationResult,
    /// False when the plan snapshot no longer matches the digest in the state.
    pub plan_matches: bool,
}

impl ValidateOutcome {
    pub fn passed(&self) -> bool {
        self.plan_matches && self.result.passed()
    }
}

/// Validate a run. Completed runs get the full completion check, everything
/// else the post-step check.
pub fn validate_run(workspace: &Path, run_id: Option<&str>) -> Result<ValidateOutcome> {
    let paths = OrchestratorPaths::new(workspace);
    let run_id = resolve_run_id(&paths, run_id)?;
    let run_paths = paths.run(&run_id);
    let store = StateStore::new(
        &run_id,
        &run_paths.state,
        EventLog::new(&run_id, &run_paths.events_dir),
    );
    let plan = load_plan_snapshot(&run_paths.plan)?;
    let state = store.load_unverified()?;
    let events = store.events().read_all()?;

    let mode = if state.status == RunStatus::Completed {
        ValidationMode::Completion
    } else {
        ValidationMode::PostStep
    };
    let result = validate_state_integrity(&plan, &state, &events, mode);
    Ok(ValidateOutcome {
        plan_matches: plan.digest() == state.plan_digest,
        run_id,
        status: state.status,
        mode,
        result,
    })
}
