//! Read-only run inspection for `orchestrator status`.

use std::path::Path;

use anyhow::Result;

use crate::core::event::Event;
use crate::core::integrity::integrity_hash_matches;
use crate::core::report::render_report;
use crate::core::state::RunState;
use crate::io::event_log::EventLog;
use crate::io::paths::OrchestratorPaths;
use crate::io::session::resolve_run_id;
use crate::io::state_store::StateStore;

#[derive(Debug, Clone)]
pub struct StatusReport {
    pub state: RunState,
    /// False when `state.json` was edited outside the engine.
    pub integrity_ok: bool,
    pub events: Vec<Event>,
}

impl StatusReport {
    pub fn render(&self, with_events: bool) -> String {
        let mut out = render_report(&self.state);
        if !self.integrity_ok {
            out.push_str("WARNING: integrity hash mismatch; state was modified outside the orchestrator\n");
        }
        out.push_str(&format!("events: {}\n", self.events.len()));
        if with_events {
            for event in &self.events {
                out.push_str(&format!(
                    "  {} {} {}",
                    event.event_id,
                    event.timestamp.to_rfc3339(),
                    event.kind.as_str()
                ));
                if let Some(phase) = event.phase.as_deref() {
                    out.push_str(&format!(" phase={phase}"));
                }
                if let Some(step_id) = event.step_id.as_deref() {
                    out.push_str(&format!(" step={step_id}"));
                }
                if let Some(status) = event.status.as_deref() {
                    out.push_str(&format!(" status={status}"));
                }
                out.push('\n');
            }
        }
        out
    }
}

/// Load a run without modifying anything. Tampered state is reported, not rejected.
pub fn run_status(workspace: &Path, run_id: Option<&str>) -> Result<StatusReport> {
    let paths = OrchestratorPaths::new(workspace);
    let run_id = resolve_run_id(&paths, run_id)?;
    let run_paths = paths.run(&run_id);
    let store = StateStore::new(
        &run_id,
        &run_paths.state,
        EventLog::new(&run_id, &run_paths.events_dir),
    );
    let state = store.load_unverified()?;
    let events = store.events().read_all()?;
    Ok(StatusReport {
        integrity_ok: integrity_hash_matches(&state),
        state,
        events,
    })
}
