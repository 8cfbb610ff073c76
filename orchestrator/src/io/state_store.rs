//! Durable, integrity-checked run state (`runs/<run_id>/state.json`).
//!
//! Every write passes the state-validity rules against the previously
//! persisted state, must reference events that already exist in the log, and
//! recomputes the integrity record before an atomic replace.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use tracing::{debug, instrument, warn};

use crate::core::integrity::compute_state_hash;
use crate::core::state::RunState;
use crate::core::transitions::{detect_fabrication, validate_initial_state, validate_state_write};
use crate::errors::EngineError;
use crate::io::event_log::EventLog;
use crate::io::fs_util::{read_json, write_json_atomic};

#[derive(Debug, Clone)]
pub struct StateStore {
    run_id: String,
    path: PathBuf,
    events: EventLog,
}

impl StateStore {
    pub fn new(run_id: &str, path: &Path, events: EventLog) -> Self {
        Self {
            run_id: run_id.to_string(),
            path: path.to_path_buf(),
            events,
        }
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    /// Load the state and verify its integrity record.
    #[instrument(skip_all, fields(run_id = %self.run_id))]
    pub fn load(&self) -> Result<RunState> {
        let state = self.load_unverified()?;
        let recomputed = compute_state_hash(&state).context("hash state")?;
        if state.integrity.steps_hash != recomputed {
            warn!(stored = %state.integrity.steps_hash, %recomputed, "integrity hash mismatch");
            return Err(EngineError::StateTampered {
                run_id: self.run_id.clone(),
                detail: "integrity hash does not match the state contents".to_string(),
            }
            .into());
        }
        if state.run_id != self.run_id {
            return Err(EngineError::StateTampered {
                run_id: self.run_id.clone(),
                detail: format!("state file names run '{}'", state.run_id),
            }
            .into());
        }
        Ok(state)
    }

    /// Read the state without the integrity check (read-only inspection).
    pub fn load_unverified(&self) -> Result<RunState> {
        read_json(&self.path).with_context(|| format!("load state of run '{}'", self.run_id))
    }

    /// Write the first state of a run.
    #[instrument(skip_all, fields(run_id = %self.run_id))]
    pub fn create(&self, mut initial: RunState) -> Result<RunState> {
        if self.exists() {
            return Err(anyhow!("state for run '{}' already exists", self.run_id));
        }
        let violations = validate_initial_state(&initial);
        if !violations.is_empty() {
            return Err(EngineError::InvalidTransition { violations }.into());
        }
        self.seal(&mut initial)?;
        write_json_atomic(&self.path, &initial)?;
        debug!("initial state written");
        Ok(initial)
    }

    /// Validate and persist `next` against the currently persisted state.
    #[instrument(skip_all, fields(run_id = %self.run_id, status = next.status.as_str()))]
    pub fn save(&self, mut next: RunState) -> Result<RunState> {
        let prev = self.load()?;

        let fabricated = detect_fabrication(&prev, &next);
        if !fabricated.is_empty() {
            warn!(steps = ?fabricated, "rejected fabricated completion batch");
            return Err(EngineError::FabricationAttempt {
                step_ids: fabricated,
            }
            .into());
        }
        let violations = validate_state_write(&prev, &next);
        if !violations.is_empty() {
            warn!(?violations, "rejected state write");
            return Err(EngineError::InvalidTransition { violations }.into());
        }
        self.verify_event_references(&prev, &next)?;

        self.seal(&mut next)?;
        write_json_atomic(&self.path, &next)?;
        debug!(last_event_id = ?next.integrity.last_event_id, "state saved");
        Ok(next)
    }

    /// Every event a write newly references must already be in the log and
    /// prove the claim it backs.
    fn verify_event_references(&self, prev: &RunState, next: &RunState) -> Result<()> {
        for step in &next.steps {
            let Some(event_id) = step.event_id.as_deref() else {
                continue;
            };
            let unchanged = prev
                .step(&step.step_id)
                .is_some_and(|before| before.event_id.as_deref() == Some(event_id));
            if unchanged {
                continue;
            }
            let event = self.events.get(event_id)?;
            let proven = event
                .as_ref()
                .is_some_and(|event| event.proves_step(&step.step_id, step.status, step.attempt()));
            if !proven {
                return Err(EngineError::EventStateMismatch {
                    run_id: self.run_id.clone(),
                    detail: format!(
                        "step '{}' marked {} references {event_id}, which does not record it",
                        step.step_id,
                        step.status.as_str()
                    ),
                }
                .into());
            }
        }
        if let Some(last) = next.integrity.last_event_id.as_deref() {
            if self.events.get(last)?.is_none() {
                return Err(EngineError::EventStateMismatch {
                    run_id: self.run_id.clone(),
                    detail: format!("last_event_id {last} is not in the log"),
                }
                .into());
            }
        }
        Ok(())
    }

    fn seal(&self, state: &mut RunState) -> Result<()> {
        let now = Utc::now();
        state.updated_at = now;
        state.integrity.steps_hash = compute_state_hash(state).context("hash state")?;
        state.integrity.computed_at = now;
        Ok(())
    }
}
