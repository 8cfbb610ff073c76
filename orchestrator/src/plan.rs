//! Declarative plan model: ordered phases of steps, evidence declarations and
//! the autonomy policy. Plans are produced by an external planner and never
//! mutated by the engine.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::core::types::{AutonomyLevel, GatePoint};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Plan {
    pub plan_id: String,
    pub workflow_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_item_reference: Option<String>,
    #[serde(default)]
    pub autonomy: AutonomyPolicy,
    pub phases: Vec<PhasePlan>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AutonomyPolicy {
    #[serde(default)]
    pub level: AutonomyLevel,
    /// Explicit phase-boundary checkpoints (honored at `guarded` and stricter).
    #[serde(default)]
    pub gates: Vec<GateSpec>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct GateSpec {
    pub phase: String,
    pub when: GatePoint,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PhasePlan {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub max_retries: u32,
    pub steps: Vec<StepPlan>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StepPlan {
    pub step_id: String,
    pub name: String,
    pub evidence: EvidenceSpec,
    /// Requires an explicit approval signal before the step first runs. The
    /// approval is consumed once per run, so phase retries reuse it.
    #[serde(default)]
    pub destructive: bool,
    /// The step mutates the working branch or filesystem.
    #[serde(default)]
    pub mutates_workspace: bool,
    /// Workspace-relative paths the step declares it will touch.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub touches: Vec<String>,
    /// Opaque parameters handed to the step executor.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub parameters: Value,
}

/// Declared proof a step must leave behind before it may succeed.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EvidenceSpec {
    /// A new commit on the expected branch (defaults to the run branch).
    Commit {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        branch: Option<String>,
    },
    /// A workspace file that was created or modified by the step.
    Artifact { path: String },
    /// An external system reported a state change under `key`.
    ExternalState {
        key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expected: Option<Value>,
    },
    /// A verifiable API response for `endpoint`.
    ApiResponse {
        endpoint: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expected_status: Option<u16>,
    },
    /// A command whose output proves the outcome.
    Command {
        argv: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expect_stdout: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expect_exit: Option<i32>,
    },
}

impl EvidenceSpec {
    pub fn type_label(&self) -> &'static str {
        match self {
            EvidenceSpec::Commit { .. } => "commit",
            EvidenceSpec::Artifact { .. } => "artifact",
            EvidenceSpec::ExternalState { .. } => "external_state",
            EvidenceSpec::ApiResponse { .. } => "api_response",
            EvidenceSpec::Command { .. } => "command",
        }
    }
}

fn default_enabled() -> bool {
    true
}

impl Plan {
    pub fn step_count(&self) -> usize {
        self.phases.iter().map(|phase| phase.steps.len()).sum()
    }

    pub fn has_gate(&self, phase: &str, when: GatePoint) -> bool {
        self.autonomy
            .gates
            .iter()
            .any(|gate| gate.phase == phase && gate.when == when)
    }

    /// SHA-256 over the canonical JSON encoding of the plan.
    pub fn digest(&self) -> String {
        let encoded = serde_json::to_vec(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&encoded);
        hex::encode(hasher.finalize())
    }
}

/// Check semantic plan invariants not expressible in JSON Schema:
/// - At least one phase, and every phase has at least one step
/// - Unique phase names and unique step ids across the workflow
/// - Ids restricted to `[A-Za-z0-9._-]` (they name files on disk)
/// - Gates reference existing phases
pub fn validate_plan(plan: &Plan) -> Vec<String> {
    let mut errors = Vec::new();
    if plan.phases.is_empty() {
        errors.push("plan must declare at least one phase".to_string());
    }
    if let Err(err) = validate_id(&plan.plan_id) {
        errors.push(format!("plan_id: {err}"));
    }

    let mut phase_names = HashSet::new();
    let mut step_ids = HashSet::new();
    for phase in &plan.phases {
        if !phase_names.insert(phase.name.as_str()) {
            errors.push(format!("duplicate phase name '{}'", phase.name));
        }
        if let Err(err) = validate_id(&phase.name) {
            errors.push(format!("phase '{}': {err}", phase.name));
        }
        if phase.steps.is_empty() {
            errors.push(format!("phase '{}' has no steps", phase.name));
        }
        for step in &phase.steps {
            if !step_ids.insert(step.step_id.as_str()) {
                errors.push(format!("duplicate step id '{}'", step.step_id));
            }
            if let Err(err) = validate_id(&step.step_id) {
                errors.push(format!("{}/{}: {err}", phase.name, step.step_id));
            }
            if matches!(&step.evidence, EvidenceSpec::Command { argv, .. } if argv.is_empty()) {
                errors.push(format!(
                    "{}/{}: command evidence needs a non-empty argv",
                    phase.name, step.step_id
                ));
            }
        }
    }

    for gate in &plan.autonomy.gates {
        if !phase_names.contains(gate.phase.as_str()) {
            errors.push(format!(
                "gate {} '{}' references unknown phase",
                gate.when.as_str(),
                gate.phase
            ));
        }
    }

    errors
}

/// Validate that an id is safe for use in file names and branch names.
pub fn validate_id(id: &str) -> Result<(), String> {
    if id.is_empty() {
        return Err("id must not be empty".to_string());
    }
    if id == "." || id == ".." {
        return Err(format!("id must not be '{id}'"));
    }
    if id
        .chars()
        .any(|c| !(c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-'))
    {
        return Err(format!("id must be [A-Za-z0-9._-] only (got '{id}')"));
    }
    Ok(())
}
