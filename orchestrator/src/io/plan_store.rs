//! Plan loading with schema + invariant validation, and the per-run plan
//! snapshot.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use jsonschema::validator_for;
use serde_json::Value;
use tracing::debug;

use crate::io::fs_util::{read_json, write_json_atomic};
use crate::plan::{Plan, validate_plan};

/// Embedded plan schema (Draft 2020-12).
pub const PLAN_SCHEMA: &str = include_str!("../../schemas/plan.v1.schema.json");

/// Load and validate a plan file (schema + invariants).
pub fn load_plan(path: &Path) -> Result<Plan> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read plan {}", path.display()))?;
    let value: Value = serde_json::from_str(&contents)
        .with_context(|| format!("parse plan {}", path.display()))?;
    parse_plan_value(value).with_context(|| format!("invalid plan {}", path.display()))
}

/// Validate an already-parsed plan document.
pub fn parse_plan_value(value: Value) -> Result<Plan> {
    validate_schema(&value)?;
    let plan: Plan = serde_json::from_value(value).context("deserialize plan")?;
    let errors = validate_plan(&plan);
    if !errors.is_empty() {
        return Err(anyhow!("plan invariants failed: {}", errors.join("; ")));
    }
    debug!(plan_id = %plan.plan_id, phases = plan.phases.len(), "plan validated");
    Ok(plan)
}

/// Persist the immutable plan snapshot of a run.
pub fn write_plan_snapshot(path: &Path, plan: &Plan) -> Result<()> {
    write_json_atomic(path, plan)
}

/// Load the plan snapshot a run was started from.
pub fn load_plan_snapshot(path: &Path) -> Result<Plan> {
    read_json(path)
}

fn validate_schema(plan: &Value) -> Result<()> {
    let schema: Value = serde_json::from_str(PLAN_SCHEMA).context("parse embedded plan schema")?;
    let compiled = validator_for(&schema).map_err(|err| anyhow!("invalid schema: {}", err))?;
    if !compiled.is_valid(plan) {
        let messages = compiled
            .iter_errors(plan)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        return Err(anyhow!(
            "plan schema validation failed: {}",
            messages.join("; ")
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{plan_with_phases, step};
    use serde_json::json;

    /// Verifies plans serialized by the engine satisfy the embedded schema.
    #[test]
    fn serialized_plan_passes_schema() {
        let mut plan = plan_with_phases(vec![("frame", vec![step("a")]), ("build", vec![step("b")])]);
        plan.phases[1].steps[0].parameters = json!({"command": ["true"]});
        let value = serde_json::to_value(&plan).expect("to value");
        assert_eq!(parse_plan_value(value).expect("valid"), plan);
    }

    #[test]
    fn schema_rejects_unknown_evidence_type() {
        let value = json!({
            "plan_id": "p1",
            "workflow_id": "wf",
            "phases": [{
                "name": "build",
                "steps": [{"step_id": "a", "name": "A", "evidence": {"type": "vibes"}}]
            }]
        });
        let err = parse_plan_value(value).expect_err("invalid");
        assert!(err.to_string().contains("plan schema validation failed"));
    }

    #[test]
    fn invariants_run_after_schema() {
        let value = json!({
            "plan_id": "p1",
            "workflow_id": "wf",
            "phases": [{
                "name": "build",
                "steps": [
                    {"step_id": "a", "name": "A", "evidence": {"type": "commit"}},
                    {"step_id": "a", "name": "A again", "evidence": {"type": "commit"}}
                ]
            }]
        });
        let err = parse_plan_value(value).expect_err("invalid");
        assert!(err.to_string().contains("duplicate step id 'a'"));
    }

    #[test]
    fn load_plan_names_the_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("plan.json");
        fs::write(&path, "{not json").expect("write");
        let err = load_plan(&path).expect_err("invalid");
        assert!(format!("{err:#}").contains("plan.json"));
    }
}
