//! Step executor abstraction.
//!
//! The [`StepExecutor`] trait decouples the orchestration loop from whatever
//! actually performs a step. The engine treats the action as opaque: it only
//! sees the claimed outcome and the evidence artifacts handed back. Tests use
//! scripted executors that return predetermined results without spawning
//! processes.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::io::process::{CommandOutput, SpawnError, command_from_argv, run_command_with_timeout};
use crate::plan::StepPlan;

/// Environment variable naming the file a command may write its report to.
pub const RESULT_PATH_ENV: &str = "ORCHESTRATOR_RESULT_PATH";

/// Parameters for one step attempt.
#[derive(Debug, Clone)]
pub struct StepRequest {
    pub run_id: String,
    pub phase: String,
    pub step: StepPlan,
    /// 1-indexed attempt number.
    pub attempt: u32,
    /// Workspace root the action runs in.
    pub workdir: PathBuf,
    /// Per-attempt directory for logs and reports.
    pub attempt_dir: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

/// What the external action claims happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    /// Claims success; still subject to the evidence guard.
    Succeeded,
    Failed { reason: String },
    /// A dependency needed to run the step is missing; the run pauses.
    Unavailable { reason: String },
}

/// Proof produced by an action, interpreted by the evidence checker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EvidenceArtifact {
    Commit {
        sha: String,
    },
    File {
        path: String,
    },
    ExternalState {
        key: String,
        #[serde(default)]
        value: Value,
    },
    ApiResponse {
        endpoint: String,
        status: u16,
        #[serde(default, skip_serializing_if = "Value::is_null")]
        body: Value,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepResult {
    pub outcome: ActionOutcome,
    pub summary: Option<String>,
    pub evidence: Vec<EvidenceArtifact>,
}

impl StepResult {
    pub fn succeeded(evidence: Vec<EvidenceArtifact>) -> Self {
        Self {
            outcome: ActionOutcome::Succeeded,
            summary: None,
            evidence,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            outcome: ActionOutcome::Failed {
                reason: reason.into(),
            },
            summary: None,
            evidence: Vec::new(),
        }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            outcome: ActionOutcome::Unavailable {
                reason: reason.into(),
            },
            summary: None,
            evidence: Vec::new(),
        }
    }
}

/// Abstraction over step execution backends.
pub trait StepExecutor {
    /// Run one attempt of a step. `Err` is treated as a step failure.
    fn execute(&self, request: &StepRequest) -> Result<StepResult>;
}

/// Report a command may write to `$ORCHESTRATOR_RESULT_PATH`.
#[derive(Debug, Default, Deserialize)]
struct CommandReport {
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    evidence: Vec<EvidenceArtifact>,
}

/// Executor that runs the step's `parameters.command` argv in the workspace.
#[derive(Debug, Default, Clone)]
pub struct CommandStepExecutor;

impl StepExecutor for CommandStepExecutor {
    #[instrument(skip_all, fields(step_id = %request.step.step_id, attempt = request.attempt))]
    fn execute(&self, request: &StepRequest) -> Result<StepResult> {
        let argv = match command_argv(&request.step.parameters) {
            Ok(argv) => argv,
            Err(reason) => return Ok(StepResult::unavailable(reason)),
        };
        fs::create_dir_all(&request.attempt_dir)
            .with_context(|| format!("create attempt dir {}", request.attempt_dir.display()))?;
        let result_path = request.attempt_dir.join("result.json");
        let _ = fs::remove_file(&result_path);

        let mut cmd = command_from_argv(&argv)?;
        cmd.current_dir(&request.workdir)
            .env(RESULT_PATH_ENV, &result_path)
            .env("ORCHESTRATOR_RUN_ID", &request.run_id)
            .env("ORCHESTRATOR_PHASE", &request.phase)
            .env("ORCHESTRATOR_STEP_ID", &request.step.step_id)
            .env("ORCHESTRATOR_ATTEMPT", request.attempt.to_string());

        info!(program = %argv[0], "running step command");
        let stdout_log = request.attempt_dir.join("stdout.log");
        let output = match run_command_with_timeout(
            cmd,
            request.timeout,
            request.output_limit_bytes,
            Some(&stdout_log),
        ) {
            Ok(output) => output,
            Err(err) => {
                let missing = err
                    .downcast_ref::<SpawnError>()
                    .is_some_and(SpawnError::is_not_found);
                if missing {
                    warn!(program = %argv[0], "step command not found");
                    return Ok(StepResult::unavailable(format!(
                        "command '{}' is not available",
                        argv[0]
                    )));
                }
                return Err(err).context("run step command");
            }
        };
        write_executor_log(&request.attempt_dir.join("executor.log"), &output)?;

        if output.timed_out {
            return Ok(StepResult::failed(format!(
                "timed out after {}s",
                request.timeout.as_secs()
            )));
        }
        if !output.status.success() {
            let tail = output.stderr_tail(400);
            let mut reason = format!("command exited with {:?}", output.status.code());
            if !tail.is_empty() {
                reason.push_str(": ");
                reason.push_str(&tail);
            }
            return Ok(StepResult::failed(reason));
        }

        let report = match read_report(&result_path) {
            Ok(report) => report,
            Err(err) => return Ok(StepResult::failed(format!("{err:#}"))),
        };
        debug!(evidence = report.evidence.len(), "step command succeeded");
        Ok(StepResult {
            outcome: ActionOutcome::Succeeded,
            summary: report.summary,
            evidence: report.evidence,
        })
    }
}

fn command_argv(parameters: &Value) -> std::result::Result<Vec<String>, String> {
    let Some(raw) = parameters.get("command") else {
        return Err("step has no parameters.command to execute".to_string());
    };
    let argv: Vec<String> = raw
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    let well_formed = raw.as_array().is_some_and(|items| items.len() == argv.len());
    if argv.is_empty() || !well_formed {
        return Err("parameters.command must be a non-empty array of strings".to_string());
    }
    Ok(argv)
}

fn read_report(path: &Path) -> Result<CommandReport> {
    if !path.exists() {
        return Ok(CommandReport::default());
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read step report {}", path.display()))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("invalid step report {}", path.display()))
}

fn write_executor_log(path: &Path, output: &CommandOutput) -> Result<()> {
    let mut buf = String::new();
    buf.push_str("=== stdout ===\n");
    buf.push_str(&output.stdout_lossy());
    if output.stdout_truncated > 0 {
        buf.push_str(&format!("\n[stdout truncated {} bytes]\n", output.stdout_truncated));
    }
    buf.push_str("\n=== stderr ===\n");
    buf.push_str(&String::from_utf8_lossy(&output.stderr));
    if output.stderr_truncated > 0 {
        buf.push_str(&format!("\n[stderr truncated {} bytes]\n", output.stderr_truncated));
    }
    if output.timed_out {
        buf.push_str("\n[step timed out]\n");
    }
    fs::write(path, buf).with_context(|| format!("write executor log {}", path.display()))
}
