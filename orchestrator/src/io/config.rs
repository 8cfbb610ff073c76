//! Orchestrator configuration stored under `.orchestrator/config.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Orchestrator configuration (TOML).
///
/// Edited by operators; missing fields fall back to the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Wall-clock budget for one step execution. Exceeding it is a failure.
    pub step_timeout_secs: u64,

    /// Truncate executor stdout/stderr beyond this many bytes.
    pub executor_output_limit_bytes: usize,

    /// Wall-clock budget for `command` evidence checks.
    pub evidence_command_timeout_secs: u64,

    /// How long a gate or destructive step waits for approval before pausing.
    pub approval_wait_secs: u64,

    /// Poll interval while waiting for approval.
    pub approval_poll_millis: u64,

    pub workspace: WorkspaceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Branches a workspace-mutating step may never run on.
    pub protected_branches: Vec<String>,

    /// Workspace-relative prefixes a step may never declare it touches.
    pub protected_paths: Vec<String>,

    /// Check out `orchestrator/<run_id>` on start when the workspace is a git repo.
    pub create_run_branch: bool,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            protected_branches: vec!["main".to_string(), "master".to_string()],
            protected_paths: vec![".git/".to_string(), ".orchestrator/".to_string()],
            create_run_branch: true,
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            step_timeout_secs: 30 * 60,
            executor_output_limit_bytes: 100_000,
            evidence_command_timeout_secs: 5 * 60,
            approval_wait_secs: 0,
            approval_poll_millis: 500,
            workspace: WorkspaceConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.step_timeout_secs == 0 {
            return Err(anyhow!("step_timeout_secs must be > 0"));
        }
        if self.executor_output_limit_bytes == 0 {
            return Err(anyhow!("executor_output_limit_bytes must be > 0"));
        }
        if self.evidence_command_timeout_secs == 0 {
            return Err(anyhow!("evidence_command_timeout_secs must be > 0"));
        }
        if self.approval_poll_millis == 0 {
            return Err(anyhow!("approval_poll_millis must be > 0"));
        }
        if self
            .workspace
            .protected_paths
            .iter()
            .any(|prefix| prefix.trim().is_empty())
        {
            return Err(anyhow!("workspace.protected_paths must not contain empty entries"));
        }
        Ok(())
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }

    pub fn evidence_timeout(&self) -> Duration {
        Duration::from_secs(self.evidence_command_timeout_secs)
    }

    pub fn approval_wait(&self) -> Duration {
        Duration::from_secs(self.approval_wait_secs)
    }

    pub fn approval_poll(&self) -> Duration {
        Duration::from_millis(self.approval_poll_millis)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `OrchestratorConfig::default()`.
pub fn load_config(path: &Path) -> Result<OrchestratorConfig> {
    if !path.exists() {
        return Ok(OrchestratorConfig::default());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: OrchestratorConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &OrchestratorConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    crate::io::fs_util::write_atomic(path, buf.as_bytes())
}
