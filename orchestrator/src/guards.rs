//! The guard executor: mandatory checks the orchestration loop calls at fixed
//! points.
//!
//! - Execution-evidence guard: after a step claims success.
//! - State-validity guard: inside [`StateStore::save`](crate::io::state_store::StateStore::save),
//!   so no write can skip it.
//! - Workspace-safety guard: before steps that mutate the workspace.
//! - Approval guard: before destructive steps and at blocking phase gates.

use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, warn};

use crate::core::event::Event;
use crate::core::state::WorkspaceBinding;
use crate::core::types::{EventKind, GuardVerdict};
use crate::io::approvals::{Approval, ApprovalSource, ApprovalWait, wait_for_approval};
use crate::io::config::WorkspaceConfig;
use crate::io::evidence::{EvidenceBaseline, EvidenceChecker, resolve_inside};
use crate::io::executor::EvidenceArtifact;
use crate::io::git::Git;
use crate::plan::StepPlan;

pub const EVIDENCE_GUARD: &str = "execution-evidence";
pub const WORKSPACE_GUARD: &str = "workspace-safety";
pub const APPROVAL_GUARD: &str = "destructive-operation-approval";

/// Verify the declared evidence of `step` after it claimed success.
///
/// Checker errors count as missing evidence; a success claim is never
/// accepted on faith.
pub fn evidence_guard(
    checker: &dyn EvidenceChecker,
    step: &StepPlan,
    baseline: &EvidenceBaseline,
    artifacts: &[EvidenceArtifact],
) -> GuardVerdict {
    let verdict = match checker.check(&step.evidence, baseline, artifacts) {
        Ok(verdict) => verdict,
        Err(err) => GuardVerdict::fail(format!("evidence check errored: {err:#}")),
    };
    if let GuardVerdict::Fail { reason } = &verdict {
        warn!(guard = EVIDENCE_GUARD, step_id = %step.step_id, %reason, "guard rejected");
    }
    verdict
}

/// True if the step must pass the workspace-safety guard.
pub fn needs_workspace_guard(step: &StepPlan) -> bool {
    step.mutates_workspace || step.destructive
}

/// Verify the run still operates in its bound workspace and branch, and the
/// step does not declare protected or escaping paths.
pub fn workspace_safety_guard(
    binding: &WorkspaceBinding,
    config: &WorkspaceConfig,
    workspace: &Path,
    step: &StepPlan,
) -> Result<GuardVerdict> {
    let verdict = check_workspace(binding, config, workspace, step)?;
    if let GuardVerdict::Fail { reason } = &verdict {
        warn!(guard = WORKSPACE_GUARD, step_id = %step.step_id, %reason, "guard rejected");
    }
    Ok(verdict)
}

fn check_workspace(
    binding: &WorkspaceBinding,
    config: &WorkspaceConfig,
    workspace: &Path,
    step: &StepPlan,
) -> Result<GuardVerdict> {
    let bound = binding
        .root
        .canonicalize()
        .unwrap_or_else(|_| binding.root.clone());
    let actual = workspace
        .canonicalize()
        .unwrap_or_else(|_| workspace.to_path_buf());
    if bound != actual {
        return Ok(GuardVerdict::fail(format!(
            "run is bound to workspace {} but is operating in {}",
            bound.display(),
            actual.display()
        )));
    }

    let git = Git::new(workspace);
    if git.is_repo() {
        let current = git.current_branch()?;
        match (&binding.branch, &current) {
            (Some(expected), Some(actual)) if expected != actual => {
                return Ok(GuardVerdict::fail(format!(
                    "run is bound to branch '{expected}' but workspace is on '{actual}'"
                )));
            }
            (Some(expected), None) => {
                return Ok(GuardVerdict::fail(format!(
                    "run is bound to branch '{expected}' but HEAD is detached"
                )));
            }
            _ => {}
        }
        if let Some(actual) = current.as_deref() {
            if config.protected_branches.iter().any(|b| b == actual) {
                return Ok(GuardVerdict::fail(format!(
                    "workspace is on protected branch '{actual}'"
                )));
            }
        }
    } else if let Some(expected) = binding.branch.as_deref() {
        return Ok(GuardVerdict::fail(format!(
            "run is bound to branch '{expected}' but the workspace is no longer a git repository"
        )));
    }

    for touched in &step.touches {
        if resolve_inside(workspace, touched).is_none() {
            return Ok(GuardVerdict::fail(format!(
                "declared path '{touched}' escapes the workspace"
            )));
        }
        let normalized = touched.trim_start_matches("./");
        let protected = config.protected_paths.iter().find(|prefix| {
            let bare = prefix.trim_end_matches('/');
            normalized == bare || normalized.starts_with(prefix.as_str())
        });
        if let Some(prefix) = protected {
            return Ok(GuardVerdict::fail(format!(
                "declared path '{touched}' is under protected path '{prefix}'"
            )));
        }
    }

    Ok(GuardVerdict::Pass)
}

/// Outcome of an approval check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalDecision {
    /// A fresh approval was found; the caller records its consumption.
    Granted(Approval),
    /// The approval was already consumed earlier in this run.
    AlreadyConsumed,
    Blocked { reason: String },
}

/// Parameters for waiting on an approval signal.
#[derive(Debug, Clone, Copy)]
pub struct ApprovalWaitPolicy {
    pub wait: Duration,
    pub poll: Duration,
}

/// Require an approval signal for `key`, waiting up to the policy budget.
pub fn approval_guard(
    source: &dyn ApprovalSource,
    events: &[Event],
    key: &str,
    purpose: &str,
    policy: ApprovalWaitPolicy,
    cancel: &AtomicBool,
) -> Result<ApprovalDecision> {
    if approval_consumed(events, key) {
        debug!(key, "approval already consumed");
        return Ok(ApprovalDecision::AlreadyConsumed);
    }
    let decision = match wait_for_approval(source, key, policy.wait, policy.poll, cancel)? {
        ApprovalWait::Granted(approval) => ApprovalDecision::Granted(approval),
        ApprovalWait::Pending => ApprovalDecision::Blocked {
            reason: format!("awaiting approval '{key}' ({purpose})"),
        },
        ApprovalWait::Cancelled => ApprovalDecision::Blocked {
            reason: format!("cancelled while awaiting approval '{key}' ({purpose})"),
        },
    };
    if let ApprovalDecision::Blocked { reason } = &decision {
        warn!(guard = APPROVAL_GUARD, key, %reason, "guard blocked");
    }
    Ok(decision)
}

/// True if an `approval_granted` event for `key` is already in the log.
pub fn approval_consumed(events: &[Event], key: &str) -> bool {
    events.iter().any(|event| {
        event.kind == EventKind::ApprovalGranted
            && event.metadata.get("key").and_then(|v| v.as_str()) == Some(key)
    })
}
