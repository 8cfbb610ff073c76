//! Evidence predicates behind the execution-evidence guard.
//!
//! The engine never trusts an action's success claim on its own. Before a
//! step runs, the checker records a baseline; after the action claims success
//! it verifies the declared evidence actually appeared.

use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};

use crate::core::types::GuardVerdict;
use crate::io::executor::EvidenceArtifact;
use crate::io::git::Git;
use crate::io::process::{command_from_argv, run_command_with_timeout};
use crate::plan::EvidenceSpec;

/// Workspace facts captured before a step runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvidenceBaseline {
    /// Branch head for `commit` evidence.
    pub head: Option<String>,
    /// SHA-256 of the artifact file, if it already existed.
    pub artifact_digest: Option<String>,
}

/// Pluggable interpretation of declared evidence.
pub trait EvidenceChecker {
    fn baseline(&self, spec: &EvidenceSpec) -> Result<EvidenceBaseline>;

    fn check(
        &self,
        spec: &EvidenceSpec,
        baseline: &EvidenceBaseline,
        artifacts: &[EvidenceArtifact],
    ) -> Result<GuardVerdict>;
}

/// Default checker: git, filesystem, reported artifacts and commands.
#[derive(Debug, Clone)]
pub struct WorkspaceEvidenceChecker {
    workspace: PathBuf,
    /// Branch the run is bound to (`commit` evidence default).
    branch: Option<String>,
    command_timeout: Duration,
    output_limit_bytes: usize,
}

impl WorkspaceEvidenceChecker {
    pub fn new(
        workspace: &Path,
        branch: Option<String>,
        command_timeout: Duration,
        output_limit_bytes: usize,
    ) -> Self {
        Self {
            workspace: workspace.to_path_buf(),
            branch,
            command_timeout,
            output_limit_bytes,
        }
    }

    fn commit_branch<'a>(&'a self, declared: Option<&'a str>) -> Option<&'a str> {
        declared.or(self.branch.as_deref())
    }

    fn check_commit(
        &self,
        declared: Option<&str>,
        baseline: &EvidenceBaseline,
        artifacts: &[EvidenceArtifact],
    ) -> Result<GuardVerdict> {
        let Some(branch) = self.commit_branch(declared) else {
            return Ok(GuardVerdict::fail(
                "commit evidence needs a branch but the run has none",
            ));
        };
        let git = Git::new(&self.workspace);
        let Some(head) = git.rev_parse(branch)? else {
            return Ok(GuardVerdict::fail(format!("branch '{branch}' does not exist")));
        };

        let reported: Vec<&str> = artifacts
            .iter()
            .filter_map(|artifact| match artifact {
                EvidenceArtifact::Commit { sha } => Some(sha.as_str()),
                _ => None,
            })
            .collect();
        for sha in reported {
            let Some(resolved) = git.rev_parse(sha)? else {
                return Ok(GuardVerdict::fail(format!("reported commit {sha} does not exist")));
            };
            if !git.is_ancestor(&resolved, &head)? {
                return Ok(GuardVerdict::fail(format!(
                    "reported commit {sha} is not on branch '{branch}'"
                )));
            }
            let is_new = match baseline.head.as_deref() {
                Some(before) => !git.is_ancestor(&resolved, before)?,
                None => true,
            };
            if is_new {
                return Ok(GuardVerdict::Pass);
            }
        }

        if baseline.head.as_deref() != Some(head.as_str()) {
            return Ok(GuardVerdict::Pass);
        }
        Ok(GuardVerdict::fail(format!(
            "no new commit on branch '{branch}'"
        )))
    }

    fn check_artifact(&self, path: &str, baseline: &EvidenceBaseline) -> Result<GuardVerdict> {
        let Some(full) = resolve_inside(&self.workspace, path) else {
            return Ok(GuardVerdict::fail(format!(
                "artifact path '{path}' escapes the workspace"
            )));
        };
        let Some(digest) = file_sha256(&full)? else {
            return Ok(GuardVerdict::fail(format!("artifact '{path}' does not exist")));
        };
        if baseline.artifact_digest.as_deref() == Some(digest.as_str()) {
            return Ok(GuardVerdict::fail(format!(
                "artifact '{path}' was not created or modified"
            )));
        }
        Ok(GuardVerdict::Pass)
    }

    fn check_command(
        &self,
        argv: &[String],
        expect_stdout: Option<&str>,
        expect_exit: Option<i32>,
    ) -> Result<GuardVerdict> {
        let pattern = match expect_stdout.map(Regex::new).transpose() {
            Ok(pattern) => pattern,
            Err(err) => {
                return Ok(GuardVerdict::fail(format!("invalid expect_stdout regex: {err}")));
            }
        };
        let mut cmd = command_from_argv(argv)?;
        cmd.current_dir(&self.workspace);
        let output = match run_command_with_timeout(
            cmd,
            self.command_timeout,
            self.output_limit_bytes,
            None,
        ) {
            Ok(output) => output,
            Err(err) => {
                return Ok(GuardVerdict::fail(format!("evidence command failed: {err:#}")));
            }
        };
        if output.timed_out {
            return Ok(GuardVerdict::fail("evidence command timed out"));
        }
        let expected_exit = expect_exit.unwrap_or(0);
        if output.status.code() != Some(expected_exit) {
            return Ok(GuardVerdict::fail(format!(
                "evidence command exited with {:?}, expected {expected_exit}",
                output.status.code()
            )));
        }
        if let Some(pattern) = pattern {
            if !pattern.is_match(output.stdout_lossy().trim_end()) {
                return Ok(GuardVerdict::fail(format!(
                    "evidence command output does not match /{}/",
                    pattern.as_str()
                )));
            }
        }
        Ok(GuardVerdict::Pass)
    }
}

impl EvidenceChecker for WorkspaceEvidenceChecker {
    fn baseline(&self, spec: &EvidenceSpec) -> Result<EvidenceBaseline> {
        let mut baseline = EvidenceBaseline::default();
        match spec {
            EvidenceSpec::Commit { branch } => {
                if let Some(branch) = self.commit_branch(branch.as_deref()) {
                    let git = Git::new(&self.workspace);
                    if git.is_repo() {
                        baseline.head = git.rev_parse(branch)?;
                    }
                }
            }
            EvidenceSpec::Artifact { path } => {
                if let Some(full) = resolve_inside(&self.workspace, path) {
                    baseline.artifact_digest = file_sha256(&full)?;
                }
            }
            EvidenceSpec::ExternalState { .. }
            | EvidenceSpec::ApiResponse { .. }
            | EvidenceSpec::Command { .. } => {}
        }
        Ok(baseline)
    }

    #[instrument(skip_all, fields(evidence = spec.type_label()))]
    fn check(
        &self,
        spec: &EvidenceSpec,
        baseline: &EvidenceBaseline,
        artifacts: &[EvidenceArtifact],
    ) -> Result<GuardVerdict> {
        let verdict = match spec {
            EvidenceSpec::Commit { branch } => {
                self.check_commit(branch.as_deref(), baseline, artifacts)?
            }
            EvidenceSpec::Artifact { path } => self.check_artifact(path, baseline)?,
            EvidenceSpec::ExternalState { key, expected } => {
                check_external_state(key, expected.as_ref(), artifacts)
            }
            EvidenceSpec::ApiResponse {
                endpoint,
                expected_status,
            } => check_api_response(endpoint, *expected_status, artifacts),
            EvidenceSpec::Command {
                argv,
                expect_stdout,
                expect_exit,
            } => self.check_command(argv, expect_stdout.as_deref(), *expect_exit)?,
        };
        debug!(pass = verdict.is_pass(), "evidence checked");
        Ok(verdict)
    }
}

fn check_external_state(
    key: &str,
    expected: Option<&serde_json::Value>,
    artifacts: &[EvidenceArtifact],
) -> GuardVerdict {
    let reported: Vec<&serde_json::Value> = artifacts
        .iter()
        .filter_map(|artifact| match artifact {
            EvidenceArtifact::ExternalState { key: k, value } if k == key => Some(value),
            _ => None,
        })
        .collect();
    if reported.is_empty() {
        return GuardVerdict::fail(format!("external state '{key}' was not reported"));
    }
    match expected {
        Some(expected) if !reported.contains(&expected) => GuardVerdict::fail(format!(
            "external state '{key}' is not {expected}"
        )),
        _ => GuardVerdict::Pass,
    }
}

fn check_api_response(
    endpoint: &str,
    expected_status: Option<u16>,
    artifacts: &[EvidenceArtifact],
) -> GuardVerdict {
    let statuses: Vec<u16> = artifacts
        .iter()
        .filter_map(|artifact| match artifact {
            EvidenceArtifact::ApiResponse {
                endpoint: e,
                status,
                ..
            } if e == endpoint => Some(*status),
            _ => None,
        })
        .collect();
    if statuses.is_empty() {
        return GuardVerdict::fail(format!("no response recorded for '{endpoint}'"));
    }
    let accepted = statuses.iter().any(|status| match expected_status {
        Some(expected) => *status == expected,
        None => (200..300).contains(status),
    });
    if accepted {
        GuardVerdict::Pass
    } else {
        GuardVerdict::fail(format!(
            "'{endpoint}' responded with {statuses:?}, expected {}",
            expected_status.map_or_else(|| "2xx".to_string(), |s| s.to_string())
        ))
    }
}

/// Join a workspace-relative path, refusing absolute paths and `..`.
pub fn resolve_inside(root: &Path, relative: &str) -> Option<PathBuf> {
    let rel = Path::new(relative);
    let safe = rel
        .components()
        .all(|component| matches!(component, Component::Normal(_) | Component::CurDir));
    if relative.is_empty() || !safe {
        return None;
    }
    Some(root.join(rel))
}

fn file_sha256(path: &Path) -> Result<Option<String>> {
    if !path.is_file() {
        return Ok(None);
    }
    let bytes = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(Some(hex::encode(hasher.finalize())))
}
