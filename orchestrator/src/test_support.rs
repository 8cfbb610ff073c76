//! Test-only helpers: plan builders, scripted collaborators and a git repo
//! fixture.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;

use anyhow::{Result, anyhow};
use chrono::Utc;
use serde_json::{Value, json};

use crate::core::event::{Event, NewEvent, event_id_for};
use crate::core::state::{Environment, RunState, Session, WorkspaceBinding};
use crate::core::types::RunStatus;
use crate::io::approvals::{Approval, ApprovalSource};
use crate::io::executor::{EvidenceArtifact, StepExecutor, StepRequest, StepResult};
use crate::plan::{AutonomyPolicy, EvidenceSpec, PhasePlan, Plan, StepPlan};

/// Create a deterministic step whose evidence is an `external_state` report
/// keyed `<id>-done`.
pub fn step(id: &str) -> StepPlan {
    StepPlan {
        step_id: id.to_string(),
        name: format!("Step {id}"),
        evidence: EvidenceSpec::ExternalState {
            key: format!("{id}-done"),
            expected: None,
        },
        destructive: false,
        mutates_workspace: false,
        touches: Vec::new(),
        parameters: Value::Null,
    }
}

/// Create a plan with enabled, non-retrying phases in the given order.
pub fn plan_with_phases(phases: Vec<(&str, Vec<StepPlan>)>) -> Plan {
    Plan {
        plan_id: "plan-1".to_string(),
        workflow_id: "wf-1".to_string(),
        work_item_reference: None,
        autonomy: AutonomyPolicy::default(),
        phases: phases
            .into_iter()
            .map(|(name, steps)| PhasePlan {
                name: name.to_string(),
                enabled: true,
                max_retries: 0,
                steps,
            })
            .collect(),
    }
}

pub fn workspace() -> WorkspaceBinding {
    WorkspaceBinding {
        root: PathBuf::from("/tmp/orchestrator-workspace"),
        branch: None,
    }
}

pub fn session(id: &str) -> Session {
    Session {
        session_id: id.to_string(),
        started_at: Utc::now(),
        ended_at: None,
        phases_touched: Vec::new(),
        environment: Environment {
            host: "test-host".to_string(),
            platform: "test".to_string(),
            cwd: "/tmp".to_string(),
            pid: 1,
        },
        interrupted: false,
    }
}

/// Initial state of `plan`, already moved to `in_progress`.
pub fn started_state(plan: &Plan) -> RunState {
    let mut state = RunState::initial("run-1", plan, workspace(), Utc::now());
    state.status = RunStatus::InProgress;
    state
}

/// Materialize an event as the log would have assigned it.
pub fn event_from(run_id: &str, sequence: u64, event: NewEvent) -> Event {
    Event {
        event_id: event_id_for(sequence),
        sequence,
        run_id: run_id.to_string(),
        kind: event.kind,
        phase: event.phase,
        step_id: event.step_id,
        status: event.status,
        metadata: event.metadata,
        timestamp: Utc::now(),
    }
}

/// Write `plan` as JSON into `dir` and return its path.
pub fn write_plan(dir: &Path, plan: &Plan) -> PathBuf {
    let path = dir.join("plan.json");
    let buf = serde_json::to_string_pretty(plan).expect("serialize plan");
    fs::write(&path, buf).expect("write plan");
    path
}

/// One scripted attempt of a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scripted {
    /// Claim success and report evidence matching the step's declaration.
    Succeed,
    /// Claim success without reporting any evidence.
    SucceedWithoutEvidence,
    Fail(String),
    Unavailable(String),
    /// The executor itself errors.
    Error(String),
}

/// Executor returning scripted outcomes per step id; unscripted attempts
/// succeed with matching evidence.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    scripts: Mutex<HashMap<String, VecDeque<Scripted>>>,
    calls: Mutex<Vec<(String, u32)>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue outcomes for successive attempts of `step_id`.
    pub fn script(self, step_id: &str, outcomes: Vec<Scripted>) -> Self {
        self.scripts
            .lock()
            .expect("scripts lock")
            .entry(step_id.to_string())
            .or_default()
            .extend(outcomes);
        self
    }

    /// `(step_id, attempt)` for every execution, in order.
    pub fn calls(&self) -> Vec<(String, u32)> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub fn call_count(&self, step_id: &str) -> usize {
        self.calls().iter().filter(|(id, _)| id == step_id).count()
    }
}

impl StepExecutor for ScriptedExecutor {
    fn execute(&self, request: &StepRequest) -> Result<StepResult> {
        self.calls
            .lock()
            .expect("calls lock")
            .push((request.step.step_id.clone(), request.attempt));
        let next = self
            .scripts
            .lock()
            .expect("scripts lock")
            .get_mut(&request.step.step_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Scripted::Succeed);
        match next {
            Scripted::Succeed => Ok(StepResult::succeeded(matching_evidence(
                &request.step.evidence,
            ))),
            Scripted::SucceedWithoutEvidence => Ok(StepResult::succeeded(Vec::new())),
            Scripted::Fail(reason) => Ok(StepResult::failed(reason)),
            Scripted::Unavailable(reason) => Ok(StepResult::unavailable(reason)),
            Scripted::Error(reason) => Err(anyhow!(reason)),
        }
    }
}

/// Evidence artifacts that satisfy reported-evidence declarations.
pub fn matching_evidence(spec: &EvidenceSpec) -> Vec<EvidenceArtifact> {
    match spec {
        EvidenceSpec::ExternalState { key, expected } => vec![EvidenceArtifact::ExternalState {
            key: key.clone(),
            value: expected.clone().unwrap_or_else(|| json!(true)),
        }],
        EvidenceSpec::ApiResponse {
            endpoint,
            expected_status,
        } => vec![EvidenceArtifact::ApiResponse {
            endpoint: endpoint.clone(),
            status: expected_status.unwrap_or(200),
            body: Value::Null,
        }],
        EvidenceSpec::Commit { .. } | EvidenceSpec::Artifact { .. } | EvidenceSpec::Command { .. } => {
            Vec::new()
        }
    }
}

/// In-memory approval source.
#[derive(Debug, Default)]
pub struct StaticApprovals {
    granted: Mutex<HashSet<String>>,
}

impl StaticApprovals {
    pub fn granting(keys: &[&str]) -> Self {
        let approvals = Self::default();
        for key in keys {
            approvals.grant(key);
        }
        approvals
    }

    pub fn grant(&self, key: &str) {
        self.granted
            .lock()
            .expect("approvals lock")
            .insert(key.to_string());
    }
}

impl ApprovalSource for StaticApprovals {
    fn lookup(&self, key: &str) -> Result<Option<Approval>> {
        let granted = self.granted.lock().expect("approvals lock").contains(key);
        Ok(granted.then(|| Approval {
            key: key.to_string(),
            approved_by: Some("test".to_string()),
            note: None,
            granted_at: Utc::now(),
        }))
    }
}

/// Temporary git repository on branch `main` with one initial commit.
pub struct TestRepo {
    dir: tempfile::TempDir,
}

impl TestRepo {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let repo = Self { dir };
        repo.git(&["init", "-q"]);
        repo.git(&["checkout", "-q", "-b", "main"]);
        repo.git(&["config", "user.email", "tests@example.com"]);
        repo.git(&["config", "user.name", "Orchestrator Tests"]);
        repo.git(&["config", "commit.gpgsign", "false"]);
        repo.commit_file("README.md", "fixture\n");
        repo
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn write_file(&self, relative: &str, contents: &str) {
        let path = self.path().join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        fs::write(path, contents).expect("write file");
    }

    pub fn commit_file(&self, relative: &str, contents: &str) {
        self.write_file(relative, contents);
        self.git(&["add", relative]);
        self.git(&["commit", "-q", "-m", &format!("update {relative}")]);
    }

    pub fn checkout_new_branch(&self, branch: &str) {
        self.git(&["checkout", "-q", "-b", branch]);
    }

    pub fn checkout(&self, branch: &str) {
        self.git(&["checkout", "-q", branch]);
    }

    /// Ignore the orchestrator directory so run files never dirty the tree.
    pub fn ignore_orchestrator_dir(&self) {
        self.commit_file(".gitignore", ".orchestrator/\n");
    }

    pub fn git(&self, args: &[&str]) -> String {
        let output = Command::new("git")
            .args(args)
            .current_dir(self.path())
            .output()
            .expect("spawn git");
        assert!(
            output.status.success(),
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8_lossy(&output.stdout).into_owned()
    }
}

impl Default for TestRepo {
    fn default() -> Self {
        Self::new()
    }
}
