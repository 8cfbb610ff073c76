//! Starting a new run.
//!
//! A run is one execution of a plan, identified by a stable `run_id`.
//! Starting a run snapshots the plan, binds the run to the workspace (and to
//! an `orchestrator/<run-id>` branch when the workspace is a git repository),
//! records `workflow_start` and drives the phases until the run stops.

use std::path::Path;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::core::event::NewEvent;
use crate::core::state::{RunState, WorkspaceBinding};
use crate::core::types::{EventKind, RunStatus};
use crate::engine::{RunOptions, RunOutcome, RunSetup};
use crate::errors::EngineError;
use crate::io::config::{OrchestratorConfig, load_config};
use crate::io::executor::StepExecutor;
use crate::io::fs_util::read_json;
use crate::io::git::Git;
use crate::io::init::ensure_initialized;
use crate::io::paths::OrchestratorPaths;
use crate::io::plan_store::{load_plan, write_plan_snapshot};
use crate::io::session::{ActiveRunMarker, RunLock, WorkspaceLock, new_session};
use crate::looping::drive_run;
use crate::plan::validate_id;

/// Start a run of the plan at `plan_path` in `workspace`.
///
/// - Ensures `.orchestrator/` scaffolding exists.
/// - Refuses to start while another non-terminal run owns the workspace.
/// - Creates and checks out `orchestrator/<run-id>` (configurable).
/// - Runs until the run completes, fails or pauses.
pub fn start_run(
    workspace: &Path,
    plan_path: &Path,
    executor: &dyn StepExecutor,
    options: &RunOptions<'_>,
) -> Result<RunOutcome> {
    debug!(workspace = %workspace.display(), plan = %plan_path.display(), "starting run");
    let paths = ensure_initialized(workspace)?;
    let config = load_config(&paths.config)?;
    let plan = load_plan(plan_path)?;

    let marker = ActiveRunMarker::new(&paths.active_run);
    let claim = WorkspaceLock::acquire(&paths.workspace_lock)?;
    ensure_no_active_run(&paths, &marker)?;

    let run_id = generate_run_id(&paths)?;
    let run_paths = paths.run(&run_id);
    let _lock = RunLock::acquire(&run_paths.lock, &run_id)?;
    write_plan_snapshot(&run_paths.plan, &plan)?;

    let binding = bind_workspace(workspace, &config, &run_id)?;
    let branch = binding.branch.clone();
    let setup = RunSetup {
        run_id: run_id.clone(),
        paths,
        config,
        plan,
    };
    let store = setup.store();
    let mut state = store.create(RunState::initial(&run_id, &setup.plan, binding, Utc::now()))?;
    marker.write(&run_id)?;
    drop(claim);
    info!(run_id = %run_id, branch = ?branch, "run started");

    setup.with_context(branch.clone(), executor, options, |ctx| {
        let mut event = NewEvent::new(EventKind::WorkflowStart)
            .status(RunStatus::InProgress.as_str())
            .meta("plan_id", ctx.plan.plan_id.as_str())
            .meta("workflow_id", ctx.plan.workflow_id.as_str())
            .meta("plan_digest", state.plan_digest.as_str());
        if let Some(branch) = branch.as_deref() {
            event = event.meta("branch", branch);
        }
        ctx.record(&mut state, event, |next, event| {
            next.status = RunStatus::InProgress;
            next.open_session(new_session(event.timestamp));
        })?;
        drive_run(ctx, &mut state)
    })
}

/// A marker naming a finished (or vanished) run is stale and ignored.
fn ensure_no_active_run(paths: &OrchestratorPaths, marker: &ActiveRunMarker) -> Result<()> {
    let Some(active) = marker.read()? else {
        return Ok(());
    };
    let state_path = paths.run(&active).state;
    if !state_path.exists() {
        warn!(run_id = %active, "ignoring stale active run marker");
        return Ok(());
    }
    let state: RunState = read_json(&state_path)
        .with_context(|| format!("inspect active run '{active}'"))?;
    if state.status.is_terminal() {
        warn!(run_id = %active, status = state.status.as_str(), "ignoring stale active run marker");
        return Ok(());
    }
    Err(EngineError::ConcurrentRun {
        active_run_id: active,
    }
    .into())
}

/// Bind the run to the workspace root and, in a git repository, to its branch.
fn bind_workspace(
    workspace: &Path,
    config: &OrchestratorConfig,
    run_id: &str,
) -> Result<WorkspaceBinding> {
    let root = workspace
        .canonicalize()
        .with_context(|| format!("resolve workspace {}", workspace.display()))?;
    let git = Git::new(&root);
    if !git.is_repo() {
        debug!("workspace is not a git repository; binding without a branch");
        return Ok(WorkspaceBinding { root, branch: None });
    }

    // Refuse to start on top of uncommitted user work; engine files are ignored.
    git.ensure_clean_except_prefixes(&[".orchestrator/"])?;

    if !config.workspace.create_run_branch {
        let branch = git
            .current_branch()?
            .ok_or_else(|| anyhow!("cannot start a run on a detached HEAD"))?;
        return Ok(WorkspaceBinding {
            root,
            branch: Some(branch),
        });
    }

    let branch = format!("orchestrator/{run_id}");
    if git.branch_exists(&branch)? {
        return Err(anyhow!("branch {branch} already exists"));
    }
    git.checkout_new_branch(&branch)
        .with_context(|| format!("create branch {branch}"))?;
    info!(branch = %branch, "created run branch");
    Ok(WorkspaceBinding {
        root,
        branch: Some(branch),
    })
}

/// `run-<yyyymmdd>-<8 hex>`, unique among the runs of this workspace.
fn generate_run_id(paths: &OrchestratorPaths) -> Result<String> {
    let date = Utc::now().format("%Y%m%d");
    for _ in 0..16 {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let id = format!("run-{date}-{}", &suffix[..8]);
        validate_id(&id).map_err(|err| anyhow!("generated run id: {err}"))?;
        if !paths.run(&id).dir.exists() {
            return Ok(id);
        }
    }
    Err(anyhow!("unable to generate a unique run id"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::session::ActiveRunMarker;
    use crate::test_support::{ScriptedExecutor, TestRepo, plan_with_phases, step, write_plan};

    #[test]
    fn run_ids_are_dated_and_unique() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = OrchestratorPaths::new(temp.path());
        let id = generate_run_id(&paths).expect("id");
        assert!(id.starts_with(&format!("run-{}-", Utc::now().format("%Y%m%d"))));
        assert_eq!(id.len(), "run-20260101-".len() + 8);
        assert_ne!(id, generate_run_id(&paths).expect("second id"));
    }

    #[test]
    fn start_creates_run_branch_in_git_workspace() {
        let repo = TestRepo::new();
        let plan = plan_with_phases(vec![("build", vec![step("a")])]);
        let plan_dir = tempfile::tempdir().expect("tempdir");
        let plan_path = write_plan(plan_dir.path(), &plan);

        let outcome = start_run(
            repo.path(),
            &plan_path,
            &ScriptedExecutor::new(),
            &RunOptions::default(),
        )
        .expect("start");

        assert_eq!(outcome.status, RunStatus::Completed);
        let branch = repo.git(&["rev-parse", "--abbrev-ref", "HEAD"]);
        assert_eq!(branch.trim(), format!("orchestrator/{}", outcome.run_id));
    }

    #[test]
    fn start_refuses_dirty_worktree() {
        let repo = TestRepo::new();
        repo.write_file("notes.txt", "uncommitted");
        let plan = plan_with_phases(vec![("build", vec![step("a")])]);
        let plan_dir = tempfile::tempdir().expect("tempdir");
        let plan_path = write_plan(plan_dir.path(), &plan);

        let err = start_run(
            repo.path(),
            &plan_path,
            &ScriptedExecutor::new(),
            &RunOptions::default(),
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("working tree not clean"));
    }

    #[test]
    fn stale_marker_for_missing_run_is_ignored() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = ensure_initialized(temp.path()).expect("init");
        let marker = ActiveRunMarker::new(&paths.active_run);
        marker.write("run-gone").expect("marker");

        ensure_no_active_run(&paths, &marker).expect("stale marker ignored");
    }
}
