//! On-disk layout of an orchestrator workspace.

use std::path::{Path, PathBuf};

/// Paths under `<workspace>/.orchestrator/`.
#[derive(Debug, Clone)]
pub struct OrchestratorPaths {
    pub workspace: PathBuf,
    pub root: PathBuf,
    pub config: PathBuf,
    pub active_run: PathBuf,
    /// Serializes claims on `active_run`.
    pub workspace_lock: PathBuf,
    pub runs_dir: PathBuf,
}

impl OrchestratorPaths {
    pub fn new(workspace: &Path) -> Self {
        let root = workspace.join(".orchestrator");
        Self {
            workspace: workspace.to_path_buf(),
            config: root.join("config.toml"),
            active_run: root.join("active-run-id"),
            workspace_lock: root.join("workspace.lock"),
            runs_dir: root.join("runs"),
            root,
        }
    }

    pub fn run(&self, run_id: &str) -> RunPaths {
        RunPaths::new(&self.runs_dir.join(run_id))
    }
}

/// Paths for a single run under `runs/<run_id>/`.
#[derive(Debug, Clone)]
pub struct RunPaths {
    pub dir: PathBuf,
    pub plan: PathBuf,
    pub state: PathBuf,
    pub lock: PathBuf,
    pub events_dir: PathBuf,
    pub approvals_dir: PathBuf,
    pub steps_dir: PathBuf,
}

impl RunPaths {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            plan: dir.join("plan.json"),
            state: dir.join("state.json"),
            lock: dir.join("run.lock"),
            events_dir: dir.join("events"),
            approvals_dir: dir.join("approvals"),
            steps_dir: dir.join("steps"),
        }
    }

    /// Directory for executor logs of one step attempt.
    pub fn attempt_dir(&self, step_id: &str, attempt: u32) -> PathBuf {
        self.steps_dir.join(step_id).join(attempt.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_paths_follow_layout() {
        let paths = OrchestratorPaths::new(Path::new("/ws"));
        let run = paths.run("run-1");
        assert_eq!(run.state, PathBuf::from("/ws/.orchestrator/runs/run-1/state.json"));
        assert_eq!(
            run.attempt_dir("a", 2),
            PathBuf::from("/ws/.orchestrator/runs/run-1/steps/a/2")
        );
        assert_eq!(
            run.approvals_dir,
            PathBuf::from("/ws/.orchestrator/runs/run-1/approvals")
        );
    }
}
