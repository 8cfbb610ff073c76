//! Session bookkeeping: environment fingerprint, the single-active-run
//! marker, the workspace claim lock and the per-run process lock.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use tracing::{debug, warn};

use crate::core::state::{Environment, Session};
use crate::errors::EngineError;
use crate::io::fs_util::write_atomic;
use crate::io::paths::OrchestratorPaths;
use crate::plan::validate_id;

/// Fingerprint of the current process.
pub fn current_environment() -> Environment {
    Environment {
        host: host_name(),
        platform: format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
        cwd: std::env::current_dir()
            .map(|dir| dir.display().to_string())
            .unwrap_or_default(),
        pid: std::process::id(),
    }
}

fn host_name() -> String {
    if let Ok(name) = std::env::var("HOSTNAME") {
        if !name.trim().is_empty() {
            return name.trim().to_string();
        }
    }
    fs::read_to_string("/etc/hostname")
        .map(|name| name.trim().to_string())
        .ok()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Open a new session for this process.
pub fn new_session(now: DateTime<Utc>) -> Session {
    Session {
        session_id: format!("sess-{}", uuid::Uuid::new_v4().simple()),
        started_at: now,
        ended_at: None,
        phases_touched: Vec::new(),
        environment: current_environment(),
        interrupted: false,
    }
}

/// `.orchestrator/active-run-id`: names the run currently owning the workspace.
#[derive(Debug, Clone)]
pub struct ActiveRunMarker {
    path: PathBuf,
}

impl ActiveRunMarker {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    pub fn read(&self) -> Result<Option<String>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("read {}", self.path.display()))?;
        let run_id = contents.trim();
        Ok((!run_id.is_empty()).then(|| run_id.to_string()))
    }

    pub fn write(&self, run_id: &str) -> Result<()> {
        write_atomic(&self.path, format!("{run_id}\n").as_bytes())
    }

    /// Remove the marker if it still names `run_id`.
    pub fn clear(&self, run_id: &str) -> Result<()> {
        if self.read()?.as_deref() != Some(run_id) {
            return Ok(());
        }
        fs::remove_file(&self.path).with_context(|| format!("remove {}", self.path.display()))?;
        debug!(run_id, "active run marker cleared");
        Ok(())
    }
}

/// `explicit` if given, otherwise the run named by the active-run marker.
pub fn resolve_run_id(paths: &OrchestratorPaths, explicit: Option<&str>) -> Result<String> {
    if let Some(run_id) = explicit {
        validate_id(run_id).map_err(|err| anyhow!("run id: {err}"))?;
        return Ok(run_id.to_string());
    }
    ActiveRunMarker::new(&paths.active_run)
        .read()?
        .ok_or_else(|| anyhow!("no active run in {}", paths.workspace.display()))
}

/// Exclusive lock on `.orchestrator/workspace.lock`.
///
/// Held while the active-run marker is checked and claimed (or cleared), so
/// two processes cannot both find the workspace free. Blocks until the lock
/// is available; released on drop.
#[derive(Debug)]
pub struct WorkspaceLock {
    file: File,
}

impl WorkspaceLock {
    pub fn acquire(path: &Path) -> Result<Self> {
        let file = open_lock_file(path)?;
        file.lock_exclusive()
            .with_context(|| format!("lock {}", path.display()))?;
        debug!(path = %path.display(), "workspace lock acquired");
        Ok(Self { file })
    }
}

impl Drop for WorkspaceLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Exclusive lock on `runs/<run_id>/run.lock`, released on drop.
#[derive(Debug)]
pub struct RunLock {
    file: File,
}

impl RunLock {
    pub fn acquire(path: &Path, run_id: &str) -> Result<Self> {
        let file = open_lock_file(path)?;
        if file.try_lock_exclusive().is_err() {
            warn!(run_id, "run is locked by another process");
            return Err(EngineError::RunLocked {
                run_id: run_id.to_string(),
            }
            .into());
        }
        Ok(Self { file })
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn open_lock_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
        .with_context(|| format!("open lock file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::engine_error;

    #[test]
    fn marker_round_trips_and_clears_only_its_run() {
        let temp = tempfile::tempdir().expect("tempdir");
        let marker = ActiveRunMarker::new(&temp.path().join("active-run-id"));
        assert_eq!(marker.read().expect("read"), None);

        marker.write("run-a").expect("write");
        marker.clear("run-b").expect("clear other");
        assert_eq!(marker.read().expect("read").as_deref(), Some("run-a"));

        marker.clear("run-a").expect("clear");
        assert_eq!(marker.read().expect("read"), None);
    }

    #[test]
    fn second_lock_on_a_run_is_refused() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("run.lock");
        let held = RunLock::acquire(&path, "run-a").expect("first");

        let err = RunLock::acquire(&path, "run-a").expect_err("second");
        assert!(matches!(
            engine_error(&err),
            Some(EngineError::RunLocked { .. })
        ));

        drop(held);
        RunLock::acquire(&path, "run-a").expect("after release");
    }

    #[test]
    fn workspace_lock_serializes_claims() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("workspace.lock");
        let held = WorkspaceLock::acquire(&path).expect("first");

        let contender = {
            let path = path.clone();
            std::thread::spawn(move || WorkspaceLock::acquire(&path).map(|_| ()))
        };
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(!contender.is_finished());

        drop(held);
        contender.join().expect("join").expect("second after release");
    }

    #[test]
    fn new_session_carries_environment() {
        let session = new_session(Utc::now());
        assert!(session.session_id.starts_with("sess-"));
        assert_eq!(session.environment.pid, std::process::id());
        assert!(session.ended_at.is_none());
    }
}
