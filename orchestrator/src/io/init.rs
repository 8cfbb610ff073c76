//! Scaffolding for `<workspace>/.orchestrator/`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use tracing::info;

use crate::io::config::{OrchestratorConfig, write_config};
use crate::io::fs_util::write_atomic;
use crate::io::paths::OrchestratorPaths;

/// Keeps engine bookkeeping out of `git status` so it never dirties the run branch.
const ORCHESTRATOR_GITIGNORE: &str = "*\n";

/// Options for `init_orchestrator`.
#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    /// Overwrite an existing config with the defaults.
    pub force: bool,
}

/// Create `.orchestrator/` scaffolding in `workspace`.
///
/// Fails if `.orchestrator/config.toml` already exists unless `options.force`
/// is set. Existing runs are never touched.
pub fn init_orchestrator(workspace: &Path, options: &InitOptions) -> Result<OrchestratorPaths> {
    let paths = OrchestratorPaths::new(workspace);
    if paths.root.exists() && !paths.root.is_dir() {
        return Err(anyhow!(
            "orchestrator init: {} exists but is not a directory",
            paths.root.display()
        ));
    }
    if paths.config.exists() && !options.force {
        return Err(anyhow!(
            "orchestrator init: {} already exists (use --force to overwrite)",
            paths.config.display()
        ));
    }

    fs::create_dir_all(&paths.runs_dir)
        .with_context(|| format!("create directory {}", paths.runs_dir.display()))?;
    write_atomic(&paths.root.join(".gitignore"), ORCHESTRATOR_GITIGNORE.as_bytes())?;
    write_config(&paths.config, &OrchestratorConfig::default())?;
    info!(root = %paths.root.display(), "orchestrator initialized");
    Ok(paths)
}

/// Create the scaffolding if it is missing; a no-op otherwise.
pub fn ensure_initialized(workspace: &Path) -> Result<OrchestratorPaths> {
    let paths = OrchestratorPaths::new(workspace);
    if paths.config.exists() {
        return Ok(paths);
    }
    init_orchestrator(workspace, &InitOptions::default())
}
