//! Command-line entry point for the workflow orchestrator.
//!
//! Runs plans of phases and steps with evidence-checked progress, an
//! append-only event log and resumable state under `.orchestrator/`.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use orchestrator::core::types::RunStatus;
use orchestrator::engine::{RunOptions, RunOutcome};
use orchestrator::errors::exit_code_for_error;
use orchestrator::exit_codes;
use orchestrator::io::approvals::FileApprovalStore;
use orchestrator::io::executor::CommandStepExecutor;
use orchestrator::io::init::{InitOptions, init_orchestrator};
use orchestrator::io::paths::OrchestratorPaths;
use orchestrator::io::session::resolve_run_id;
use orchestrator::logging;
use orchestrator::resume::resume_run;
use orchestrator::start::start_run;
use orchestrator::status::run_status;
use orchestrator::validate::validate_run;
use tracing::warn;

#[derive(Parser)]
#[command(
    name = "orchestrator",
    version,
    about = "Evidence-checked, resumable workflow orchestrator"
)]
struct Cli {
    /// Workspace the runs operate on.
    #[arg(long, global = true, default_value = ".")]
    workspace: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.orchestrator/` with a default config.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Start a new run of a plan file.
    Start {
        #[arg(long)]
        plan: PathBuf,
    },
    /// Continue a paused or interrupted run (default: the active run).
    Resume { run_id: Option<String> },
    /// Print the state of a run without modifying it.
    Status {
        run_id: Option<String>,
        /// Also list the event log.
        #[arg(long)]
        events: bool,
    },
    /// Grant an approval signal (`gate-before-<phase>`, `step-<id>`, ...).
    Approve {
        run_id: String,
        key: String,
        #[arg(long)]
        by: Option<String>,
        #[arg(long)]
        note: Option<String>,
    },
    /// Check a run's state against its event log.
    Validate { run_id: Option<String> },
}

fn main() {
    logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_code_for_error(&err)
        }
    };
    std::process::exit(code);
}

/// Options whose cancel flag is raised by SIGINT/SIGTERM, so the run pauses
/// at the next step boundary or approval wait and closes its session.
fn interruptible_options() -> Result<RunOptions<'static>> {
    let options = RunOptions::default();
    let cancel = Arc::clone(&options.cancel);
    ctrlc::set_handler(move || {
        warn!("interrupt received; pausing the run");
        cancel.store(true, Ordering::SeqCst);
    })
    .context("install interrupt handler")?;
    Ok(options)
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let workspace = cli.workspace;
    match cli.command {
        Command::Init { force } => {
            let paths = init_orchestrator(&workspace, &InitOptions { force })?;
            println!("initialized {}", paths.root.display());
            Ok(exit_codes::OK)
        }
        Command::Start { plan } => {
            let outcome = start_run(
                &workspace,
                &plan,
                &CommandStepExecutor,
                &interruptible_options()?,
            )?;
            Ok(report_outcome(&outcome))
        }
        Command::Resume { run_id } => {
            let outcome = resume_run(
                &workspace,
                run_id.as_deref(),
                &CommandStepExecutor,
                &interruptible_options()?,
            )?;
            Ok(report_outcome(&outcome))
        }
        Command::Status { run_id, events } => {
            let report = run_status(&workspace, run_id.as_deref())?;
            print!("{}", report.render(events));
            Ok(if report.integrity_ok {
                exit_codes::OK
            } else {
                exit_codes::TAMPERED
            })
        }
        Command::Approve {
            run_id,
            key,
            by,
            note,
        } => {
            let paths = OrchestratorPaths::new(&workspace);
            let run_id = resolve_run_id(&paths, Some(run_id.as_str()))?;
            let run_paths = paths.run(&run_id);
            if !run_paths.state.exists() {
                anyhow::bail!("unknown run '{run_id}'");
            }
            let approval = FileApprovalStore::new(&run_paths.approvals_dir).grant(&key, by, note)?;
            println!("approved {} for run {run_id}", approval.key);
            Ok(exit_codes::OK)
        }
        Command::Validate { run_id } => {
            let outcome = validate_run(&workspace, run_id.as_deref())?;
            println!(
                "run {} ({}): {} check",
                outcome.run_id,
                outcome.status.as_str(),
                outcome.mode.as_str()
            );
            if !outcome.plan_matches {
                println!("plan snapshot does not match the recorded digest");
            }
            for discrepancy in &outcome.result.discrepancies {
                println!("  {discrepancy}");
            }
            if outcome.passed() {
                println!("ok");
                Ok(exit_codes::OK)
            } else {
                Ok(exit_codes::TAMPERED)
            }
        }
    }
}

fn report_outcome(outcome: &RunOutcome) -> i32 {
    print!("{}", outcome.report);
    match outcome.status {
        RunStatus::Completed => exit_codes::OK,
        RunStatus::Paused => exit_codes::PAUSED,
        RunStatus::Failed => exit_codes::FAILED,
        RunStatus::Pending | RunStatus::InProgress => exit_codes::INVALID,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_init_force() {
        let cli = Cli::parse_from(["orchestrator", "init", "--force"]);
        assert!(matches!(cli.command, Command::Init { force: true }));
    }

    #[test]
    fn parse_resume_defaults_to_active_run() {
        let cli = Cli::parse_from(["orchestrator", "--workspace", "/tmp/ws", "resume"]);
        assert_eq!(cli.workspace, PathBuf::from("/tmp/ws"));
        assert!(matches!(cli.command, Command::Resume { run_id: None }));
    }

    #[test]
    fn parse_approve_with_operator() {
        let cli = Cli::parse_from([
            "orchestrator",
            "approve",
            "run-1",
            "step-wipe",
            "--by",
            "ops",
        ]);
        match cli.command {
            Command::Approve { run_id, key, by, note } => {
                assert_eq!(run_id, "run-1");
                assert_eq!(key, "step-wipe");
                assert_eq!(by.as_deref(), Some("ops"));
                assert_eq!(note, None);
            }
            _ => panic!("expected approve"),
        }
    }

    #[test]
    fn outcome_status_maps_to_exit_code() {
        let outcome = |status| RunOutcome {
            run_id: "run-1".to_string(),
            status,
            stopped_phase: None,
            stopped_step: None,
            reason: None,
            report: String::new(),
        };
        assert_eq!(report_outcome(&outcome(RunStatus::Completed)), exit_codes::OK);
        assert_eq!(report_outcome(&outcome(RunStatus::Paused)), exit_codes::PAUSED);
        assert_eq!(report_outcome(&outcome(RunStatus::Failed)), exit_codes::FAILED);
    }
}
