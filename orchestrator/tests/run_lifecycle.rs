//! End-to-end run tests: a plan is started in a temporary workspace and
//! driven by a scripted executor until the run completes, fails or pauses.

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;

use orchestrator::core::event::Event;
use orchestrator::core::types::{AutonomyLevel, EventKind, GatePoint, RunStatus, StepStatus};
use orchestrator::engine::{RunOptions, RunOutcome};
use orchestrator::errors::{EngineError, engine_error};
use orchestrator::io::config::{OrchestratorConfig, WorkspaceConfig, write_config};
use orchestrator::io::event_log::EventLog;
use orchestrator::io::init::{InitOptions, init_orchestrator};
use orchestrator::io::paths::OrchestratorPaths;
use orchestrator::io::state_store::StateStore;
use orchestrator::plan::{GateSpec, Plan};
use orchestrator::start::start_run;
use orchestrator::test_support::{
    Scripted, ScriptedExecutor, StaticApprovals, TestRepo, plan_with_phases, step, write_plan,
};

struct Workspace {
    dir: tempfile::TempDir,
    plans: tempfile::TempDir,
}

impl Workspace {
    fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("workspace"),
            plans: tempfile::tempdir().expect("plans"),
        }
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    fn plan(&self, plan: &Plan) -> PathBuf {
        write_plan(self.plans.path(), plan)
    }

    fn store(&self, run_id: &str) -> StateStore {
        let run_paths = OrchestratorPaths::new(self.path()).run(run_id);
        StateStore::new(
            run_id,
            &run_paths.state,
            EventLog::new(run_id, &run_paths.events_dir),
        )
    }

    fn events(&self, run_id: &str) -> Vec<Event> {
        self.store(run_id).events().read_all().expect("read events")
    }

    fn start(&self, plan: &Plan, executor: &ScriptedExecutor) -> RunOutcome {
        self.start_with(plan, executor, &RunOptions::default())
    }

    fn start_with(
        &self,
        plan: &Plan,
        executor: &ScriptedExecutor,
        options: &RunOptions<'_>,
    ) -> RunOutcome {
        start_run(self.path(), &self.plan(plan), executor, options).expect("start run")
    }
}

fn kinds(events: &[Event]) -> Vec<EventKind> {
    events.iter().map(|event| event.kind).collect()
}

/// Verifies three evidenced steps complete the run with one terminal event each.
#[test]
fn three_evidenced_steps_complete_the_run() {
    let ws = Workspace::new();
    let plan = plan_with_phases(vec![
        ("frame", vec![step("a")]),
        ("build", vec![step("b"), step("c")]),
    ]);

    let outcome = ws.start(&plan, &ScriptedExecutor::new());

    assert_eq!(outcome.status, RunStatus::Completed);
    let events = ws.events(&outcome.run_id);
    let terminal: Vec<&Event> = events
        .iter()
        .filter(|event| event.kind == EventKind::StepComplete)
        .collect();
    assert_eq!(terminal.len(), 3);
    assert!(
        terminal
            .iter()
            .all(|event| event.status.as_deref() == Some("success"))
    );
    assert_eq!(events.first().map(|e| e.kind), Some(EventKind::WorkflowStart));
    assert_eq!(events.last().map(|e| e.kind), Some(EventKind::WorkflowComplete));

    let sequences: Vec<u64> = events.iter().map(|event| event.sequence).collect();
    let expected: Vec<u64> = (1..=events.len() as u64).collect();
    assert_eq!(sequences, expected);

    let state = ws.store(&outcome.run_id).load().expect("load");
    assert!(state.completed_at.is_some());
    for recorded in &state.steps {
        let event_id = recorded.event_id.as_deref().expect("event reference");
        let matching = events
            .iter()
            .filter(|event| {
                event.event_id == event_id
                    && event.step_id.as_deref() == Some(recorded.step_id.as_str())
            })
            .count();
        assert_eq!(matching, 1, "step {}", recorded.step_id);
    }
}

/// Verifies a success claim without evidence fails the run and names the step.
#[test]
fn success_without_evidence_fails_the_run() {
    let ws = Workspace::new();
    let plan = plan_with_phases(vec![("build", vec![step("a"), step("b"), step("c")])]);
    let executor = ScriptedExecutor::new().script("b", vec![Scripted::SucceedWithoutEvidence]);

    let outcome = ws.start(&plan, &executor);

    assert_eq!(outcome.status, RunStatus::Failed);
    assert_eq!(outcome.stopped_step.as_deref(), Some("b"));
    let reason = outcome.reason.expect("failure reason");
    assert!(reason.contains("'b'"), "{reason}");
    assert!(reason.contains("no evidence"), "{reason}");
    assert!(outcome.report.contains("failed at build/b"), "{}", outcome.report);
    assert_eq!(executor.call_count("c"), 0);

    let state = ws.store(&outcome.run_id).load().expect("load");
    assert_eq!(state.step("b").map(|s| s.status), Some(StepStatus::Failure));
    assert_eq!(state.step("c").map(|s| s.status), Some(StepStatus::Pending));
}

#[test]
fn failed_step_is_retried_within_phase_budget() {
    let ws = Workspace::new();
    let mut plan = plan_with_phases(vec![("build", vec![step("a"), step("b")])]);
    plan.phases[0].max_retries = 1;
    let executor = ScriptedExecutor::new().script("b", vec![Scripted::Fail("flaky".to_string())]);

    let outcome = ws.start(&plan, &executor);

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(
        executor.calls(),
        vec![
            ("a".to_string(), 1),
            ("b".to_string(), 1),
            ("b".to_string(), 2),
        ]
    );
    let events = ws.events(&outcome.run_id);
    assert_eq!(
        events
            .iter()
            .filter(|event| event.kind == EventKind::PhaseRetry)
            .count(),
        1
    );
    let state = ws.store(&outcome.run_id).load().expect("load");
    assert_eq!(state.phase("build").map(|p| p.retry_count), Some(1));
    assert_eq!(state.step("b").map(|s| s.retries_used), Some(1));
}

#[test]
fn exhausted_retries_fail_the_phase_and_run() {
    let ws = Workspace::new();
    let mut plan = plan_with_phases(vec![("build", vec![step("a")]), ("ship", vec![step("b")])]);
    plan.phases[0].max_retries = 1;
    let executor = ScriptedExecutor::new().script(
        "a",
        vec![
            Scripted::Fail("boom".to_string()),
            Scripted::Error("executor crashed".to_string()),
        ],
    );

    let outcome = ws.start(&plan, &executor);

    assert_eq!(outcome.status, RunStatus::Failed);
    assert!(
        outcome
            .reason
            .as_deref()
            .is_some_and(|reason| reason.contains("executor crashed"))
    );
    let kinds = kinds(&ws.events(&outcome.run_id));
    assert!(kinds.contains(&EventKind::PhaseFailed));
    assert_eq!(kinds.last(), Some(&EventKind::WorkflowFailed));
    assert_eq!(executor.call_count("b"), 0);
}

#[test]
fn disabled_phase_is_skipped_with_one_event_per_step() {
    let ws = Workspace::new();
    let mut plan = plan_with_phases(vec![
        ("build", vec![step("a")]),
        ("docs", vec![step("b"), step("c")]),
    ]);
    plan.phases[1].enabled = false;
    let executor = ScriptedExecutor::new();

    let outcome = ws.start(&plan, &executor);

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(executor.call_count("b"), 0);
    let events = ws.events(&outcome.run_id);
    let skipped: Vec<&str> = events
        .iter()
        .filter(|event| event.status.as_deref() == Some("skipped"))
        .filter_map(|event| event.step_id.as_deref())
        .collect();
    assert_eq!(skipped, vec!["b", "c"]);
    assert!(kinds(&events).contains(&EventKind::PhaseSkipped));
}

#[test]
fn destructive_step_pauses_without_approval() {
    let ws = Workspace::new();
    let mut wipe = step("wipe");
    wipe.destructive = true;
    let plan = plan_with_phases(vec![("cleanup", vec![step("a"), wipe])]);
    let executor = ScriptedExecutor::new();

    let outcome = ws.start(&plan, &executor);

    assert_eq!(outcome.status, RunStatus::Paused);
    assert_eq!(outcome.stopped_step.as_deref(), Some("wipe"));
    assert!(
        outcome
            .reason
            .as_deref()
            .is_some_and(|reason| reason.contains("awaiting approval 'step-wipe'"))
    );
    assert_eq!(executor.call_count("wipe"), 0);
    let state = ws.store(&outcome.run_id).load().expect("load");
    assert_eq!(state.step("wipe").map(|s| s.status), Some(StepStatus::Pending));
    assert!(outcome.report.contains("to continue: orchestrator resume"));
}

/// One approval covers the destructive step across phase retries.
#[test]
fn granted_approval_is_consumed_and_logged() {
    let ws = Workspace::new();
    let mut wipe = step("wipe");
    wipe.destructive = true;
    let mut plan = plan_with_phases(vec![("cleanup", vec![wipe])]);
    plan.phases[0].max_retries = 1;
    let approvals = StaticApprovals::granting(&["step-wipe"]);
    let options = RunOptions {
        approvals: Some(&approvals),
        ..RunOptions::default()
    };
    let executor =
        ScriptedExecutor::new().script("wipe", vec![Scripted::Fail("disk busy".to_string())]);

    let outcome = ws.start_with(&plan, &executor, &options);

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(executor.call_count("wipe"), 2);
    let granted: Vec<Event> = ws
        .events(&outcome.run_id)
        .into_iter()
        .filter(|event| event.kind == EventKind::ApprovalGranted)
        .collect();
    assert_eq!(granted.len(), 1);
    assert_eq!(
        granted[0].metadata.get("key").and_then(|v| v.as_str()),
        Some("step-wipe")
    );
}

#[test]
fn autonomy_gates_follow_the_configured_level() {
    let ws = Workspace::new();
    let mut plan = plan_with_phases(vec![("build", vec![step("a")]), ("ship", vec![step("b")])]);
    plan.autonomy.level = AutonomyLevel::Guarded;
    plan.autonomy.gates.push(GateSpec {
        phase: "ship".to_string(),
        when: GatePoint::Before,
    });

    let outcome = ws.start(&plan, &ScriptedExecutor::new());
    assert_eq!(outcome.status, RunStatus::Paused);
    assert_eq!(outcome.stopped_phase.as_deref(), Some("ship"));
    assert!(
        outcome
            .reason
            .as_deref()
            .is_some_and(|reason| reason.contains("gate-before-ship"))
    );

    let ws = Workspace::new();
    plan.autonomy.level = AutonomyLevel::Autonomous;
    let outcome = ws.start(&plan, &ScriptedExecutor::new());
    assert_eq!(outcome.status, RunStatus::Completed);
}

#[test]
fn cancellation_during_a_gate_wait_pauses_and_closes_the_session() {
    let ws = Workspace::new();
    let paths = init_orchestrator(ws.path(), &InitOptions::default()).expect("init");
    let config = OrchestratorConfig {
        approval_wait_secs: 30,
        approval_poll_millis: 10,
        ..OrchestratorConfig::default()
    };
    write_config(&paths.config, &config).expect("config");
    let mut plan = plan_with_phases(vec![("build", vec![step("a")])]);
    plan.autonomy.level = AutonomyLevel::Assisted;
    let executor = ScriptedExecutor::new();
    let options = RunOptions::default();
    options.cancel.store(true, Ordering::SeqCst);

    let outcome = ws.start_with(&plan, &executor, &options);

    assert_eq!(outcome.status, RunStatus::Paused);
    assert!(
        outcome.reason.as_deref().is_some_and(|reason| {
            reason.contains("cancelled while awaiting approval 'gate-before-build'")
        }),
        "{:?}",
        outcome.reason
    );
    assert!(executor.calls().is_empty());
    let state = ws.store(&outcome.run_id).load().expect("load");
    assert!(state.sessions.current.is_none());
    let closed = state.sessions.session_history.last().expect("session");
    assert!(closed.ended_at.is_some());
    assert!(!closed.interrupted);
}

#[test]
fn cancellation_stops_the_run_before_the_next_step() {
    let ws = Workspace::new();
    let plan = plan_with_phases(vec![("build", vec![step("a"), step("b")])]);
    let executor = ScriptedExecutor::new();
    let options = RunOptions::default();
    options.cancel.store(true, Ordering::SeqCst);

    let outcome = ws.start_with(&plan, &executor, &options);

    assert_eq!(outcome.status, RunStatus::Paused);
    assert_eq!(outcome.stopped_step.as_deref(), Some("a"));
    assert_eq!(
        outcome.reason.as_deref(),
        Some("cancelled before step 'a'")
    );
    assert!(executor.calls().is_empty());
    let state = ws.store(&outcome.run_id).load().expect("load");
    assert_eq!(state.step("a").map(|s| s.status), Some(StepStatus::Pending));
    assert!(state.sessions.current.is_none());
}

/// A mutating step on a protected branch is held before the executor runs.
#[test]
fn workspace_guard_violation_pauses_before_the_step_runs() {
    let repo = TestRepo::new();
    let paths = init_orchestrator(repo.path(), &InitOptions::default()).expect("init");
    let config = OrchestratorConfig {
        workspace: WorkspaceConfig {
            create_run_branch: false,
            ..WorkspaceConfig::default()
        },
        ..OrchestratorConfig::default()
    };
    write_config(&paths.config, &config).expect("config");
    let mut edit = step("edit");
    edit.mutates_workspace = true;
    let plan = plan_with_phases(vec![("build", vec![step("a"), edit])]);
    let plans = tempfile::tempdir().expect("plans");
    let executor = ScriptedExecutor::new();

    let outcome = start_run(
        repo.path(),
        &write_plan(plans.path(), &plan),
        &executor,
        &RunOptions::default(),
    )
    .expect("start run");

    assert_eq!(outcome.status, RunStatus::Paused);
    assert_eq!(outcome.stopped_step.as_deref(), Some("edit"));
    let reason = outcome.reason.clone().unwrap_or_default();
    assert!(reason.starts_with("workspace-safety guard:"), "{reason}");
    assert!(reason.contains("protected branch 'main'"), "{reason}");
    assert_eq!(executor.call_count("a"), 1);
    assert_eq!(executor.call_count("edit"), 0);

    let run_paths = paths.run(&outcome.run_id);
    let store = StateStore::new(
        &outcome.run_id,
        &run_paths.state,
        EventLog::new(&outcome.run_id, &run_paths.events_dir),
    );
    let state = store.load().expect("load");
    assert_eq!(state.step("edit").map(|s| s.status), Some(StepStatus::Pending));
    assert_eq!(state.workspace.branch.as_deref(), Some("main"));
}

#[test]
fn second_start_is_refused_while_a_run_is_active() {
    let ws = Workspace::new();
    let plan = plan_with_phases(vec![("build", vec![step("a")])]);
    let executor =
        ScriptedExecutor::new().script("a", vec![Scripted::Unavailable("api down".to_string())]);
    let first = ws.start(&plan, &executor);
    assert_eq!(first.status, RunStatus::Paused);

    let err = start_run(
        ws.path(),
        &ws.plan(&plan),
        &ScriptedExecutor::new(),
        &RunOptions::default(),
    )
    .unwrap_err();

    match engine_error(&err) {
        Some(EngineError::ConcurrentRun { active_run_id }) => {
            assert_eq!(active_run_id, &first.run_id);
        }
        other => panic!("expected ConcurrentRun, got {other:?}"),
    }
}

/// Starts racing on one workspace: exactly one claims it, the rest are refused.
#[test]
fn concurrent_starts_admit_exactly_one_run() {
    let ws = Workspace::new();
    init_orchestrator(ws.path(), &InitOptions::default()).expect("init");
    let plan = plan_with_phases(vec![("build", vec![step("a")])]);
    let plan_path = ws.plan(&plan);

    let results: Vec<anyhow::Result<RunOutcome>> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                scope.spawn(|| {
                    let executor = ScriptedExecutor::new()
                        .script("a", vec![Scripted::Unavailable("api down".to_string())]);
                    start_run(ws.path(), &plan_path, &executor, &RunOptions::default())
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("join"))
            .collect()
    });

    let accepted: Vec<&RunOutcome> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(accepted.len(), 1, "accepted: {accepted:?}");
    assert_eq!(accepted[0].status, RunStatus::Paused);
    for err in results.iter().filter_map(|r| r.as_ref().err()) {
        match engine_error(err) {
            Some(EngineError::ConcurrentRun { active_run_id }) => {
                assert_eq!(active_run_id, &accepted[0].run_id);
            }
            other => panic!("expected ConcurrentRun, got {other:?}: {err:#}"),
        }
    }
    let runs = std::fs::read_dir(OrchestratorPaths::new(ws.path()).runs_dir)
        .expect("runs dir")
        .count();
    assert_eq!(runs, 1);
}

#[test]
fn finished_run_releases_the_workspace() {
    let ws = Workspace::new();
    let plan = plan_with_phases(vec![("build", vec![step("a")])]);
    let first = ws.start(&plan, &ScriptedExecutor::new());
    assert_eq!(first.status, RunStatus::Completed);

    let second = ws.start(&plan, &ScriptedExecutor::new());
    assert_eq!(second.status, RunStatus::Completed);
    assert_ne!(first.run_id, second.run_id);
}

#[test]
fn invalid_plan_is_rejected_before_a_run_exists() {
    let ws = Workspace::new();
    let plan = plan_with_phases(vec![("build", vec![step("a"), step("a")])]);

    let err = start_run(
        ws.path(),
        &ws.plan(&plan),
        &ScriptedExecutor::new(),
        &RunOptions::default(),
    )
    .unwrap_err();

    assert!(format!("{err:#}").contains("duplicate step id 'a'"));
    let runs = OrchestratorPaths::new(ws.path()).runs_dir;
    assert_eq!(std::fs::read_dir(runs).expect("runs dir").count(), 0);
}
