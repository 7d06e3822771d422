//! End-to-end orchestration runs against scripted agents and a scripted Ward
//! gate.
//!
//! Each test writes a quest into a temporary project, drives `run_quest`, and
//! inspects the quest file, the recorded spawns, and the emitted events.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use quest_runner::core::types::AgentRole;
use quest_runner::core::ward::{Diagnostic, Severity, WardResult};
use quest_runner::error::QuestError;
use quest_runner::io::prompt::PromptRegistry;
use quest_runner::io::quest_store::{load_quest, quest_folder};
use quest_runner::io::ward_log::read_ward_records;
use quest_runner::orchestrate::Orchestrator;
use quest_runner::quest::{QuestStatus, StepStatus};
use quest_runner::run::{Phase, RunEvent, RunFailure, RunOutcome, RunRequest};
use quest_runner::test_support::{
    ScriptedRun, ScriptedSpawner, ScriptedWard, TestProject, quest_with_steps, step,
    step_with_status,
};

fn request(project: &TestProject, quest_path: &Path, slots: usize) -> RunRequest {
    RunRequest {
        project_path: project.root().to_path_buf(),
        quest_path: quest_path.to_path_buf(),
        slot_count: slots,
        timeout: Duration::from_secs(30),
        max_spirit_loop_iterations: 3,
        prompt_budget_bytes: 64 * 1024,
        ward_baseline: false,
    }
}

fn orchestrator(spawner: &Arc<ScriptedSpawner>, ward: &Arc<ScriptedWard>) -> Orchestrator {
    Orchestrator::new(
        spawner.clone(),
        ward.clone(),
        Arc::new(PromptRegistry::builtin()),
    )
}

fn failing(rule: &str, file: &str, message: &str) -> WardResult {
    WardResult::failing(vec![Diagnostic {
        file: Some(file.to_string()),
        line: Some(10),
        column: Some(5),
        severity: Severity::Error,
        rule: rule.to_string(),
        message: message.to_string(),
    }])
}

async fn run(
    orchestrator: &Orchestrator,
    request: &RunRequest,
) -> (anyhow::Result<RunOutcome>, Vec<RunEvent>) {
    let mut events = Vec::new();
    let outcome = orchestrator
        .run_quest(request, |event| events.push(event.clone()))
        .await;
    (outcome, events)
}

fn dispatches(events: &[RunEvent]) -> Vec<(String, u32)> {
    events
        .iter()
        .filter_map(|event| match event {
            RunEvent::StepDispatched { step_id, round, .. } => Some((step_id.clone(), *round)),
            _ => None,
        })
        .collect()
}

/// Verifies A, C run together in round one and B follows A in round two.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn independent_steps_share_the_first_round() {
    let project = TestProject::new();
    let path = project.write_quest(&quest_with_steps(
        "abc",
        vec![step("a", &[]), step("b", &["a"]), step("c", &[])],
    ));
    let spawner = Arc::new(
        ScriptedSpawner::new(&path)
            .on_step("a", ScriptedRun::ok().with_delay(Duration::from_millis(50)))
            .on_step("c", ScriptedRun::ok().with_delay(Duration::from_millis(10))),
    );
    let ward = Arc::new(ScriptedWard::passing());

    let (outcome, events) = run(&orchestrator(&spawner, &ward), &request(&project, &path, 2)).await;
    let outcome = outcome.expect("run");

    assert!(outcome.completed);
    assert_eq!(outcome.failure, None);
    assert_eq!(outcome.rounds, 2);
    assert_eq!(outcome.dispatches, 3);
    assert_eq!(
        dispatches(&events),
        vec![
            ("a".to_string(), 1),
            ("c".to_string(), 1),
            ("b".to_string(), 2)
        ]
    );
    assert_eq!(spawner.repair_calls(), 0);
    assert_eq!(ward.runs(), 1);

    let quest = load_quest(&path).expect("reload");
    assert_eq!(quest.status, QuestStatus::Complete);
    assert!(quest.all_steps_complete());
    for s in &quest.steps {
        assert!(s.started_at.is_some(), "{} has startedAt", s.id);
        assert!(s.completed_at.is_some(), "{} has completedAt", s.id);
    }
    assert_eq!(
        events.last(),
        Some(&RunEvent::PhaseChanged(Phase::Complete))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn roles_follow_step_types() {
    let project = TestProject::new();
    let mut discovery = step("explore", &[]);
    discovery.step_type = quest_runner::quest::StepType::Discovery;
    let mut testing = step("tests", &["explore"]);
    testing.step_type = quest_runner::quest::StepType::Testing;
    let path = project.write_quest(&quest_with_steps("roles", vec![discovery, testing]));
    let spawner = Arc::new(ScriptedSpawner::new(&path));
    let ward = Arc::new(ScriptedWard::passing());

    let (outcome, _) = run(&orchestrator(&spawner, &ward), &request(&project, &path, 1)).await;
    assert!(outcome.expect("run").completed);

    let roles: Vec<AgentRole> = spawner.calls().iter().map(|call| call.role).collect();
    assert_eq!(roles, vec![AgentRole::Pathseeker, AgentRole::Siegemaster]);
    let first = &spawner.calls()[0];
    assert!(first.prompt.contains("Step ID: explore"), "{}", first.prompt);
}

#[tokio::test]
async fn planning_quest_is_rejected_without_dispatch() {
    let project = TestProject::new();
    let mut quest = quest_with_steps("draft", vec![step("a", &[])]);
    quest.status = QuestStatus::RequirementsApproved;
    let path = project.write_quest(&quest);
    let spawner = Arc::new(ScriptedSpawner::new(&path));
    let ward = Arc::new(ScriptedWard::passing());

    let (outcome, events) = run(&orchestrator(&spawner, &ward), &request(&project, &path, 2)).await;
    let err = outcome.expect_err("not approved");

    assert_eq!(
        err.downcast_ref::<QuestError>(),
        Some(&QuestError::NotApproved {
            status: QuestStatus::RequirementsApproved
        })
    );
    assert!(events.is_empty());
    assert!(spawner.calls().is_empty());
    assert_eq!(
        load_quest(&path).expect("reload").status,
        QuestStatus::RequirementsApproved
    );
}

#[tokio::test]
async fn failed_quest_is_not_rerun() {
    let project = TestProject::new();
    let mut quest = quest_with_steps("done", vec![step_with_status("a", &[], StepStatus::Failed)]);
    quest.status = QuestStatus::Failed;
    let path = project.write_quest(&quest);
    let spawner = Arc::new(ScriptedSpawner::new(&path));
    let ward = Arc::new(ScriptedWard::passing());

    let (outcome, _) = run(&orchestrator(&spawner, &ward), &request(&project, &path, 1)).await;
    let err = outcome.expect_err("terminal quest");
    assert!(matches!(
        err.downcast_ref::<QuestError>(),
        Some(QuestError::InvalidTransition {
            from: QuestStatus::Failed,
            to: QuestStatus::InProgress
        })
    ));
    assert!(spawner.calls().is_empty());
}

/// Verifies a single failing gate is fixed by exactly one repair agent.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ward_failure_is_repaired_once() {
    let project = TestProject::new();
    let mut a = step("a", &[]);
    a.files_to_create = vec!["src/auth.ts".to_string()];
    let path = project.write_quest(&quest_with_steps("fix", vec![a]));
    let spawner = Arc::new(ScriptedSpawner::new(&path));
    let ward = Arc::new(ScriptedWard::new(vec![
        failing("TS7030", "src/auth.ts", "Missing return type"),
        WardResult::passing(),
    ]));

    let (outcome, events) = run(&orchestrator(&spawner, &ward), &request(&project, &path, 2)).await;
    let outcome = outcome.expect("run");

    assert!(outcome.completed);
    assert_eq!(outcome.repair_spawns, 1);
    assert_eq!(spawner.repair_calls(), 1);
    assert_eq!(ward.runs(), 2);
    assert_eq!(ward.scopes()[0], vec!["src/auth.ts".to_string()]);

    let repair = spawner
        .calls()
        .into_iter()
        .find(|call| call.role == AgentRole::Spiritmender)
        .expect("repair call");
    assert!(repair.prompt.contains("Missing return type"), "{}", repair.prompt);
    assert!(repair.prompt.contains("Repair attempt: 1 of 3"), "{}", repair.prompt);

    assert!(events.contains(&RunEvent::PhaseChanged(Phase::Repairing)));
    assert!(events.contains(&RunEvent::RepairAttempt { attempt: 1, max: 3 }));

    let folder = quest_folder(&path).expect("folder");
    let labels: Vec<String> = read_ward_records(folder)
        .expect("records")
        .into_iter()
        .map(|record| record.label)
        .collect();
    assert_eq!(labels, vec!["validation", "repair-1"]);
    assert_eq!(load_quest(&path).expect("reload").status, QuestStatus::Complete);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn repair_spawns_are_bounded() {
    let project = TestProject::new();
    let path = project.write_quest(&quest_with_steps("stuck", vec![step("a", &[])]));
    let spawner = Arc::new(ScriptedSpawner::new(&path));
    let ward = Arc::new(ScriptedWard::new(vec![failing(
        "TS2322",
        "src/a.ts",
        "Type 'string' is not assignable to type 'number'",
    )]));
    let mut req = request(&project, &path, 1);
    req.max_spirit_loop_iterations = 2;

    let (outcome, _) = run(&orchestrator(&spawner, &ward), &req).await;
    let outcome = outcome.expect("run");

    assert!(!outcome.completed);
    assert_eq!(spawner.repair_calls(), 2);
    assert_eq!(ward.runs(), 3);
    match outcome.failure {
        Some(RunFailure::RepairExhausted { iterations, last }) => {
            assert_eq!(iterations, 2);
            assert!(!last.passed);
            assert_eq!(last.diagnostics[0].rule, "TS2322");
        }
        other => panic!("unexpected failure: {:?}", other),
    }

    let quest = load_quest(&path).expect("reload");
    assert_eq!(quest.status, QuestStatus::Failed);
    assert!(
        quest
            .execution_log
            .iter()
            .any(|entry| entry.event == "quest_failed")
    );
}

#[tokio::test]
async fn zero_repair_budget_fails_on_first_gate() {
    let project = TestProject::new();
    let path = project.write_quest(&quest_with_steps("strict", vec![step("a", &[])]));
    let spawner = Arc::new(ScriptedSpawner::new(&path));
    let ward = Arc::new(ScriptedWard::new(vec![failing("lint/x", "src/a.ts", "bad")]));
    let mut req = request(&project, &path, 1);
    req.max_spirit_loop_iterations = 0;

    let (outcome, _) = run(&orchestrator(&spawner, &ward), &req).await;
    let outcome = outcome.expect("run");

    assert!(!outcome.completed);
    assert_eq!(spawner.repair_calls(), 0);
    assert_eq!(ward.runs(), 1);
    assert!(matches!(
        outcome.failure,
        Some(RunFailure::RepairExhausted { iterations: 0, .. })
    ));
}

/// Verifies no more steps are `in_progress` at once than there are slots.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn never_dispatches_beyond_slot_count() {
    let project = TestProject::new();
    let ids = ["s1", "s2", "s3", "s4", "s5", "s6"];
    let steps = ids.iter().map(|id| step(id, &[])).collect();
    let path = project.write_quest(&quest_with_steps("wide", steps));
    let mut spawner = ScriptedSpawner::new(&path);
    for id in ids {
        spawner = spawner.on_step(id, ScriptedRun::ok().with_delay(Duration::from_millis(20)));
    }
    let spawner = Arc::new(spawner);
    let ward = Arc::new(ScriptedWard::passing());

    let (outcome, events) = run(&orchestrator(&spawner, &ward), &request(&project, &path, 2)).await;
    let outcome = outcome.expect("run");

    assert!(outcome.completed);
    assert!(spawner.max_active() <= 2, "max active {}", spawner.max_active());
    assert!(
        spawner.max_in_progress() <= 2,
        "max in_progress {}",
        spawner.max_in_progress()
    );
    let first_round = dispatches(&events)
        .into_iter()
        .filter(|(_, round)| *round == 1)
        .count();
    assert_eq!(first_round, 2);
    assert_eq!(spawner.step_calls().len(), ids.len());
}

/// Verifies a failed step stalls its dependents while an unrelated branch
/// still runs to completion.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_step_stalls_only_its_dependents() {
    let project = TestProject::new();
    let path = project.write_quest(&quest_with_steps(
        "split",
        vec![
            step("a", &[]),
            step("b", &["a"]),
            step("c", &[]),
            step("d", &["c"]),
        ],
    ));
    let spawner = Arc::new(ScriptedSpawner::new(&path).on_step("a", ScriptedRun::exit(2)));
    let ward = Arc::new(ScriptedWard::passing());

    let (outcome, _) = run(&orchestrator(&spawner, &ward), &request(&project, &path, 2)).await;
    let outcome = outcome.expect("run");

    assert!(!outcome.completed);
    let Some(RunFailure::Stalled(report)) = outcome.failure else {
        panic!("expected stall, got {:?}", outcome.failure);
    };
    let first = report.first_failure().expect("first failure");
    assert_eq!(first.id, "a");
    assert_eq!(first.error_message.as_deref(), Some("agent exited with code 2"));
    assert_eq!(report.blocked, vec!["b".to_string()]);

    let quest = load_quest(&path).expect("reload");
    let status = |id: &str| quest.step(id).map(|s| s.status);
    assert_eq!(status("a"), Some(StepStatus::Failed));
    assert_eq!(status("b"), Some(StepStatus::Pending));
    assert_eq!(status("c"), Some(StepStatus::Complete));
    assert_eq!(status("d"), Some(StepStatus::Complete));
    assert_eq!(quest.status, QuestStatus::Failed);
    assert_eq!(ward.runs(), 0);
    assert!(!spawner.step_calls().contains(&"b".to_string()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn timeout_and_spawn_failure_fail_the_step() {
    let project = TestProject::new();
    let path = project.write_quest(&quest_with_steps(
        "slow",
        vec![step("slow", &[]), step("missing", &[]), step("fine", &[])],
    ));
    let spawner = Arc::new(
        ScriptedSpawner::new(&path)
            .on_step("slow", ScriptedRun::timed_out(Duration::from_millis(5)))
            .on_step(
                "missing",
                ScriptedRun {
                    exit: quest_runner::io::agent::AgentExit::SpawnFailed {
                        reason: "command 'claude' not found".to_string(),
                    },
                    ..ScriptedRun::ok()
                },
            ),
    );
    let ward = Arc::new(ScriptedWard::passing());

    let (outcome, _) = run(&orchestrator(&spawner, &ward), &request(&project, &path, 3)).await;
    assert!(!outcome.expect("run").completed);

    let quest = load_quest(&path).expect("reload");
    let slow = quest.step("slow").expect("slow");
    assert_eq!(slow.status, StepStatus::Failed);
    assert_eq!(slow.error_message.as_deref(), Some("agent timed out after 5ms"));
    let missing = quest.step("missing").expect("missing");
    assert_eq!(missing.status, StepStatus::Failed);
    assert!(
        missing
            .error_message
            .as_deref()
            .is_some_and(|m| m.contains("not found"))
    );
    assert_eq!(
        quest.step("fine").map(|s| s.status),
        Some(StepStatus::Complete)
    );
}

/// Verifies a status the agent wrote itself wins over its exit code.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn status_written_by_agent_is_kept() {
    let project = TestProject::new();
    let path = project.write_quest(&quest_with_steps(
        "self",
        vec![step("a", &[]), step("b", &["a"])],
    ));
    let spawner = Arc::new(
        ScriptedSpawner::new(&path)
            .on_step("a", ScriptedRun::exit(1).marking(StepStatus::Complete))
            .on_step("b", ScriptedRun::ok().marking(StepStatus::Failed)),
    );
    let ward = Arc::new(ScriptedWard::passing());

    let (outcome, _) = run(&orchestrator(&spawner, &ward), &request(&project, &path, 1)).await;
    let outcome = outcome.expect("run");

    assert!(!outcome.completed);
    let quest = load_quest(&path).expect("reload");
    assert_eq!(quest.step("a").map(|s| s.status), Some(StepStatus::Complete));
    assert_eq!(quest.step("b").map(|s| s.status), Some(StepStatus::Failed));
    let reconciled = quest
        .execution_log
        .iter()
        .filter(|entry| entry.event == "step_reconciled")
        .count();
    assert_eq!(reconciled, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn baseline_rules_do_not_block_completion() {
    let project = TestProject::new();
    let path = project.write_quest(&quest_with_steps("legacy", vec![step("a", &[])]));
    let spawner = Arc::new(ScriptedSpawner::new(&path));
    let ward = Arc::new(ScriptedWard::new(vec![
        failing("lint/no-any", "src/old.ts", "Unexpected any"),
        failing("lint/no-any", "src/new.ts", "Unexpected any"),
    ]));
    let mut req = request(&project, &path, 1);
    req.ward_baseline = true;

    let (outcome, _) = run(&orchestrator(&spawner, &ward), &req).await;
    let outcome = outcome.expect("run");

    assert!(outcome.completed);
    assert_eq!(spawner.repair_calls(), 0);
    assert_eq!(ward.runs(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn new_rules_against_baseline_trigger_repair() {
    let project = TestProject::new();
    let path = project.write_quest(&quest_with_steps("regress", vec![step("a", &[])]));
    let spawner = Arc::new(ScriptedSpawner::new(&path));
    let ward = Arc::new(ScriptedWard::new(vec![
        failing("lint/no-any", "src/old.ts", "Unexpected any"),
        failing("TS2322", "src/new.ts", "Type mismatch"),
        failing("lint/no-any", "src/old.ts", "Unexpected any"),
    ]));
    let mut req = request(&project, &path, 1);
    req.ward_baseline = true;

    let (outcome, _) = run(&orchestrator(&spawner, &ward), &req).await;
    let outcome = outcome.expect("run");

    assert!(outcome.completed);
    assert_eq!(outcome.repair_spawns, 1);
}

/// Verifies a quest interrupted mid-run resumes with its orphaned step reset.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn interrupted_quest_resumes() {
    let project = TestProject::new();
    let mut quest = quest_with_steps(
        "resume",
        vec![
            step_with_status("a", &[], StepStatus::Complete),
            step_with_status("b", &["a"], StepStatus::InProgress),
            step("c", &["b"]),
        ],
    );
    quest.status = QuestStatus::InProgress;
    let path = project.write_quest(&quest);
    let spawner = Arc::new(ScriptedSpawner::new(&path));
    let ward = Arc::new(ScriptedWard::passing());

    let (outcome, _) = run(&orchestrator(&spawner, &ward), &request(&project, &path, 2)).await;
    assert!(outcome.expect("run").completed);

    assert_eq!(spawner.step_calls(), vec!["b".to_string(), "c".to_string()]);
    let quest = load_quest(&path).expect("reload");
    assert!(
        quest
            .execution_log
            .iter()
            .any(|entry| entry.event == "step_reset" && entry.step_id.as_deref() == Some("b"))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn execution_log_records_the_run() {
    let project = TestProject::new();
    let path = project.write_quest(&quest_with_steps("logged", vec![step("a", &[])]));
    let spawner = Arc::new(ScriptedSpawner::new(&path));
    let ward = Arc::new(ScriptedWard::passing());

    let (outcome, _) = run(&orchestrator(&spawner, &ward), &request(&project, &path, 1)).await;
    assert!(outcome.expect("run").completed);

    let events: Vec<String> = load_quest(&path)
        .expect("reload")
        .execution_log
        .into_iter()
        .map(|entry| entry.event)
        .collect();
    assert_eq!(
        events,
        vec![
            "quest_started",
            "step_dispatched",
            "step_complete",
            "ward_run",
            "quest_complete"
        ]
    );
}
