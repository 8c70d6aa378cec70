//! End-to-end runs under each distribution policy.

use std::time::Duration;

use conductor::orchestration::{DistributionPolicy, RunOptions, RunOutcome};
use conductor::plan::Plan;
use conductor::session::{Session, SessionState};

use super::fixtures::{fast_config, plan_with_steps, surface_for, ScriptedSurface, TestEnv};

const RUN_TIMEOUT: Duration = Duration::from_secs(10);

fn step_ids(session: &Session) -> Vec<usize> {
    session.assigned_steps().iter().map(|s| s.id).collect()
}

fn options(env: &TestEnv, agents: usize, policy: DistributionPolicy) -> RunOptions {
    RunOptions {
        agents,
        policy,
        project_dir: env.project_dir(),
    }
}

/// Test: Three steps over three sessions
/// Given a 3-step plan and 3 sequential sessions
/// When the run completes
/// Then each session completed exactly one step, in creation order
#[tokio::test]
async fn test_three_steps_three_sessions_sequential() {
    let env = TestEnv::new();
    let surface = ScriptedSurface::new();
    let run = env
        .orchestrator
        .start(
            plan_with_steps(3),
            options(&env, 3, DistributionPolicy::Sequential),
            surface_for(&surface),
        )
        .await
        .unwrap();

    let report = tokio::time::timeout(RUN_TIMEOUT, run.drive())
        .await
        .expect("run should finish")
        .unwrap();
    assert_eq!(report.outcome, RunOutcome::Succeeded);

    let sessions = env.store.list_run(report.run_id).await.unwrap();
    assert_eq!(sessions.len(), 3);
    for (slot, session) in sessions.iter().enumerate() {
        assert_eq!(session.state(), SessionState::Completed);
        assert_eq!(step_ids(session), vec![slot]);
        assert_eq!(session.current_step_index(), 0);

        let sent = surface.sent(&session.label);
        assert_eq!(sent.len(), 2, "initial instruction plus one step");
        assert!(sent[0].starts_with("Build the project"));
        assert!(sent[0].contains("team of 3 AI agents"));
        assert!(sent[1].contains(&format!("Step {}: Task number {}", slot + 1, slot + 1)));
        assert!(sent[1].contains(&format!("[Session ID: {}]", session.id)));
    }

    let completed = std::fs::read_to_string(env.store.completed_log_path(report.run_id)).unwrap();
    assert_eq!(completed.lines().count(), 3);
}

/// Test: Session lifecycle is recorded in order
#[tokio::test]
async fn test_history_records_full_lifecycle() {
    use SessionState::*;
    let env = TestEnv::new();
    let surface = ScriptedSurface::new();
    let run = env
        .orchestrator
        .start(
            plan_with_steps(1),
            options(&env, 1, DistributionPolicy::Sequential),
            surface_for(&surface),
        )
        .await
        .unwrap();
    let report = tokio::time::timeout(RUN_TIMEOUT, run.drive()).await.unwrap().unwrap();

    let session = env.store.get(report.sessions[0].id).await.unwrap();
    let states: Vec<SessionState> = session.history().iter().map(|e| e.to).collect();
    assert_eq!(
        states,
        vec![Launching, AwaitingInput, Active, Idle, Advancing, AwaitingInput, Active, Idle, Completed]
    );
}

/// Test: Bundled distribution
/// Given 5 steps, 2 sessions and bundles of 2
/// When the run completes
/// Then 3 contiguous bundles were handed out covering every step once
#[tokio::test]
async fn test_bundled_distribution_covers_plan_in_order() {
    let env = TestEnv::new();
    let surface = ScriptedSurface::new();
    let run = env
        .orchestrator
        .start(
            plan_with_steps(5),
            options(&env, 2, DistributionPolicy::Bundled(2)),
            surface_for(&surface),
        )
        .await
        .unwrap();
    let report = tokio::time::timeout(RUN_TIMEOUT, run.drive()).await.unwrap().unwrap();
    assert_eq!(report.outcome, RunOutcome::Succeeded);

    let sessions = env.store.list_run(report.run_id).await.unwrap();
    assert_eq!(&step_ids(&sessions[0])[..2], &[0, 1]);
    assert_eq!(&step_ids(&sessions[1])[..2], &[2, 3]);

    let mut all: Vec<usize> = sessions.iter().flat_map(step_ids).collect();
    all.sort();
    assert_eq!(all, vec![0, 1, 2, 3, 4]);

    let bundle_messages: usize = sessions
        .iter()
        .map(|s| {
            surface
                .sent(&s.label)
                .iter()
                .filter(|m| m.contains("following related steps"))
                .count()
        })
        .sum();
    assert_eq!(bundle_messages, 2, "the final bundle holds a single step");

    for session in &sessions {
        assert_eq!(
            session.current_step_index(),
            session.assigned_steps().len() as i64 - 1
        );
    }
}

/// Test: More sessions than steps
/// Sessions without work complete once their initial instruction settles.
#[tokio::test]
async fn test_more_sessions_than_steps() {
    let env = TestEnv::new();
    let surface = ScriptedSurface::new();
    let run = env
        .orchestrator
        .start(
            plan_with_steps(1),
            options(&env, 3, DistributionPolicy::Sequential),
            surface_for(&surface),
        )
        .await
        .unwrap();
    let report = tokio::time::timeout(RUN_TIMEOUT, run.drive()).await.unwrap().unwrap();
    assert_eq!(report.outcome, RunOutcome::Succeeded);

    let assigned: Vec<usize> = report.sessions.iter().map(|s| s.assigned_steps).collect();
    assert_eq!(assigned, vec![1, 0, 0]);
    assert_eq!(surface.sent("agent-2").len(), 1);
}

/// Test: Collaborative distribution
/// Every session receives the whole plan in its initial instruction.
#[tokio::test]
async fn test_collaborative_sends_whole_plan_once() {
    let env = TestEnv::new();
    let surface = ScriptedSurface::new();
    let run = env
        .orchestrator
        .start(
            plan_with_steps(3),
            options(&env, 2, DistributionPolicy::Collaborative),
            surface_for(&surface),
        )
        .await
        .unwrap();
    let report = tokio::time::timeout(RUN_TIMEOUT, run.drive()).await.unwrap().unwrap();
    assert_eq!(report.outcome, RunOutcome::Succeeded);

    for session in env.store.list_run(report.run_id).await.unwrap() {
        assert_eq!(step_ids(&session), vec![0, 1, 2]);
        assert_eq!(session.current_step_index(), 2);
        let sent = surface.sent(&session.label);
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("COMPLETE PROJECT STEPS"));
        assert!(sent[0].contains("Step 3: Task number 3"));
    }
}

/// Test: A plan with only an instruction
#[tokio::test]
async fn test_instruction_only_plan() {
    let env = TestEnv::new();
    let surface = ScriptedSurface::new();
    let plan = Plan::new("Refactor the parser", vec![]).unwrap();
    let run = env
        .orchestrator
        .start(plan, options(&env, 1, DistributionPolicy::Sequential), surface_for(&surface))
        .await
        .unwrap();
    let report = tokio::time::timeout(RUN_TIMEOUT, run.drive()).await.unwrap().unwrap();

    assert_eq!(report.outcome, RunOutcome::Succeeded);
    assert_eq!(surface.sent("agent-0").len(), 1);
    assert_eq!(report.sessions[0].current_step_index, -1);
}

/// Test: Invalid run parameters fail before anything is persisted
#[tokio::test]
async fn test_invalid_run_parameters() {
    let env = TestEnv::new();
    let surface = ScriptedSurface::new();

    for (agents, policy) in [
        (0, DistributionPolicy::Sequential),
        (21, DistributionPolicy::Sequential),
        (2, DistributionPolicy::Bundled(0)),
    ] {
        let result = env
            .orchestrator
            .start(plan_with_steps(2), options(&env, agents, policy), surface_for(&surface))
            .await;
        assert!(result.is_err(), "agents={} policy={}", agents, policy);
    }
    assert!(env.store.list_runs().await.unwrap().is_empty());
    assert!(env.store.list().await.unwrap().is_empty());
}

/// Test: A silent agent still gets the full quiet interval after each send
/// Given an agent whose pane never echoes the text it is sent
/// When the run dispatches the initial instruction and three steps
/// Then no session goes idle sooner than the quiet interval after a send
#[tokio::test]
async fn test_quiet_interval_restarts_after_each_send() {
    let mut config = fast_config();
    config.timing.quiet_interval_ms = 300;
    let env = TestEnv::with_config(config);
    let surface = ScriptedSurface::new();
    surface.set_silent(true);

    let run = env
        .orchestrator
        .start(
            plan_with_steps(3),
            options(&env, 1, DistributionPolicy::Sequential),
            surface_for(&surface),
        )
        .await
        .unwrap();
    let run_id = run.id();
    let report = tokio::time::timeout(RUN_TIMEOUT, run.drive()).await.unwrap().unwrap();
    assert_eq!(report.outcome, RunOutcome::Succeeded);
    assert_eq!(surface.sent("agent-0").len(), 4);
    assert_eq!(report.sessions[0].current_step.as_deref(), Some("Task number 3"));

    let session = env.store.list_run(run_id).await.unwrap().remove(0);
    let history = session.history();
    let mut sends = 0;
    for (i, event) in history.iter().enumerate() {
        let is_send = event.note.starts_with("dispatched")
            || event.note == "initial instruction delivered";
        if !is_send {
            continue;
        }
        sends += 1;
        let idle = history[i..]
            .iter()
            .find(|e| e.to == SessionState::Idle && e.from != SessionState::Idle)
            .expect("session goes idle after every send");
        let waited = (idle.timestamp - event.timestamp).num_milliseconds();
        assert!(
            waited >= 280,
            "went idle {}ms after '{}'",
            waited,
            event.note
        );
    }
    assert_eq!(sends, 4);
}
