//! Cancellation through the run token and through the cancel marker.

use std::time::{Duration, Instant};

use conductor::orchestration::{DistributionPolicy, RunOptions, RunOutcome};
use conductor::session::{RunId, SessionState};
use conductor::state::SessionStore;

use super::fixtures::{
    fast_config, plan_with_steps, read_claims, request_claim, surface_for, ExitBehavior,
    ScriptedSurface, TestEnv,
};

const RUN_TIMEOUT: Duration = Duration::from_secs(10);

fn options(env: &TestEnv, agents: usize) -> RunOptions {
    RunOptions {
        agents,
        policy: DistributionPolicy::Sequential,
        project_dir: env.project_dir(),
    }
}

/// Wait until every session of the run is `Active`.
async fn wait_all_active(store: &SessionStore, run_id: RunId) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let sessions = store.list_run(run_id).await.unwrap();
        if sessions.iter().all(|s| s.state() == SessionState::Active) {
            return;
        }
        assert!(Instant::now() < deadline, "sessions never became active");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Test: Cancellation mid-run
/// Given two Active sessions, one holding a claim
/// When the run token is cancelled
/// Then both end Cancelled within the force-terminate timeout and no claims remain
#[tokio::test]
async fn test_cancel_mid_run_releases_claims() {
    let env = TestEnv::new();
    let surface = ScriptedSurface::new();
    surface.set_churn(true);

    let run = env
        .orchestrator
        .start(plan_with_steps(4), options(&env, 2), surface_for(&surface))
        .await
        .unwrap();
    let run_id = run.id();
    let record = run.record().clone();
    let token = run.cancellation_token();
    let driving = tokio::spawn(run.drive());

    wait_all_active(&env.store, run_id).await;
    let sessions = env.store.list_run(run_id).await.unwrap();
    let owner = sessions[0].id.to_string();
    request_claim(&env.store.claim_requests_dir(run_id), 1, &owner, "acquire", "src/lib.rs");
    let claims_path = env.claims_path(&record);
    let deadline = Instant::now() + Duration::from_secs(5);
    while read_claims(&claims_path).is_empty() {
        assert!(Instant::now() < deadline, "claim was never granted");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(read_claims(&claims_path), vec![("src/lib.rs".to_string(), owner)]);

    let cancelled_at = Instant::now();
    token.cancel();
    let report = tokio::time::timeout(RUN_TIMEOUT, driving)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let timeout = fast_config().timing.cancel_timeout();
    assert!(cancelled_at.elapsed() < timeout + Duration::from_secs(1));

    assert_eq!(report.outcome, RunOutcome::Cancelled);
    for session in env.store.list_run(run_id).await.unwrap() {
        assert_eq!(session.state(), SessionState::Cancelled);
        assert!(!surface.is_alive(&session.label));
        assert!(session.history().iter().any(|e| e.note == "surface destroyed"));
    }
    assert!(read_claims(&claims_path).is_empty());
}

/// Test: Agents that obey the exit command are not force-killed
#[tokio::test]
async fn test_cancel_graceful_exit() {
    let env = TestEnv::new();
    let surface = ScriptedSurface::with_exit(ExitBehavior::Obeys);
    surface.set_churn(true);

    let run = env
        .orchestrator
        .start(plan_with_steps(1), options(&env, 1), surface_for(&surface))
        .await
        .unwrap();
    let run_id = run.id();
    let token = run.cancellation_token();
    let driving = tokio::spawn(run.drive());

    wait_all_active(&env.store, run_id).await;
    token.cancel();
    let report = tokio::time::timeout(RUN_TIMEOUT, driving).await.unwrap().unwrap().unwrap();
    assert_eq!(report.outcome, RunOutcome::Cancelled);

    let session = env.store.get(report.sessions[0].id).await.unwrap();
    assert_eq!(surface.sent("agent-0").last().map(String::as_str), Some("/exit"));
    assert!(session
        .history()
        .iter()
        .any(|e| e.note == "surface exited on request"));
}

/// Test: Agents that ignore the exit command are force-killed after the timeout
#[tokio::test]
async fn test_cancel_forced_termination() {
    let env = TestEnv::new();
    let surface = ScriptedSurface::with_exit(ExitBehavior::Ignores);
    surface.set_churn(true);

    let run = env
        .orchestrator
        .start(plan_with_steps(1), options(&env, 1), surface_for(&surface))
        .await
        .unwrap();
    let run_id = run.id();
    let token = run.cancellation_token();
    let driving = tokio::spawn(run.drive());

    wait_all_active(&env.store, run_id).await;
    token.cancel();
    let report = tokio::time::timeout(RUN_TIMEOUT, driving).await.unwrap().unwrap().unwrap();

    let session = env.store.get(report.sessions[0].id).await.unwrap();
    assert_eq!(session.state(), SessionState::Cancelled);
    assert!(!surface.is_alive("agent-0"));
    assert!(session
        .history()
        .iter()
        .any(|e| e.note.starts_with("forced termination after")));
}

/// Test: Cancel marker written by another process stops the run
#[tokio::test]
async fn test_cancel_marker_stops_run() {
    let env = TestEnv::new();
    let surface = ScriptedSurface::new();
    surface.set_churn(true);

    let run = env
        .orchestrator
        .start(plan_with_steps(2), options(&env, 2), surface_for(&surface))
        .await
        .unwrap();
    let run_id = run.id();
    let driving = tokio::spawn(run.drive());

    wait_all_active(&env.store, run_id).await;
    env.orchestrator.cancel(run_id).await.unwrap();

    let report = tokio::time::timeout(RUN_TIMEOUT, driving).await.unwrap().unwrap().unwrap();
    assert_eq!(report.outcome, RunOutcome::Cancelled);
    assert!(report
        .sessions
        .iter()
        .all(|s| s.state == SessionState::Cancelled));
    assert!(!env.store.cancel_requested(run_id));
}

/// Test: Cancelling before any session launched
#[tokio::test]
async fn test_cancel_before_launch() {
    let env = TestEnv::new();
    let surface = ScriptedSurface::new();
    let run = env
        .orchestrator
        .start(plan_with_steps(2), options(&env, 2), surface_for(&surface))
        .await
        .unwrap();
    run.cancellation_token().cancel();

    let report = tokio::time::timeout(RUN_TIMEOUT, run.drive()).await.unwrap().unwrap();
    assert_eq!(report.outcome, RunOutcome::Cancelled);
    assert!(surface.sent("agent-0").is_empty());
    assert!(!surface.is_alive("agent-1"));
}

/// Test: Cancelling while a surface is being created
/// Given a surface whose create takes 300ms
/// When the run is cancelled 50ms into the launch
/// Then the pane that finishes creating is recorded and torn down
#[tokio::test]
async fn test_cancel_during_slow_launch_destroys_pane() {
    let env = TestEnv::new();
    let surface = ScriptedSurface::new();
    surface.set_create_delay(Duration::from_millis(300));

    let run = env
        .orchestrator
        .start(plan_with_steps(1), options(&env, 1), surface_for(&surface))
        .await
        .unwrap();
    let token = run.cancellation_token();
    let driving = tokio::spawn(run.drive());

    tokio::time::sleep(Duration::from_millis(50)).await;
    token.cancel();
    let report = tokio::time::timeout(RUN_TIMEOUT, driving).await.unwrap().unwrap().unwrap();
    assert_eq!(report.outcome, RunOutcome::Cancelled);

    let session = env.store.get(report.sessions[0].id).await.unwrap();
    assert_eq!(session.state(), SessionState::Cancelled);
    assert!(session.surface.is_some(), "created pane must be recorded");
    assert!(!surface.is_alive("agent-0"));
    assert!(session.history().iter().any(|e| e.note == "surface destroyed"));
}
