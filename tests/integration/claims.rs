//! Claim requests from agents, refusals and stale-claim recovery.

use std::path::Path;
use std::time::{Duration, Instant};

use conductor::orchestration::{DistributionPolicy, RunOptions, RunOutcome};
use conductor::session::SessionState;

use super::fixtures::{
    fast_config, plan_with_steps, read_claims, request_claim, surface_for, ScriptedSurface,
    TestEnv,
};

const RUN_TIMEOUT: Duration = Duration::from_secs(10);

async fn wait_until<F: Fn() -> bool>(what: &str, check: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn owner_of(claims_path: &Path, resource: &str) -> Option<String> {
    read_claims(claims_path)
        .into_iter()
        .find(|(key, _)| key == resource)
        .map(|(_, owner)| owner)
}

/// Test: Refusal, then stale-claim recovery
/// Given s1 holding a claim that s2 also requests
/// When s1's pane dies and s1 fails
/// Then s2's next request succeeds without an explicit release
#[tokio::test]
async fn test_stale_claim_released_when_owner_fails() {
    let env = TestEnv::new();
    let surface = ScriptedSurface::new();
    surface.set_churn(true);

    let run = env
        .orchestrator
        .start(
            plan_with_steps(4),
            RunOptions {
                agents: 2,
                policy: DistributionPolicy::Sequential,
                project_dir: env.project_dir(),
            },
            surface_for(&surface),
        )
        .await
        .unwrap();
    let run_id = run.id();
    let claims_path = env.claims_path(run.record());
    let inbox = env.store.claim_requests_dir(run_id);
    let driving = tokio::spawn(run.drive());

    let sessions = env.store.list_run(run_id).await.unwrap();
    let (s1, s2) = (sessions[0].clone(), sessions[1].clone());
    let s1_id = s1.id.to_string();
    let s2_id = s2.id.to_string();

    request_claim(&inbox, 1, &s1_id, "acquire", "db/schema.sql");
    wait_until("s1 claim", || {
        owner_of(&claims_path, "db/schema.sql").as_deref() == Some(s1_id.as_str())
    })
    .await;

    // Short ids are accepted too.
    request_claim(&inbox, 2, &s2.id.short(), "acquire", "db/schema.sql");
    wait_until("inbox drained", || {
        std::fs::read_dir(&inbox).map(|d| d.count() == 0).unwrap_or(false)
    })
    .await;
    assert_eq!(owner_of(&claims_path, "db/schema.sql"), Some(s1_id.clone()));

    wait_until("s1 pane up", || surface.is_alive(&s1.label)).await;
    surface.kill(&s1.label);
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let state = env.store.get(s1.id).await.unwrap().state();
        if state == SessionState::Failed {
            break;
        }
        assert!(Instant::now() < deadline, "s1 never failed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    request_claim(&inbox, 3, &s2_id, "acquire", "db/schema.sql");
    wait_until("s2 claim", || {
        owner_of(&claims_path, "db/schema.sql").as_deref() == Some(s2_id.as_str())
    })
    .await;

    surface.set_churn(false);
    let report = tokio::time::timeout(RUN_TIMEOUT, driving)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(
        report.outcome,
        RunOutcome::PartialSuccess {
            completed: 1,
            failed: 1
        }
    );
    assert!(read_claims(&claims_path).is_empty());

    let delivered = surface.sent(&s2.label);
    assert!(
        delivered
            .iter()
            .any(|m| m.starts_with("Coordinator notices:") && m.contains("already claimed")),
        "refusal should reach s2 with its next step"
    );
}

/// Test: Release by a non-owner is refused and reported
#[tokio::test]
async fn test_release_by_non_owner_is_reported() {
    let env = TestEnv::new();
    let surface = ScriptedSurface::new();
    surface.set_churn(true);

    let run = env
        .orchestrator
        .start(
            plan_with_steps(2),
            RunOptions {
                agents: 2,
                policy: DistributionPolicy::Collaborative,
                project_dir: env.project_dir(),
            },
            surface_for(&surface),
        )
        .await
        .unwrap();
    let run_id = run.id();
    let claims_path = env.claims_path(run.record());
    let inbox = env.store.claim_requests_dir(run_id);
    let driving = tokio::spawn(run.drive());

    let sessions = env.store.list_run(run_id).await.unwrap();
    let s1_id = sessions[0].id.to_string();
    let s2_id = sessions[1].id.to_string();

    request_claim(&inbox, 1, &s1_id, "acquire", "README.md");
    request_claim(&inbox, 2, &s2_id, "release", "README.md");
    request_claim(&inbox, 3, "not-a-session", "acquire", "README.md");
    wait_until("inbox drained", || {
        std::fs::read_dir(&inbox).map(|d| d.count() == 0).unwrap_or(false)
    })
    .await;
    assert_eq!(owner_of(&claims_path, "README.md"), Some(s1_id.clone()));

    request_claim(&inbox, 4, &s1_id, "release", "README.md");
    wait_until("release", || read_claims(&claims_path).is_empty()).await;

    surface.set_churn(false);
    let report = tokio::time::timeout(RUN_TIMEOUT, driving)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(report.outcome, RunOutcome::Succeeded);

    let delivered = surface.sent(&sessions[1].label);
    assert!(
        delivered
            .iter()
            .any(|m| m.starts_with("Coordinator notices:") && m.contains("does not own")),
        "s2 should hear that its release was refused"
    );
}

/// Test: Refusals reach collaborative sessions
/// Given two collaborative sessions that already hold every step
/// When s2 requests a resource s1 has claimed
/// Then s2 is told about the refusal before it completes
#[tokio::test]
async fn test_collaborative_refusal_is_delivered() {
    let env = TestEnv::new();
    let surface = ScriptedSurface::new();
    surface.set_churn(true);

    let run = env
        .orchestrator
        .start(
            plan_with_steps(3),
            RunOptions {
                agents: 2,
                policy: DistributionPolicy::Collaborative,
                project_dir: env.project_dir(),
            },
            surface_for(&surface),
        )
        .await
        .unwrap();
    let run_id = run.id();
    let claims_path = env.claims_path(run.record());
    let inbox = env.store.claim_requests_dir(run_id);
    let driving = tokio::spawn(run.drive());

    let sessions = env.store.list_run(run_id).await.unwrap();
    let s1_id = sessions[0].id.to_string();
    let s2_id = sessions[1].id.to_string();

    request_claim(&inbox, 1, &s1_id, "acquire", "db.sql");
    wait_until("s1 claim", || {
        owner_of(&claims_path, "db.sql").as_deref() == Some(s1_id.as_str())
    })
    .await;
    request_claim(&inbox, 2, &s2_id, "acquire", "db.sql");
    wait_until("inbox drained", || {
        std::fs::read_dir(&inbox).map(|d| d.count() == 0).unwrap_or(false)
    })
    .await;

    let status = env.orchestrator.status(run_id).await.unwrap();
    assert_eq!(status[0].claims, vec!["db.sql".to_string()]);
    assert!(status[1].claims.is_empty());

    surface.set_churn(false);
    let report = tokio::time::timeout(RUN_TIMEOUT, driving)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(report.outcome, RunOutcome::Succeeded);

    let delivered = surface.sent(&sessions[1].label);
    let notice = delivered
        .iter()
        .find(|m| m.starts_with("Coordinator notices:"))
        .expect("s2 receives a notice message");
    assert!(notice.contains("already claimed"));
    assert!(surface
        .sent(&sessions[0].label)
        .iter()
        .all(|m| !m.starts_with("Coordinator notices:")));

    let s2 = env.store.get(sessions[1].id).await.unwrap();
    assert_eq!(s2.state(), SessionState::Completed);
    assert!(s2.history().iter().any(|e| e.note == "delivered 1 notice(s)"));
}

/// Test: A refusal after the last step still reaches the agent
/// Given two sequential sessions with one step each
/// When s2 is refused a claim after its only step was dispatched
/// Then s2 gets a notice message instead of completing silently
#[tokio::test]
async fn test_refusal_after_last_step_is_delivered() {
    let mut config = fast_config();
    config.timing.quiet_interval_ms = 600;
    let env = TestEnv::with_config(config);
    let surface = ScriptedSurface::new();

    let run = env
        .orchestrator
        .start(
            plan_with_steps(2),
            RunOptions {
                agents: 2,
                policy: DistributionPolicy::Sequential,
                project_dir: env.project_dir(),
            },
            surface_for(&surface),
        )
        .await
        .unwrap();
    let run_id = run.id();
    let claims_path = env.claims_path(run.record());
    let inbox = env.store.claim_requests_dir(run_id);
    let driving = tokio::spawn(run.drive());

    let sessions = env.store.list_run(run_id).await.unwrap();
    let s1_id = sessions[0].id.to_string();
    let s2_id = sessions[1].id.to_string();
    let s2_label = sessions[1].label.clone();

    request_claim(&inbox, 1, &s1_id, "acquire", "db.sql");
    wait_until("s1 claim", || {
        owner_of(&claims_path, "db.sql").as_deref() == Some(s1_id.as_str())
    })
    .await;

    wait_until("s2 step dispatched", || surface.sent(&s2_label).len() == 2).await;
    request_claim(&inbox, 2, &s2_id, "acquire", "db.sql");

    let report = tokio::time::timeout(RUN_TIMEOUT, driving)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(report.outcome, RunOutcome::Succeeded);

    let delivered = surface.sent(&s2_label);
    assert_eq!(delivered.len(), 3);
    assert!(delivered[1].starts_with("Step 2:"));
    assert!(delivered[2].starts_with("Coordinator notices:"));
    assert!(delivered[2].contains("already claimed"));
}
