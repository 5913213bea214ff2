//! Requires `CONTROL_DATABASE_URL`. Covers the `merge_gate_recheck_required`
//! config knob (§6): with it enabled, an approved run with no recorded
//! checks can never reach `merged`; with it disabled, the gate skips the
//! recheck step entirely and proceeds straight to merge.

use std::sync::Arc;
use std::time::Duration;

use control_capabilities::GitDriver;
use control_deploy::{GateOutcome, MergeDeployGate};
use control_leases::SlotLeaseManager;
use control_schemas::{FailureReasonCode, RunStatus, RunId};
use control_testkit::{FakeDeployDriver, FakeGitDriver};
use control_worktree::WorktreeManager;

async fn insert_run(pool: &sqlx::PgPool, run_id: &RunId) {
    control_db::runs::insert_run(
        pool,
        &control_db::runs::NewRun {
            run_id: run_id.clone(),
            title: None,
            prompt: "p".to_string(),
            route: "/".to_string(),
            parent_run_id: None,
            created_by: None,
            page_title: None,
            element_hint: None,
            note: None,
            trace_id: None,
        },
    )
    .await
    .unwrap();
}

async fn approve_run_with_no_checks(pool: &sqlx::PgPool, run_id: &RunId, slot_id: &str, git: &Arc<dyn GitDriver>) {
    let branch_name = run_id.branch_name();
    let worktree_path = format!("/srv/worktrees/{slot_id}");
    git.create_worktree(&branch_name, &worktree_path).await.unwrap();
    let commit_sha = FakeGitDriver::commit_for(&branch_name);

    control_db::runs::set_allocation_fields(pool, run_id, Some(slot_id), Some(branch_name.as_str()), Some(&worktree_path))
        .await
        .unwrap();
    control_db::runs::set_commit_sha(pool, run_id, &commit_sha).await.unwrap();

    let leases = SlotLeaseManager::new(pool.clone(), vec![slot_id.to_string()], 1800);
    leases.acquire(run_id, false).await.unwrap();

    for to in [
        RunStatus::Planning,
        RunStatus::Editing,
        RunStatus::Testing,
        RunStatus::PreviewReady,
        RunStatus::NeedsApproval,
        RunStatus::Approved,
    ] {
        control_db::runs::transition(pool, run_id, to, None, None).await.unwrap();
    }
}

#[tokio::test]
#[ignore = "requires CONTROL_DATABASE_URL"]
async fn recheck_required_fails_an_approved_run_with_no_checks() {
    let pool = control_db::testkit_db_pool().await.unwrap();
    let slots = vec!["preview-1".to_string()];
    control_db::ensure_slots(&pool, &slots).await.unwrap();

    let run_id = RunId::parse("RECHECKREQ").unwrap();
    insert_run(&pool, &run_id).await;

    let git: Arc<dyn GitDriver> = Arc::new(FakeGitDriver::new());
    approve_run_with_no_checks(&pool, &run_id, "preview-1", &git).await;

    let worktrees = WorktreeManager::new(pool.clone(), git.clone(), "/srv/worktrees".to_string());
    let gate = MergeDeployGate::new(
        pool.clone(),
        git,
        Arc::new(FakeDeployDriver::new()),
        worktrees,
        SlotLeaseManager::new(pool.clone(), slots.clone(), 1800),
        Duration::from_secs(5),
        true,
    );

    let outcome = gate.finalize(&run_id).await.unwrap();
    match outcome {
        GateOutcome::Failed { reason, .. } => assert_eq!(reason, FailureReasonCode::ChecksFailed),
        GateOutcome::Deployed { .. } => panic!("expected Failed, got Deployed"),
    }
}

#[tokio::test]
#[ignore = "requires CONTROL_DATABASE_URL"]
async fn recheck_disabled_lets_an_approved_run_with_no_checks_deploy() {
    let pool = control_db::testkit_db_pool().await.unwrap();
    let slots = vec!["preview-1".to_string()];
    control_db::ensure_slots(&pool, &slots).await.unwrap();

    let run_id = RunId::parse("RECHECKOFF").unwrap();
    insert_run(&pool, &run_id).await;

    let git: Arc<dyn GitDriver> = Arc::new(FakeGitDriver::new());
    approve_run_with_no_checks(&pool, &run_id, "preview-1", &git).await;

    let worktrees = WorktreeManager::new(pool.clone(), git.clone(), "/srv/worktrees".to_string());
    let gate = MergeDeployGate::new(
        pool.clone(),
        git,
        Arc::new(FakeDeployDriver::new()),
        worktrees,
        SlotLeaseManager::new(pool.clone(), slots.clone(), 1800),
        Duration::from_secs(5),
        false,
    );

    let outcome = gate.finalize(&run_id).await.unwrap();
    match outcome {
        GateOutcome::Deployed { release_id } => assert!(!release_id.is_empty()),
        GateOutcome::Failed { reason, detail } => panic!("expected Deployed, got Failed({reason:?}): {detail}"),
    }

    let run = control_db::runs::fetch_run(&pool, &run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Merged);
}
