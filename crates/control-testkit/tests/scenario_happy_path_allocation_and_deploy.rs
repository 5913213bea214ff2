//! Requires `CONTROL_DATABASE_URL`. Covers spec scenario S1: a single run
//! walks queued -> ... -> needs_approval, gets approved, and the approval
//! synchronously drives the merge/deploy gate to a deployed release.

use std::sync::Arc;
use std::time::Duration;

use control_capabilities::{DbResetDriver, GitDriver};
use control_deploy::{GateOutcome, MergeDeployGate};
use control_leases::SlotLeaseManager;
use control_orchestrator::{AllocateRequest, AllocationOrchestrator, AllocationOutcome};
use control_previewdb::PreviewDbCoordinator;
use control_schemas::{CheckStatus, ResetStrategy, RunId, RunStatus};
use control_testkit::{FakeDbResetDriver, FakeDeployDriver, FakeGitDriver};
use control_worktree::WorktreeManager;

async fn insert_run(pool: &sqlx::PgPool, run_id: &RunId) {
    control_db::runs::insert_run(
        pool,
        &control_db::runs::NewRun {
            run_id: run_id.clone(),
            title: Some("happy path".to_string()),
            prompt: "make the button blue".to_string(),
            route: "/settings".to_string(),
            parent_run_id: None,
            created_by: Some("tester".to_string()),
            page_title: None,
            element_hint: None,
            note: None,
            trace_id: None,
        },
    )
    .await
    .unwrap();
}

#[tokio::test]
#[ignore = "requires CONTROL_DATABASE_URL"]
async fn approve_drives_the_run_to_a_deployed_release() {
    let pool = control_db::testkit_db_pool().await.unwrap();
    let slots = vec!["preview-1".to_string()];
    control_db::ensure_slots(&pool, &slots).await.unwrap();

    let run_id = RunId::parse("S1RUN").unwrap();
    insert_run(&pool, &run_id).await;

    let git: Arc<dyn GitDriver> = Arc::new(FakeGitDriver::new());
    let db_reset: Arc<dyn DbResetDriver> = Arc::new(FakeDbResetDriver::new());
    let deploy = Arc::new(FakeDeployDriver::new());

    let leases = SlotLeaseManager::new(pool.clone(), slots.clone(), 1800);
    let worktrees = WorktreeManager::new(pool.clone(), git.clone(), "/srv/worktrees".to_string());
    let previewdb = PreviewDbCoordinator::new(
        pool.clone(),
        db_reset,
        "app_preview_{n}".to_string(),
        "/srv/seeds/{version}.sql".to_string(),
        "/srv/snapshots/{version}.sql".to_string(),
    );

    let orchestrator = AllocationOrchestrator::new(
        SlotLeaseManager::new(pool.clone(), slots.clone(), 1800),
        WorktreeManager::new(pool.clone(), git.clone(), "/srv/worktrees".to_string()),
        previewdb,
    );

    let outcome = orchestrator
        .allocate(AllocateRequest {
            run_id: &run_id,
            existing_branch_name: None,
            strategy: ResetStrategy::Seed,
            seed_version: Some("v1"),
            snapshot_version: None,
            force: false,
        })
        .await
        .unwrap();

    let (slot_id, branch_name) = match outcome {
        AllocationOutcome::Allocated { slot_id, branch_name, .. } => (slot_id, branch_name),
        other => panic!("expected Allocated, got {other:?}"),
    };
    assert_eq!(slot_id, "preview-1");
    assert_eq!(branch_name, run_id.branch_name());

    control_db::runs::transition(&pool, &run_id, RunStatus::Planning, None, None)
        .await
        .unwrap();
    control_db::runs::transition(&pool, &run_id, RunStatus::Editing, None, None)
        .await
        .unwrap();
    control_db::runs::set_commit_sha(&pool, &run_id, "commit-codex-run-s1run")
        .await
        .unwrap();
    control_db::runs::transition(&pool, &run_id, RunStatus::Testing, None, None)
        .await
        .unwrap();

    control_db::checks::record_check(
        &pool,
        &control_db::checks::NewValidationCheck {
            run_id: &run_id,
            check_name: "lint",
            status: CheckStatus::Passed,
            artifact_uri: None,
        },
    )
    .await
    .unwrap();
    control_db::checks::record_check(
        &pool,
        &control_db::checks::NewValidationCheck {
            run_id: &run_id,
            check_name: "typecheck",
            status: CheckStatus::Passed,
            artifact_uri: None,
        },
    )
    .await
    .unwrap();

    control_db::runs::transition(&pool, &run_id, RunStatus::PreviewReady, None, None)
        .await
        .unwrap();
    control_db::runs::transition(&pool, &run_id, RunStatus::NeedsApproval, None, None)
        .await
        .unwrap();

    control_db::approvals::record_decision(
        &pool,
        &control_db::approvals::NewApproval {
            run_id: &run_id,
            reviewer_id: Some("reviewer-1"),
            decision: control_schemas::ApprovalDecision::Approved,
            reason: None,
            failure_reason_code: None,
        },
    )
    .await
    .unwrap();
    control_db::runs::transition(&pool, &run_id, RunStatus::Approved, None, None)
        .await
        .unwrap();

    let gate = MergeDeployGate::new(
        pool.clone(),
        git,
        deploy,
        worktrees,
        leases,
        Duration::from_secs(5),
        true,
    );

    let gate_outcome = gate.finalize(&run_id).await.unwrap();
    let release_id = match gate_outcome {
        GateOutcome::Deployed { release_id } => release_id,
        GateOutcome::Failed { reason, detail } => panic!("expected Deployed, got Failed({reason:?}): {detail}"),
    };
    assert!(!release_id.is_empty());

    let run = control_db::runs::fetch_run(&pool, &run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Merged);

    let leases_after = control_db::leases::list_leases(&pool).await.unwrap();
    let slot = leases_after.iter().find(|l| l.slot_id == "preview-1").unwrap();
    assert_eq!(slot.lease_state, control_schemas::LeaseState::Released);
}
