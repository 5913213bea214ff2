//! Requires `CONTROL_DATABASE_URL`. Covers spec scenario S6: a failing
//! health probe after merge+push restores the previous release and ends
//! the run `failed(DEPLOY_HEALTHCHECK_FAILED)` rather than leaving it
//! half-deployed.

use std::sync::Arc;
use std::time::Duration;

use control_capabilities::GitDriver;
use control_deploy::{GateOutcome, MergeDeployGate};
use control_leases::SlotLeaseManager;
use control_schemas::{CheckStatus, FailureReasonCode, RunStatus, RunId};
use control_testkit::deploy::Scripted;
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

#[tokio::test]
#[ignore = "requires CONTROL_DATABASE_URL"]
async fn failing_health_check_rolls_back_and_fails_the_run() {
    let pool = control_db::testkit_db_pool().await.unwrap();
    let slots = vec!["preview-1".to_string()];
    control_db::ensure_slots(&pool, &slots).await.unwrap();

    control_db::releases::record_deployed(&pool, "release-before", "commit-before", None)
        .await
        .unwrap();

    let run_id = RunId::parse("S6RUN").unwrap();
    insert_run(&pool, &run_id).await;

    let git: Arc<dyn GitDriver> = Arc::new(FakeGitDriver::new());
    let branch_name = run_id.branch_name();
    git.create_worktree(&branch_name, "/srv/worktrees/preview-1")
        .await
        .unwrap();
    let commit_sha = FakeGitDriver::commit_for(&branch_name);

    control_db::runs::set_allocation_fields(
        &pool,
        &run_id,
        Some("preview-1"),
        Some(branch_name.as_str()),
        Some("/srv/worktrees/preview-1"),
    )
    .await
    .unwrap();
    control_db::runs::set_commit_sha(&pool, &run_id, &commit_sha).await.unwrap();

    let leases = SlotLeaseManager::new(pool.clone(), slots.clone(), 1800);
    leases.acquire(&run_id, false).await.unwrap();

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

    for to in [
        RunStatus::Planning,
        RunStatus::Editing,
        RunStatus::Testing,
        RunStatus::PreviewReady,
        RunStatus::NeedsApproval,
        RunStatus::Approved,
    ] {
        control_db::runs::transition(&pool, &run_id, to, None, None).await.unwrap();
    }

    let deploy = Arc::new(FakeDeployDriver::new());
    deploy.push_health(Scripted::NonZeroExit {
        code: 1,
        stderr: "service did not become healthy".to_string(),
    });

    let worktrees = WorktreeManager::new(pool.clone(), git.clone(), "/srv/worktrees".to_string());
    let gate = MergeDeployGate::new(
        pool.clone(),
        git,
        deploy.clone(),
        worktrees,
        SlotLeaseManager::new(pool.clone(), slots.clone(), 1800),
        Duration::from_secs(5),
        true,
    );

    let outcome = gate.finalize(&run_id).await.unwrap();
    match outcome {
        GateOutcome::Failed { reason, .. } => assert_eq!(reason, FailureReasonCode::DeployHealthcheckFailed),
        GateOutcome::Deployed { .. } => panic!("expected Failed, got Deployed"),
    }

    let run = control_db::runs::fetch_run(&pool, &run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);

    assert_eq!(deploy.restored_to(), vec!["commit-before".to_string()]);

    let current = control_db::releases::current_release(&pool).await.unwrap().unwrap();
    assert_eq!(current.release_id, "release-before");
}
