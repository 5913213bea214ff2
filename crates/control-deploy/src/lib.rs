//! Merge/Deploy Gate.
//!
//! The single choke-point through which an approved run is finalized:
//! re-check, merge, push, reload, health-probe, terminal transition. Every
//! sub-step failure restores the previous release and ends the run in
//! `failed` with the matching reason code — mirrors the gateway pattern of
//! evaluating every precondition before ever reaching the external driver.

use std::sync::Arc;
use std::time::Duration;

use control_capabilities::{DeployDriver, GitDriver};
use control_db::checks::latest_per_check_name;
use control_db::{artifacts, releases, runs};
use control_leases::SlotLeaseManager;
use control_schemas::{CheckStatus, CoreError, FailureReasonCode, Run, RunId, RunStatus};
use control_worktree::WorktreeManager;
use sqlx::PgPool;

pub struct MergeDeployGate {
    pool: PgPool,
    git: Arc<dyn GitDriver>,
    deploy: Arc<dyn DeployDriver>,
    worktrees: WorktreeManager,
    leases: SlotLeaseManager,
    step_timeout: Duration,
    recheck_required: bool,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum GateOutcome {
    Deployed { release_id: String },
    Failed { reason: FailureReasonCode, detail: String },
}

impl MergeDeployGate {
    pub fn new(
        pool: PgPool,
        git: Arc<dyn GitDriver>,
        deploy: Arc<dyn DeployDriver>,
        worktrees: WorktreeManager,
        leases: SlotLeaseManager,
        step_timeout: Duration,
        recheck_required: bool,
    ) -> Self {
        Self {
            pool,
            git,
            deploy,
            worktrees,
            leases,
            step_timeout,
            recheck_required,
        }
    }

    /// Only callable when `Run.status = approved`; the state machine
    /// enforces that precondition the moment we try the first transition.
    pub async fn finalize(&self, run_id: &RunId) -> Result<GateOutcome, CoreError> {
        let run = runs::transition(&self.pool, run_id, RunStatus::Merging, None, None).await?;

        if let Some(outcome) = self.recheck(&run).await? {
            return Ok(outcome);
        }

        let merge_commit = match self.merge_and_push(&run).await {
            Ok(sha) => sha,
            Err(outcome) => return Ok(outcome),
        };

        runs::transition(&self.pool, run_id, RunStatus::Deploying, None, None).await?;

        if let Err(outcome) = self.reload_and_healthcheck(&run).await {
            self.rollback(&run).await;
            return Ok(outcome);
        }

        runs::transition(&self.pool, run_id, RunStatus::Merged, None, None).await?;
        let release = releases::record_deployed(&self.pool, &merge_commit, &merge_commit, None)
            .await
            .map_err(|e| CoreError::Internal(e.to_string()))?;

        if let Some(slot_id) = &run.slot_id {
            let _ = self.worktrees.cleanup(slot_id, Some(run_id)).await;
            let _ = self.leases.release(slot_id, Some(run_id)).await;
        }

        Ok(GateOutcome::Deployed {
            release_id: release.release_id,
        })
    }

    async fn recheck(&self, run: &Run) -> Result<Option<GateOutcome>, CoreError> {
        if !self.recheck_required {
            return Ok(None);
        }

        let checks = latest_per_check_name(&self.pool, &run.run_id)
            .await
            .map_err(|e| CoreError::Internal(e.to_string()))?;

        let all_passed = !checks.is_empty() && checks.iter().all(|c| c.status == CheckStatus::Passed);

        if all_passed {
            return Ok(None);
        }

        let failed = runs::transition(
            &self.pool,
            &run.run_id,
            RunStatus::Failed,
            Some(FailureReasonCode::ChecksFailed),
            Some(serde_json::json!({"checks": checks.len()})),
        )
        .await?;
        let _ = failed;

        Ok(Some(GateOutcome::Failed {
            reason: FailureReasonCode::ChecksFailed,
            detail: "not all validation checks are passed on the exact commit".to_string(),
        }))
    }

    async fn merge_and_push(&self, run: &Run) -> Result<String, GateOutcome> {
        let Some(branch_name) = &run.branch_name else {
            self.fail(&run.run_id, FailureReasonCode::MergeConflict, "run has no branch_name").await;
            return Err(GateOutcome::Failed {
                reason: FailureReasonCode::MergeConflict,
                detail: "run has no branch_name".to_string(),
            });
        };
        let commit_sha = run.commit_sha.clone().unwrap_or_default();

        let merge_commit = match self.git.merge_to_main(branch_name, &commit_sha).await {
            Ok(sha) => sha,
            Err(err) => {
                self.fail(&run.run_id, FailureReasonCode::MergeConflict, &err.to_string()).await;
                return Err(GateOutcome::Failed {
                    reason: FailureReasonCode::MergeConflict,
                    detail: err.to_string(),
                });
            }
        };

        if let Err(err) = self.git.push_main().await {
            let _ = artifacts::record_artifact(
                &self.pool,
                &run.run_id,
                "push_diagnostics",
                "inline://push-failure",
                Some(serde_json::json!({"error": err.to_string()})),
            )
            .await;
            self.fail(&run.run_id, FailureReasonCode::DeployPushFailed, &err.to_string()).await;
            return Err(GateOutcome::Failed {
                reason: FailureReasonCode::DeployPushFailed,
                detail: err.to_string(),
            });
        }

        Ok(merge_commit)
    }

    async fn reload_and_healthcheck(&self, run: &Run) -> Result<(), GateOutcome> {
        let reload = self.deploy.reload(self.step_timeout).await;
        if let Err(err) = &reload {
            return Err(self.healthcheck_failure(run, "deploy_backend_reload_log", err).await);
        }

        let health = self.deploy.health_check(self.step_timeout).await;
        if let Err(err) = &health {
            return Err(self.healthcheck_failure(run, "deploy_health_probe_log", err).await);
        }

        Ok(())
    }

    async fn healthcheck_failure(&self, run: &Run, artifact_type: &str, err: &control_capabilities::DriverError) -> GateOutcome {
        let _ = artifacts::record_artifact(
            &self.pool,
            &run.run_id,
            artifact_type,
            "inline://deploy-failure",
            Some(serde_json::json!({"error": err.to_string()})),
        )
        .await;
        self.fail(&run.run_id, FailureReasonCode::DeployHealthcheckFailed, &err.to_string())
            .await;

        GateOutcome::Failed {
            reason: FailureReasonCode::DeployHealthcheckFailed,
            detail: err.to_string(),
        }
    }

    async fn rollback(&self, run: &Run) {
        if let Some(previous) = releases::current_release(&self.pool).await.ok().flatten() {
            let _ = self.deploy.restore_previous_release(&previous.commit_sha).await;
        }
        let commit_sha = run.commit_sha.clone().unwrap_or_default();
        let _ = releases::record_deploy_failed(&self.pool, &commit_sha, &commit_sha).await;
    }

    async fn fail(&self, run_id: &RunId, reason: FailureReasonCode, detail: &str) {
        let _ = runs::transition(
            &self.pool,
            run_id,
            RunStatus::Failed,
            Some(reason),
            Some(serde_json::json!({"detail": detail})),
        )
        .await;
    }
}
