//! Allocation Orchestrator.
//!
//! The worker's single entry point for turning a newly-claimed run into a
//! ready-to-edit one: lease a slot, bind a worktree, reset the preview DB
//! — or report a precise queue/failure reason. Composes
//! `control-leases` + `control-worktree` + `control-previewdb`; owns none
//! of their tables itself.

use control_leases::SlotLeaseManager;
use control_previewdb::PreviewDbCoordinator;
use control_schemas::{CoreError, FailureReasonCode, ResetStrategy, RunId};
use control_worktree::WorktreeManager;

pub struct AllocationOrchestrator {
    leases: SlotLeaseManager,
    worktrees: WorktreeManager,
    previewdb: PreviewDbCoordinator,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AllocationOutcome {
    Allocated {
        slot_id: String,
        branch_name: String,
        worktree_path: String,
        db_name: String,
    },
    Waiting {
        reason: FailureReasonCode,
        occupied_slots: Vec<String>,
    },
    Failed {
        reason: &'static str,
        detail: String,
    },
}

pub struct AllocateRequest<'a> {
    pub run_id: &'a RunId,
    pub existing_branch_name: Option<&'a str>,
    pub strategy: ResetStrategy,
    pub seed_version: Option<&'a str>,
    pub snapshot_version: Option<&'a str>,
    pub force: bool,
}

impl AllocationOrchestrator {
    pub fn new(leases: SlotLeaseManager, worktrees: WorktreeManager, previewdb: PreviewDbCoordinator) -> Self {
        Self {
            leases,
            worktrees,
            previewdb,
        }
    }

    /// Idempotent per spec §4.6: safe to call repeatedly for the same run
    /// while it waits for a slot, since each step's own operation is
    /// itself idempotent.
    pub async fn allocate(&self, req: AllocateRequest<'_>) -> Result<AllocationOutcome, CoreError> {
        let acquired = self.leases.acquire(req.run_id, req.force).await?;

        let Some(slot_id) = acquired.slot_id else {
            return Ok(AllocationOutcome::Waiting {
                reason: FailureReasonCode::WaitingForSlot,
                occupied_slots: acquired.occupied_slots,
            });
        };

        let assign_result = self
            .worktrees
            .assign(req.run_id, &slot_id, req.existing_branch_name)
            .await;

        let assigned = match assign_result {
            Ok(outcome) => outcome,
            Err(err) => {
                let _ = self.leases.release(&slot_id, Some(req.run_id)).await;
                return Ok(AllocationOutcome::Failed {
                    reason: "WORKTREE_ASSIGN_FAILED",
                    detail: format!("worktree assign failed: {err}"),
                });
            }
        };

        let reset = self
            .previewdb
            .reset_and_seed(
                req.run_id,
                &slot_id,
                req.strategy,
                req.seed_version,
                req.snapshot_version,
                false,
            )
            .await?;

        if reset.reset_status != control_schemas::ResetStatus::Applied {
            let _ = self.worktrees.cleanup(&slot_id, Some(req.run_id)).await;
            let _ = self.leases.release(&slot_id, Some(req.run_id)).await;
            return Ok(AllocationOutcome::Failed {
                reason: "PREVIEW_DB_RESET_FAILED",
                detail: format!("preview db reset ended in {:?}", reset.reset_status),
            });
        }

        Ok(AllocationOutcome::Allocated {
            slot_id,
            branch_name: assigned.branch_name,
            worktree_path: assigned.worktree_path,
            db_name: reset.db_name,
        })
    }
}
