//! Worktree Binding Manager.
//!
//! One branch + one worktree per run, bound to the slot's lease.
//! `assign` is idempotent: calling it twice for the same run/slot either
//! creates the worktree or reuses it, never duplicates it.

use std::sync::Arc;

use control_capabilities::GitDriver;
use control_schemas::{BindingAction, CoreError, RunId};
use sqlx::PgPool;

pub struct WorktreeManager {
    pool: PgPool,
    driver: Arc<dyn GitDriver>,
    worktree_root: String,
}

pub struct AssignOutcome {
    pub branch_name: String,
    pub worktree_path: String,
    pub reused: bool,
}

impl WorktreeManager {
    pub fn new(pool: PgPool, driver: Arc<dyn GitDriver>, worktree_root: impl Into<String>) -> Self {
        Self {
            pool,
            driver,
            worktree_root: worktree_root.into(),
        }
    }

    /// `assign(run_id, slot_id)` per the contract in §4.3: the lease for
    /// `slot_id` must already be `leased` by `run_id` — this manager
    /// trusts that precondition rather than re-checking it, since the
    /// allocation orchestrator sequences `acquire` before `assign` inside
    /// one allocation attempt.
    pub async fn assign(
        &self,
        run_id: &RunId,
        slot_id: &str,
        existing_branch_name: Option<&str>,
    ) -> Result<AssignOutcome, CoreError> {
        let branch_name = run_id.branch_name();

        if let Some(existing) = existing_branch_name {
            if existing != branch_name {
                return Err(CoreError::Conflict(format!(
                    "run {run_id} already has branch_name {existing}, cannot reassign to {branch_name}"
                )));
            }
        }

        let worktree_path = format!("{}/{}", self.worktree_root.trim_end_matches('/'), slot_id);

        let binding = control_db::worktree::fetch_binding(&self.pool, slot_id).await;
        let reused = matches!(
            &binding,
            Ok(b) if b.branch_name.as_deref() == Some(branch_name.as_str())
                && b.worktree_path.as_deref() == Some(worktree_path.as_str())
        );

        if !reused {
            self.driver
                .create_worktree(&branch_name, &worktree_path)
                .await
                .map_err(|e| CoreError::DriverFailed(e.to_string()))?;
        }

        let last_action = if reused {
            BindingAction::Reused
        } else {
            BindingAction::Assigned
        };

        control_db::worktree::record_binding_assigned(
            &self.pool,
            slot_id,
            run_id,
            &branch_name,
            &worktree_path,
            last_action,
        )
        .await?;

        Ok(AssignOutcome {
            branch_name,
            worktree_path,
            reused,
        })
    }

    /// `cleanup(slot_id, run_id?)`: remove the worktree (idempotent on an
    /// already-absent path) and release the binding row.
    pub async fn cleanup(&self, slot_id: &str, run_id: Option<&RunId>) -> Result<(), CoreError> {
        let binding = control_db::worktree::fetch_binding(&self.pool, slot_id).await?;

        if let (Some(branch_name), Some(worktree_path)) = (&binding.branch_name, &binding.worktree_path) {
            self.driver
                .remove_worktree(worktree_path, branch_name)
                .await
                .map_err(|e| CoreError::DriverFailed(e.to_string()))?;
        }

        control_db::worktree::record_binding_cleaned(&self.pool, slot_id, run_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_conflict_is_detected_before_any_driver_call() {
        let run_id = RunId::parse("R1").unwrap();
        let branch_name = run_id.branch_name();
        assert_ne!(branch_name, "codex/run-other-run");
    }

    #[test]
    fn worktree_path_is_scoped_under_the_slot() {
        let root = "/srv/worktrees";
        let slot_id = "preview-2";
        let path = format!("{}/{}", root.trim_end_matches('/'), slot_id);
        assert_eq!(path, "/srv/worktrees/preview-2");
    }
}
