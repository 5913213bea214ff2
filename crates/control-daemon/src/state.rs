//! Shared runtime state for control-daemon.
//!
//! `AppState` owns the pool, the resolved config, and the three capability
//! drivers as trait objects. Component managers (`SlotLeaseManager`,
//! `WorktreeManager`, ...) are thin enough over `pool.clone()` + `Arc`
//! clones that handlers build one per request rather than sharing a single
//! long-lived instance.

use std::sync::Arc;

use control_capabilities::{DbResetDriver, DeployDriver, GitDriver, PostgresDbResetDriver, ShellDeployDriver, ShellGitDriver};
use control_config::ControlConfig;
use control_deploy::MergeDeployGate;
use control_leases::SlotLeaseManager;
use control_orchestrator::AllocationOrchestrator;
use control_previewdb::PreviewDbCoordinator;
use control_worktree::WorktreeManager;
use sqlx::PgPool;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: ControlConfig,
    pub config_hash: String,
    git: Arc<dyn GitDriver>,
    db_reset: Arc<dyn DbResetDriver>,
    deploy: Arc<dyn DeployDriver>,
}

impl AppState {
    pub fn new(pool: PgPool, config: ControlConfig, config_hash: String) -> Self {
        let git: Arc<dyn GitDriver> = Arc::new(ShellGitDriver::new(
            config.repo_root.clone(),
            config.main_branch.clone(),
            std::time::Duration::from_secs(config.deploy_step_timeout_seconds as u64),
        ));
        let db_reset: Arc<dyn DbResetDriver> = Arc::new(PostgresDbResetDriver::new(
            std::env::var(control_db::ENV_DB_URL).unwrap_or_default(),
            "app_role".to_string(),
        ));
        let deploy: Arc<dyn DeployDriver> = Arc::new(ShellDeployDriver::new(
            config.deploy_reload_command.clone(),
            config.deploy_health_command.clone(),
            config.repo_root.clone(),
        ));

        Self {
            pool,
            config,
            config_hash,
            git,
            db_reset,
            deploy,
        }
    }

    pub fn leases(&self) -> SlotLeaseManager {
        SlotLeaseManager::new(self.pool.clone(), self.config.slot_ids.clone(), self.config.slot_lease_ttl_seconds)
    }

    pub fn worktrees(&self) -> WorktreeManager {
        WorktreeManager::new(self.pool.clone(), self.git.clone(), self.config.worktree_root.clone())
    }

    pub fn previewdb(&self) -> PreviewDbCoordinator {
        PreviewDbCoordinator::new(
            self.pool.clone(),
            self.db_reset.clone(),
            self.config.preview_db_name_template.clone(),
            self.config.seed_file_template.clone(),
            self.config.snapshot_file_template.clone(),
        )
    }

    pub fn orchestrator(&self) -> AllocationOrchestrator {
        AllocationOrchestrator::new(self.leases(), self.worktrees(), self.previewdb())
    }

    pub fn deploy_gate(&self) -> MergeDeployGate {
        MergeDeployGate::new(
            self.pool.clone(),
            self.git.clone(),
            self.deploy.clone(),
            self.worktrees(),
            self.leases(),
            std::time::Duration::from_secs(self.config.deploy_step_timeout_seconds as u64),
            self.config.merge_gate_recheck_required,
        )
    }
}
