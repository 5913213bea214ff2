//! Preview DB Reset/Seed Coordinator.
//!
//! Composes the slot→db safety check in [`control_db::previewdb`] with a
//! [`control_capabilities::DbResetDriver`] to put a slot's preview
//! database into a deterministic state before each run, always leaving a
//! provenance row behind regardless of outcome.

use std::path::PathBuf;
use std::sync::Arc;

use control_capabilities::DbResetDriver;
use control_db::previewdb::{record_reset_attempt, validate_db_target, ResetAttempt};
use control_schemas::{CoreError, PreviewDbReset, ResetStatus, ResetStrategy, RunId};
use sqlx::PgPool;

pub struct PreviewDbCoordinator {
    pool: PgPool,
    driver: Arc<dyn DbResetDriver>,
    db_name_template: String,
    seed_file_template: String,
    snapshot_file_template: String,
}

impl PreviewDbCoordinator {
    pub fn new(
        pool: PgPool,
        driver: Arc<dyn DbResetDriver>,
        db_name_template: impl Into<String>,
        seed_file_template: impl Into<String>,
        snapshot_file_template: impl Into<String>,
    ) -> Self {
        Self {
            pool,
            driver,
            db_name_template: db_name_template.into(),
            seed_file_template: seed_file_template.into(),
            snapshot_file_template: snapshot_file_template.into(),
        }
    }

    fn seed_path(&self, seed_version: &str) -> PathBuf {
        PathBuf::from(self.seed_file_template.replace("{version}", seed_version))
    }

    fn snapshot_path(&self, snapshot_version: &str) -> PathBuf {
        PathBuf::from(self.snapshot_file_template.replace("{version}", snapshot_version))
    }

    /// `reset_and_seed(run_id, slot_id, strategy, seed_version?, snapshot_version?, dry_run?)`.
    pub async fn reset_and_seed(
        &self,
        run_id: &RunId,
        slot_id: &str,
        strategy: ResetStrategy,
        seed_version: Option<&str>,
        snapshot_version: Option<&str>,
        dry_run: bool,
    ) -> Result<PreviewDbReset, CoreError> {
        let db_name = control_db::previewdb::expected_db_name(slot_id, &self.db_name_template)
            .unwrap_or_else(|| format!("<unresolvable for {slot_id}>"));

        if validate_db_target(slot_id, &db_name).is_err() {
            return record_reset_attempt(
                &self.pool,
                &ResetAttempt {
                    run_id,
                    slot_id,
                    db_name: &db_name,
                    strategy,
                    seed_version,
                    snapshot_version,
                    reset_status: ResetStatus::Rejected,
                    details: serde_json::json!({"error": "slot does not map to an expected preview database"}),
                },
            )
            .await;
        }

        match strategy {
            ResetStrategy::Seed if seed_version.is_none() => {
                return record_reset_attempt(
                    &self.pool,
                    &ResetAttempt {
                        run_id,
                        slot_id,
                        db_name: &db_name,
                        strategy,
                        seed_version,
                        snapshot_version,
                        reset_status: ResetStatus::Rejected,
                        details: serde_json::json!({"error": "seed strategy requires seed_version"}),
                    },
                )
                .await;
            }
            ResetStrategy::Snapshot if snapshot_version.is_none() => {
                return record_reset_attempt(
                    &self.pool,
                    &ResetAttempt {
                        run_id,
                        slot_id,
                        db_name: &db_name,
                        strategy,
                        seed_version,
                        snapshot_version,
                        reset_status: ResetStatus::Rejected,
                        details: serde_json::json!({"error": "snapshot strategy requires snapshot_version"}),
                    },
                )
                .await;
            }
            _ => {}
        }

        let file_path = match strategy {
            ResetStrategy::Seed => self.seed_path(seed_version.unwrap()),
            ResetStrategy::Snapshot => self.snapshot_path(snapshot_version.unwrap()),
        };

        if dry_run {
            let exists = file_path.exists();
            return record_reset_attempt(
                &self.pool,
                &ResetAttempt {
                    run_id,
                    slot_id,
                    db_name: &db_name,
                    strategy,
                    seed_version,
                    snapshot_version,
                    reset_status: ResetStatus::DryRun,
                    details: serde_json::json!({"file_path": file_path.to_string_lossy(), "file_exists": exists}),
                },
            )
            .await;
        }

        let mut details = serde_json::json!({"file_path": file_path.to_string_lossy()});

        let reset_result = self.driver.reset_schema(&db_name).await;
        details["reset_schema"] = outcome_json(&reset_result);

        if let Err(err) = reset_result {
            return record_reset_attempt(
                &self.pool,
                &ResetAttempt {
                    run_id,
                    slot_id,
                    db_name: &db_name,
                    strategy,
                    seed_version,
                    snapshot_version,
                    reset_status: ResetStatus::Failed,
                    details: details_with_error(details, &err.to_string()),
                },
            )
            .await;
        }

        let apply_result = self.driver.apply_sql_file(&db_name, &file_path).await;
        details["apply_sql"] = outcome_json(&apply_result);

        let reset_status = if apply_result.is_ok() {
            ResetStatus::Applied
        } else {
            ResetStatus::Failed
        };

        record_reset_attempt(
            &self.pool,
            &ResetAttempt {
                run_id,
                slot_id,
                db_name: &db_name,
                strategy,
                seed_version,
                snapshot_version,
                reset_status,
                details,
            },
        )
        .await
    }
}

fn outcome_json<T>(result: &Result<T, control_capabilities::DriverError>) -> serde_json::Value {
    match result {
        Ok(_) => serde_json::json!({"ok": true}),
        Err(e) => serde_json::json!({"ok": false, "error": e.to_string()}),
    }
}

fn details_with_error(mut details: serde_json::Value, error: &str) -> serde_json::Value {
    details["error"] = serde_json::Value::String(error.to_string());
    details
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_path_substitutes_version() {
        let coordinator_template = "/srv/seeds/{version}.sql".to_string();
        let path = PathBuf::from(coordinator_template.replace("{version}", "v3"));
        assert_eq!(path, PathBuf::from("/srv/seeds/v3.sql"));
    }

    #[test]
    fn expected_db_name_rejects_mismatched_slot() {
        assert!(control_db::previewdb::validate_db_target("preview-1", "builder_control").is_err());
    }
}
