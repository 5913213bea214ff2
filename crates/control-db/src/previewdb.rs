//! `preview_db_resets` — the Preview DB Reset/Seed Coordinator's provenance
//! log. This module never touches the preview database itself (that's a
//! capability the `control-previewdb` crate drives); it only validates the
//! slot→db mapping and persists the outcome of each attempt.

use anyhow::{anyhow, Context, Result};
use control_schemas::{CoreError, PreviewDbReset, ResetStatus, ResetStrategy, RunId};
use sqlx::{PgPool, Row};

use crate::audit::{insert_audit_entry, NewAuditEntry};
use crate::events::{insert_event, NewRunEvent};

/// Enforce the slot→db hard invariant: `preview-<n>` maps to exactly the db
/// name produced by substituting `<n>` into `name_template`. Anything else
/// — a typo'd template, a name pointing at the control-plane db, a slot id
/// that doesn't carry a numeric suffix — is rejected before any SQL runs.
pub fn expected_db_name(slot_id: &str, name_template: &str) -> Option<String> {
    let n = slot_id.strip_prefix("preview-")?;
    if n.is_empty() || !n.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(name_template.replace("{n}", n))
}

/// Pinned to the literal `app_preview_<n>` pattern, independent of
/// `preview_db_name_template` — a misconfigured template must not be able
/// to wave a reset through against an arbitrary database. `n` must be the
/// same numeric suffix carried by `slot_id` itself.
pub fn validate_db_target(slot_id: &str, db_name: &str) -> Result<(), CoreError> {
    let n = match slot_id.strip_prefix("preview-") {
        Some(n) if !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()) => n,
        _ => {
            return Err(CoreError::UnsafeDatabaseTarget(format!(
                "slot '{slot_id}' is not a recognized preview slot"
            )))
        }
    };

    let expected = format!("app_preview_{n}");
    if db_name == expected {
        Ok(())
    } else {
        Err(CoreError::UnsafeDatabaseTarget(format!(
            "db_name '{db_name}' is not the expected preview database for slot '{slot_id}' (expected '{expected}')"
        )))
    }
}

pub struct ResetAttempt<'a> {
    pub run_id: &'a RunId,
    pub slot_id: &'a str,
    pub db_name: &'a str,
    pub strategy: ResetStrategy,
    pub seed_version: Option<&'a str>,
    pub snapshot_version: Option<&'a str>,
    pub reset_status: ResetStatus,
    pub details: serde_json::Value,
}

/// Record one `reset_and_seed` attempt, in every outcome: rejected, applied,
/// failed, or dry_run. The row is the provenance log; it is written
/// regardless of whether the attempt succeeded.
pub async fn record_reset_attempt(pool: &PgPool, attempt: &ResetAttempt<'_>) -> Result<PreviewDbReset, CoreError> {
    let mut tx = pool.begin().await.map_err(|e| CoreError::Internal(e.to_string()))?;

    let row = sqlx::query(
        "INSERT INTO preview_db_resets
            (run_id, slot_id, db_name, strategy, seed_version, snapshot_version, reset_status, details)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
         RETURNING id, created_at",
    )
    .bind(attempt.run_id.as_str())
    .bind(attempt.slot_id)
    .bind(attempt.db_name)
    .bind(attempt.strategy.as_str())
    .bind(attempt.seed_version)
    .bind(attempt.snapshot_version)
    .bind(attempt.reset_status.as_str())
    .bind(&attempt.details)
    .fetch_one(&mut *tx)
    .await
    .map_err(|e| CoreError::Internal(e.to_string()))?;

    let id: i64 = row.try_get("id").map_err(|e| CoreError::Internal(e.to_string()))?;
    let created_at = row.try_get("created_at").map_err(|e| CoreError::Internal(e.to_string()))?;

    let event_type = match attempt.reset_status {
        ResetStatus::Applied => "preview_db_reset_applied",
        ResetStatus::Rejected => "preview_db_reset_rejected",
        ResetStatus::Failed => "preview_db_reset_failed",
        ResetStatus::DryRun => "preview_db_reset_dry_run",
    };

    insert_event(
        &mut *tx,
        &NewRunEvent {
            run_id: attempt.run_id.as_str(),
            event_type,
            status_from: None,
            status_to: None,
            payload: serde_json::json!({
                "slot_id": attempt.slot_id,
                "db_name": attempt.db_name,
                "strategy": attempt.strategy.as_str(),
            }),
        },
    )
    .await
    .map_err(|e| CoreError::Internal(e.to_string()))?;

    insert_audit_entry(
        &mut *tx,
        &NewAuditEntry {
            actor: "previewdb-coordinator",
            action: "previewdb.reset",
            payload: &serde_json::json!({
                "slot_id": attempt.slot_id,
                "db_name": attempt.db_name,
                "reset_status": attempt.reset_status.as_str(),
            }),
            trace_id: None,
            run_id: Some(attempt.run_id.as_str()),
            slot_id: Some(attempt.slot_id),
            commit_sha: None,
        },
    )
    .await
    .map_err(|e| CoreError::Internal(e.to_string()))?;

    tx.commit().await.map_err(|e| CoreError::Internal(e.to_string()))?;

    Ok(PreviewDbReset {
        id,
        run_id: attempt.run_id.clone(),
        slot_id: attempt.slot_id.to_string(),
        db_name: attempt.db_name.to_string(),
        strategy: attempt.strategy,
        seed_version: attempt.seed_version.map(str::to_string),
        snapshot_version: attempt.snapshot_version.map(str::to_string),
        reset_status: attempt.reset_status,
        details: attempt.details.clone(),
        created_at,
    })
}

pub async fn list_resets_for_run(pool: &PgPool, run_id: &RunId) -> Result<Vec<PreviewDbReset>> {
    let rows = sqlx::query(
        "SELECT id, run_id, slot_id, db_name, strategy, seed_version, snapshot_version,
                reset_status, details, created_at
         FROM preview_db_resets WHERE run_id = $1 ORDER BY created_at, id",
    )
    .bind(run_id.as_str())
    .fetch_all(pool)
    .await
    .context("list preview_db_resets")?;

    rows.into_iter().map(row_to_reset).collect()
}

fn row_to_reset(row: sqlx::postgres::PgRow) -> Result<PreviewDbReset> {
    let run_id_raw: String = row.try_get("run_id")?;
    let strategy_raw: String = row.try_get("strategy")?;
    let status_raw: String = row.try_get("reset_status")?;

    Ok(PreviewDbReset {
        id: row.try_get("id")?,
        run_id: RunId::parse(&run_id_raw).ok_or_else(|| anyhow!("invalid run_id in preview_db_resets"))?,
        slot_id: row.try_get("slot_id")?,
        db_name: row.try_get("db_name")?,
        strategy: match strategy_raw.as_str() {
            "seed" => ResetStrategy::Seed,
            _ => ResetStrategy::Snapshot,
        },
        seed_version: row.try_get("seed_version")?,
        snapshot_version: row.try_get("snapshot_version")?,
        reset_status: match status_raw.as_str() {
            "applied" => ResetStatus::Applied,
            "rejected" => ResetStatus::Rejected,
            "failed" => ResetStatus::Failed,
            _ => ResetStatus::DryRun,
        },
        details: row.try_get("details")?,
        created_at: row.try_get("created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expected_db_name_substitutes_slot_number() {
        assert_eq!(
            expected_db_name("preview-2", "app_preview_{n}"),
            Some("app_preview_2".to_string())
        );
    }

    #[test]
    fn expected_db_name_rejects_non_preview_slot() {
        assert_eq!(expected_db_name("control-plane", "app_preview_{n}"), None);
    }

    #[test]
    fn validate_db_target_rejects_mismatched_template() {
        let err = validate_db_target("preview-1", "builder_control").unwrap_err();
        assert!(matches!(err, CoreError::UnsafeDatabaseTarget(_)));
    }

    #[test]
    fn validate_db_target_rejects_non_preview_slot() {
        let err = validate_db_target("control-plane", "app_preview_1").unwrap_err();
        assert!(matches!(err, CoreError::UnsafeDatabaseTarget(_)));
    }

    #[test]
    fn validate_db_target_accepts_matching_name() {
        assert!(validate_db_target("preview-3", "app_preview_3").is_ok());
    }

    #[test]
    fn validate_db_target_rejects_misconfigured_template_output() {
        // A template that would otherwise produce a non-`app_preview_<n>`
        // name for this slot must still be rejected, even though it's the
        // exact value `expected_db_name` would hand back for that template.
        let templated = expected_db_name("preview-1", "builder_control").unwrap();
        assert_eq!(templated, "builder_control");
        assert!(validate_db_target("preview-1", &templated).is_err());
    }
}
