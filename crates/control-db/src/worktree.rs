//! `slot_worktree_bindings` — the Worktree Binding Manager's persistence
//! layer. This module only ever upserts the one row per slot; it has no
//! opinion on git at all. The git driver call happens one layer up, in
//! `control-worktree`, which calls here to record the outcome.

use anyhow::Context;
use control_schemas::{BindingAction, BindingState, CoreError, RunId};
use sqlx::{PgPool, Row};

use crate::audit::{insert_audit_entry, NewAuditEntry};
use crate::events::{insert_event, NewRunEvent};
use crate::runs;

pub async fn record_binding_assigned(
    pool: &PgPool,
    slot_id: &str,
    run_id: &RunId,
    branch_name: &str,
    worktree_path: &str,
    last_action: BindingAction,
) -> Result<(), CoreError> {
    let mut tx = pool.begin().await.map_err(|e| CoreError::Internal(e.to_string()))?;

    sqlx::query(
        "UPDATE slot_worktree_bindings
         SET run_id = $1, branch_name = $2, worktree_path = $3,
             binding_state = 'active', last_action = $4, assigned_at = now(), released_at = NULL
         WHERE slot_id = $5",
    )
    .bind(run_id.as_str())
    .bind(branch_name)
    .bind(worktree_path)
    .bind(last_action.as_str())
    .bind(slot_id)
    .execute(&mut *tx)
    .await
    .map_err(|e| CoreError::Internal(e.to_string()))?;

    runs::set_allocation_fields(&mut *tx, run_id, Some(slot_id), Some(branch_name), Some(worktree_path))
        .await
        .map_err(|e| CoreError::Internal(e.to_string()))?;

    let event_type = match last_action {
        BindingAction::Assigned => "worktree_assigned",
        BindingAction::Reused => "worktree_reused",
        BindingAction::CleanedUp => unreachable!("cleanup goes through record_binding_cleaned"),
    };

    insert_event(
        &mut *tx,
        &NewRunEvent {
            run_id: run_id.as_str(),
            event_type,
            status_from: None,
            status_to: None,
            payload: serde_json::json!({"slot_id": slot_id, "branch_name": branch_name}),
        },
    )
    .await
    .map_err(|e| CoreError::Internal(e.to_string()))?;

    insert_audit_entry(
        &mut *tx,
        &NewAuditEntry {
            actor: "worktree-manager",
            action: match last_action {
                BindingAction::Assigned => "worktree.assign",
                BindingAction::Reused => "worktree.reuse",
                BindingAction::CleanedUp => unreachable!(),
            },
            payload: &serde_json::json!({"slot_id": slot_id, "branch_name": branch_name}),
            trace_id: None,
            run_id: Some(run_id.as_str()),
            slot_id: Some(slot_id),
            commit_sha: None,
        },
    )
    .await
    .map_err(|e| CoreError::Internal(e.to_string()))?;

    tx.commit().await.map_err(|e| CoreError::Internal(e.to_string()))?;
    Ok(())
}

pub async fn record_binding_cleaned(pool: &PgPool, slot_id: &str, run_id: Option<&RunId>) -> Result<(), CoreError> {
    let mut tx = pool.begin().await.map_err(|e| CoreError::Internal(e.to_string()))?;

    sqlx::query(
        "UPDATE slot_worktree_bindings
         SET binding_state = 'released', last_action = 'cleaned_up', released_at = now(), run_id = NULL
         WHERE slot_id = $1",
    )
    .bind(slot_id)
    .execute(&mut *tx)
    .await
    .map_err(|e| CoreError::Internal(e.to_string()))?;

    if let Some(run_id) = run_id {
        insert_event(
            &mut *tx,
            &NewRunEvent {
                run_id: run_id.as_str(),
                event_type: "worktree_cleaned",
                status_from: None,
                status_to: None,
                payload: serde_json::json!({"slot_id": slot_id}),
            },
        )
        .await
        .map_err(|e| CoreError::Internal(e.to_string()))?;
    }

    insert_audit_entry(
        &mut *tx,
        &NewAuditEntry {
            actor: "worktree-manager",
            action: "worktree.cleanup",
            payload: &serde_json::json!({"slot_id": slot_id}),
            trace_id: None,
            run_id: run_id.map(RunId::as_str),
            slot_id: Some(slot_id),
            commit_sha: None,
        },
    )
    .await
    .map_err(|e| CoreError::Internal(e.to_string()))?;

    tx.commit().await.map_err(|e| CoreError::Internal(e.to_string()))?;
    Ok(())
}

pub async fn fetch_binding(pool: &PgPool, slot_id: &str) -> Result<control_schemas::SlotWorktreeBinding, CoreError> {
    let row = sqlx::query(
        "SELECT slot_id, run_id, branch_name, worktree_path, binding_state, last_action, assigned_at, released_at
         FROM slot_worktree_bindings WHERE slot_id = $1",
    )
    .bind(slot_id)
    .fetch_optional(pool)
    .await
    .map_err(|e| CoreError::Internal(e.to_string()))?
    .ok_or_else(|| CoreError::NotFound(format!("binding for slot {slot_id} not found")))?;

    row_to_binding(row).map_err(|e| CoreError::Internal(e.to_string()))
}

pub async fn list_bindings(pool: &PgPool) -> Result<Vec<control_schemas::SlotWorktreeBinding>, CoreError> {
    let rows = sqlx::query(
        "SELECT slot_id, run_id, branch_name, worktree_path, binding_state, last_action, assigned_at, released_at
         FROM slot_worktree_bindings ORDER BY slot_id",
    )
    .fetch_all(pool)
    .await
    .map_err(|e| CoreError::Internal(e.to_string()))?;

    rows.into_iter()
        .map(|row| row_to_binding(row).map_err(|e| CoreError::Internal(e.to_string())))
        .collect()
}

fn row_to_binding(row: sqlx::postgres::PgRow) -> anyhow::Result<control_schemas::SlotWorktreeBinding> {
    let run_id_raw: Option<String> = row.try_get("run_id").context("run_id")?;
    let state_raw: String = row.try_get("binding_state").context("binding_state")?;
    let action_raw: String = row.try_get("last_action").context("last_action")?;

    Ok(control_schemas::SlotWorktreeBinding {
        slot_id: row.try_get("slot_id").context("slot_id")?,
        run_id: run_id_raw.and_then(|s| RunId::parse(&s)),
        branch_name: row.try_get("branch_name").context("branch_name")?,
        worktree_path: row.try_get("worktree_path").context("worktree_path")?,
        binding_state: match state_raw.as_str() {
            "active" => BindingState::Active,
            _ => BindingState::Released,
        },
        last_action: match action_raw.as_str() {
            "assigned" => BindingAction::Assigned,
            "reused" => BindingAction::Reused,
            _ => BindingAction::CleanedUp,
        },
        assigned_at: row.try_get("assigned_at").context("assigned_at")?,
        released_at: row.try_get("released_at").context("released_at")?,
    })
}
