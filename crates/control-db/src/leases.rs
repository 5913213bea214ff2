//! `slot_leases` — the Slot Lease Manager's persistence layer.
//!
//! `acquire` holds `FOR UPDATE` over every configured slot row for the
//! duration of the scan-and-claim, so two concurrent callers racing for the
//! last free slot serialize on that lock rather than both believing they
//! won — the same pessimistic-lock discipline the teacher's outbox claim
//! batch uses for its `FOR UPDATE SKIP LOCKED` dispatch lease.

use chrono::{Duration, Utc};
use control_schemas::{CoreError, FailureReasonCode, RunId, RunStatus};
use sqlx::{PgPool, Row};

use crate::audit::{insert_audit_entry, NewAuditEntry};
use crate::events::{insert_event, NewRunEvent};
use crate::runs;

#[derive(Debug, Clone, serde::Serialize)]
pub struct AcquireOutcome {
    pub acquired: bool,
    pub slot_id: Option<String>,
    pub idempotent: bool,
    pub occupied_slots: Vec<String>,
}

/// See spec §4.2: idempotent if the run already holds a non-terminal
/// lease; otherwise first-fit scan in configured slot order under a lock
/// covering the whole slot set.
///
/// Open Question #2 (see DESIGN.md): if `runs.slot_id` already carries a
/// value from a prior allocation but the corresponding `slot_leases` row
/// is no longer `leased` to this run (state drift after a crashed
/// worker), acquiring a fresh slot is rejected with `conflict` unless
/// `force` is set.
pub async fn acquire(
    pool: &PgPool,
    run_id: &RunId,
    slot_ids: &[String],
    ttl_seconds: i64,
    force: bool,
) -> Result<AcquireOutcome, CoreError> {
    let mut tx = pool
        .begin()
        .await
        .map_err(|e| CoreError::Internal(e.to_string()))?;

    let rows = sqlx::query(
        "SELECT slot_id, run_id, lease_state, expires_at FROM slot_leases
         WHERE slot_id = ANY($1) FOR UPDATE",
    )
    .bind(slot_ids)
    .fetch_all(&mut *tx)
    .await
    .map_err(|e| CoreError::Internal(e.to_string()))?;

    let now = Utc::now();

    if let Some(existing) = rows.iter().find(|r| {
        r.try_get::<Option<String>, _>("run_id").ok().flatten().as_deref() == Some(run_id.as_str())
            && r.try_get::<String, _>("lease_state").ok().as_deref() == Some("leased")
    }) {
        let slot_id: String = existing
            .try_get("slot_id")
            .map_err(|e| CoreError::Internal(e.to_string()))?;

        insert_event(
            &mut *tx,
            &NewRunEvent {
                run_id: run_id.as_str(),
                event_type: "slot_acquire_idempotent",
                status_from: None,
                status_to: None,
                payload: serde_json::json!({"slot_id": slot_id}),
            },
        )
        .await
        .map_err(|e| CoreError::Internal(e.to_string()))?;

        tx.commit().await.map_err(|e| CoreError::Internal(e.to_string()))?;

        return Ok(AcquireOutcome {
            acquired: true,
            slot_id: Some(slot_id),
            idempotent: true,
            occupied_slots: vec![],
        });
    }

    if !force {
        let drifted_slot: Option<String> = sqlx::query("SELECT slot_id FROM runs WHERE run_id = $1")
            .bind(run_id.as_str())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| CoreError::Internal(e.to_string()))?
            .and_then(|row| row.try_get::<Option<String>, _>("slot_id").ok().flatten());

        if let Some(stale_slot_id) = drifted_slot {
            tx.commit().await.map_err(|e| CoreError::Internal(e.to_string()))?;
            return Err(CoreError::Conflict(format!(
                "run {run_id} already recorded slot_id {stale_slot_id} but no longer holds a matching lease; pass force=true to re-acquire"
            )));
        }
    }

    // slot_ids is the canonical order; preserve it rather than the row order
    // the query happened to return.
    let by_id: std::collections::HashMap<String, (Option<String>, String, Option<chrono::DateTime<Utc>>)> = rows
        .iter()
        .map(|r| {
            let slot_id: String = r.try_get("slot_id").unwrap();
            let run_id: Option<String> = r.try_get("run_id").unwrap();
            let state: String = r.try_get("lease_state").unwrap();
            let expires_at: Option<chrono::DateTime<Utc>> = r.try_get("expires_at").unwrap();
            (slot_id, (run_id, state, expires_at))
        })
        .collect();

    let mut free_slot: Option<String> = None;
    let mut occupied = Vec::new();

    for slot_id in slot_ids {
        let Some((_, state, expires_at)) = by_id.get(slot_id) else {
            continue;
        };
        let is_free = state == "released"
            || state == "expired"
            || expires_at.map(|exp| exp < now).unwrap_or(false);

        if is_free && free_slot.is_none() {
            free_slot = Some(slot_id.clone());
        } else if state == "leased" {
            occupied.push(slot_id.clone());
        }
    }

    let Some(slot_id) = free_slot else {
        insert_event(
            &mut *tx,
            &NewRunEvent {
                run_id: run_id.as_str(),
                event_type: "slot_waiting",
                status_from: None,
                status_to: None,
                payload: serde_json::json!({
                    "reason": FailureReasonCode::WaitingForSlot.as_str(),
                    "occupied_slots": occupied,
                    "queue_behavior": "retry_on_acquire",
                }),
            },
        )
        .await
        .map_err(|e| CoreError::Internal(e.to_string()))?;

        tx.commit().await.map_err(|e| CoreError::Internal(e.to_string()))?;

        return Ok(AcquireOutcome {
            acquired: false,
            slot_id: None,
            idempotent: false,
            occupied_slots: occupied,
        });
    };

    let expires_at = now + Duration::seconds(ttl_seconds);

    sqlx::query(
        "UPDATE slot_leases SET run_id = $1, lease_state = 'leased',
                leased_at = $2, heartbeat_at = $2, expires_at = $3
         WHERE slot_id = $4",
    )
    .bind(run_id.as_str())
    .bind(now)
    .bind(expires_at)
    .bind(&slot_id)
    .execute(&mut *tx)
    .await
    .map_err(|e| CoreError::Internal(e.to_string()))?;

    runs::set_allocation_fields(&mut *tx, run_id, Some(&slot_id), None, None)
        .await
        .map_err(|e| CoreError::Internal(e.to_string()))?;

    insert_event(
        &mut *tx,
        &NewRunEvent {
            run_id: run_id.as_str(),
            event_type: "slot_acquired",
            status_from: None,
            status_to: None,
            payload: serde_json::json!({"slot_id": slot_id}),
        },
    )
    .await
    .map_err(|e| CoreError::Internal(e.to_string()))?;

    insert_audit_entry(
        &mut *tx,
        &NewAuditEntry {
            actor: "lease-manager",
            action: "slot.acquire",
            payload: &serde_json::json!({"slot_id": slot_id, "run_id": run_id.as_str()}),
            trace_id: None,
            run_id: Some(run_id.as_str()),
            slot_id: Some(&slot_id),
            commit_sha: None,
        },
    )
    .await
    .map_err(|e| CoreError::Internal(e.to_string()))?;

    tx.commit().await.map_err(|e| CoreError::Internal(e.to_string()))?;

    Ok(AcquireOutcome {
        acquired: true,
        slot_id: Some(slot_id),
        idempotent: false,
        occupied_slots: vec![],
    })
}

pub async fn heartbeat(
    pool: &PgPool,
    slot_id: &str,
    run_id: &RunId,
    ttl_seconds: i64,
) -> Result<(), CoreError> {
    let mut tx = pool
        .begin()
        .await
        .map_err(|e| CoreError::Internal(e.to_string()))?;

    let row = sqlx::query(
        "SELECT run_id, lease_state, expires_at FROM slot_leases WHERE slot_id = $1 FOR UPDATE",
    )
    .bind(slot_id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(|e| CoreError::Internal(e.to_string()))?
    .ok_or_else(|| CoreError::NotFound(format!("slot {slot_id} not found")))?;

    let held_by: Option<String> = row.try_get("run_id").map_err(|e| CoreError::Internal(e.to_string()))?;
    let state: String = row.try_get("lease_state").map_err(|e| CoreError::Internal(e.to_string()))?;
    let expires_at: Option<chrono::DateTime<Utc>> =
        row.try_get("expires_at").map_err(|e| CoreError::Internal(e.to_string()))?;

    let now = Utc::now();
    let matches = held_by.as_deref() == Some(run_id.as_str())
        && state == "leased"
        && expires_at.map(|exp| exp >= now).unwrap_or(false);

    if !matches {
        insert_event(
            &mut *tx,
            &NewRunEvent {
                run_id: run_id.as_str(),
                event_type: "slot_heartbeat_rejected",
                status_from: None,
                status_to: None,
                payload: serde_json::json!({"slot_id": slot_id}),
            },
        )
        .await
        .map_err(|e| CoreError::Internal(e.to_string()))?;
        tx.commit().await.map_err(|e| CoreError::Internal(e.to_string()))?;

        return Err(CoreError::LeaseMismatch(format!(
            "slot {slot_id} is not leased to run {run_id}"
        )));
    }

    let new_expiry = now + Duration::seconds(ttl_seconds);
    sqlx::query("UPDATE slot_leases SET heartbeat_at = $1, expires_at = $2 WHERE slot_id = $3")
        .bind(now)
        .bind(new_expiry)
        .bind(slot_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| CoreError::Internal(e.to_string()))?;

    insert_event(
        &mut *tx,
        &NewRunEvent {
            run_id: run_id.as_str(),
            event_type: "slot_heartbeat",
            status_from: None,
            status_to: None,
            payload: serde_json::json!({"slot_id": slot_id}),
        },
    )
    .await
    .map_err(|e| CoreError::Internal(e.to_string()))?;

    tx.commit().await.map_err(|e| CoreError::Internal(e.to_string()))?;
    Ok(())
}

/// Idempotent: releasing an already-released slot succeeds silently.
pub async fn release(pool: &PgPool, slot_id: &str, run_id: Option<&RunId>) -> Result<(), CoreError> {
    let mut tx = pool
        .begin()
        .await
        .map_err(|e| CoreError::Internal(e.to_string()))?;

    let row = sqlx::query("SELECT run_id, lease_state FROM slot_leases WHERE slot_id = $1 FOR UPDATE")
        .bind(slot_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| CoreError::Internal(e.to_string()))?
        .ok_or_else(|| CoreError::NotFound(format!("slot {slot_id} not found")))?;

    let held_by: Option<String> = row.try_get("run_id").map_err(|e| CoreError::Internal(e.to_string()))?;
    let state: String = row.try_get("lease_state").map_err(|e| CoreError::Internal(e.to_string()))?;

    if state != "leased" {
        tx.commit().await.map_err(|e| CoreError::Internal(e.to_string()))?;
        return Ok(());
    }

    if let Some(expected) = run_id {
        if held_by.as_deref() != Some(expected.as_str()) {
            return Err(CoreError::LeaseMismatch(format!(
                "slot {slot_id} is leased to a different run"
            )));
        }
    }

    sqlx::query(
        "UPDATE slot_leases SET lease_state = 'released', run_id = NULL,
                leased_at = NULL, expires_at = NULL, heartbeat_at = NULL
         WHERE slot_id = $1",
    )
    .bind(slot_id)
    .execute(&mut *tx)
    .await
    .map_err(|e| CoreError::Internal(e.to_string()))?;

    if let Some(held_run_id) = held_by.as_deref().and_then(RunId::parse) {
        runs::set_allocation_fields(&mut *tx, &held_run_id, None, None, None)
            .await
            .map_err(|e| CoreError::Internal(e.to_string()))?;

        insert_event(
            &mut *tx,
            &NewRunEvent {
                run_id: held_run_id.as_str(),
                event_type: "slot_released",
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
            actor: "lease-manager",
            action: "slot.release",
            payload: &serde_json::json!({"slot_id": slot_id}),
            trace_id: None,
            run_id: held_by.as_deref(),
            slot_id: Some(slot_id),
            commit_sha: None,
        },
    )
    .await
    .map_err(|e| CoreError::Internal(e.to_string()))?;

    tx.commit().await.map_err(|e| CoreError::Internal(e.to_string()))?;
    Ok(())
}

/// Reap every lease whose `expires_at` has passed. For each reaped run in
/// a non-terminal state, requests a transition per the configured policy
/// (Open Question #1 — see DESIGN.md). Returns the number reaped.
pub async fn reap_expired(
    pool: &PgPool,
    expiry_transition_failed: bool,
) -> Result<u64, CoreError> {
    let mut tx = pool
        .begin()
        .await
        .map_err(|e| CoreError::Internal(e.to_string()))?;

    let now = Utc::now();
    let rows = sqlx::query(
        "SELECT slot_id, run_id FROM slot_leases
         WHERE lease_state = 'leased' AND expires_at < $1 FOR UPDATE",
    )
    .bind(now)
    .fetch_all(&mut *tx)
    .await
    .map_err(|e| CoreError::Internal(e.to_string()))?;

    let mut reaped_runs: Vec<(String, Option<String>)> = Vec::new();
    for row in &rows {
        let slot_id: String = row.try_get("slot_id").map_err(|e| CoreError::Internal(e.to_string()))?;
        let run_id: Option<String> = row.try_get("run_id").map_err(|e| CoreError::Internal(e.to_string()))?;
        reaped_runs.push((slot_id, run_id));
    }

    for (slot_id, run_id) in &reaped_runs {
        sqlx::query(
            "UPDATE slot_leases SET lease_state = 'expired', run_id = NULL,
                    leased_at = NULL, expires_at = NULL, heartbeat_at = NULL
             WHERE slot_id = $1",
        )
        .bind(slot_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| CoreError::Internal(e.to_string()))?;

        if let Some(run_id_raw) = run_id.as_deref().and_then(RunId::parse) {
            runs::set_allocation_fields(&mut *tx, &run_id_raw, None, None, None)
                .await
                .map_err(|e| CoreError::Internal(e.to_string()))?;
        }

        if let Some(run_id_raw) = run_id {
            insert_event(
                &mut *tx,
                &NewRunEvent {
                    run_id: run_id_raw,
                    event_type: "slot_expired",
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
                actor: "lease-manager",
                action: "slot.reap_expired",
                payload: &serde_json::json!({"slot_id": slot_id}),
                trace_id: None,
                run_id: run_id.as_deref(),
                slot_id: Some(slot_id),
                commit_sha: None,
            },
        )
        .await
        .map_err(|e| CoreError::Internal(e.to_string()))?;
    }

    tx.commit().await.map_err(|e| CoreError::Internal(e.to_string()))?;

    for (_, run_id) in &reaped_runs {
        let Some(run_id) = run_id.as_deref().and_then(RunId::parse) else {
            continue;
        };

        let run = runs::fetch_run(pool, &run_id)
            .await
            .map_err(|e| CoreError::Internal(e.to_string()))?;

        if run.status.is_terminal() {
            continue;
        }

        if expiry_transition_failed {
            runs::transition(
                pool,
                &run_id,
                RunStatus::Failed,
                Some(FailureReasonCode::PreviewExpired),
                None,
            )
            .await?;
        } else {
            runs::transition(pool, &run_id, RunStatus::Expired, None, None).await?;
        }
    }

    Ok(reaped_runs.len() as u64)
}

pub async fn list_leases(pool: &PgPool) -> Result<Vec<control_schemas::SlotLease>, CoreError> {
    let rows = sqlx::query(
        "SELECT slot_id, run_id, lease_state, leased_at, expires_at, heartbeat_at FROM slot_leases ORDER BY slot_id",
    )
    .fetch_all(pool)
    .await
    .map_err(|e| CoreError::Internal(e.to_string()))?;

    rows.into_iter()
        .map(|row| {
            let run_id_raw: Option<String> = row.try_get("run_id").map_err(|e| CoreError::Internal(e.to_string()))?;
            let state_raw: String = row.try_get("lease_state").map_err(|e| CoreError::Internal(e.to_string()))?;
            Ok(control_schemas::SlotLease {
                slot_id: row.try_get("slot_id").map_err(|e| CoreError::Internal(e.to_string()))?,
                run_id: run_id_raw.and_then(|s| RunId::parse(&s)),
                lease_state: control_schemas::LeaseState::parse(&state_raw)
                    .ok_or_else(|| CoreError::Internal(format!("invalid lease_state: {state_raw}")))?,
                leased_at: row.try_get("leased_at").map_err(|e| CoreError::Internal(e.to_string()))?,
                expires_at: row.try_get("expires_at").map_err(|e| CoreError::Internal(e.to_string()))?,
                heartbeat_at: row.try_get("heartbeat_at").map_err(|e| CoreError::Internal(e.to_string()))?,
            })
        })
        .collect()
}
