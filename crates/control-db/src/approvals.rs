//! `approvals` — the Merge/Deploy Gate's approval/rejection record. One row
//! per decision; a run can be rejected and resubmitted for approval more
//! than once before it reaches `approved`.

use anyhow::{anyhow, Context, Result};
use control_schemas::{Approval, ApprovalDecision, FailureReasonCode, RunId};
use sqlx::{PgPool, Row};

use crate::audit::{insert_audit_entry, NewAuditEntry};
use crate::events::{insert_event, NewRunEvent};

pub struct NewApproval<'a> {
    pub run_id: &'a RunId,
    pub reviewer_id: Option<&'a str>,
    pub decision: ApprovalDecision,
    pub reason: Option<&'a str>,
    pub failure_reason_code: Option<FailureReasonCode>,
}

pub async fn record_decision(pool: &PgPool, new: &NewApproval<'_>) -> Result<Approval> {
    let mut tx = pool.begin().await.context("begin record_decision tx")?;

    let row = sqlx::query(
        "INSERT INTO approvals (run_id, reviewer_id, decision, reason, failure_reason_code)
         VALUES ($1, $2, $3, $4, $5)
         RETURNING id, created_at",
    )
    .bind(new.run_id.as_str())
    .bind(new.reviewer_id)
    .bind(new.decision.as_str())
    .bind(new.reason)
    .bind(new.failure_reason_code.map(|c| c.as_str()))
    .fetch_one(&mut *tx)
    .await
    .context("insert approvals row")?;

    let id: i64 = row.try_get("id")?;
    let created_at = row.try_get("created_at")?;

    insert_event(
        &mut *tx,
        &NewRunEvent {
            run_id: new.run_id.as_str(),
            event_type: match new.decision {
                ApprovalDecision::Approved => "approval_granted",
                ApprovalDecision::Rejected => "approval_rejected",
            },
            status_from: None,
            status_to: None,
            payload: serde_json::json!({"reviewer_id": new.reviewer_id, "reason": new.reason}),
        },
    )
    .await
    .context("insert approval event")?;

    insert_audit_entry(
        &mut *tx,
        &NewAuditEntry {
            actor: new.reviewer_id.unwrap_or("unknown-reviewer"),
            action: "approval.record",
            payload: &serde_json::json!({"decision": new.decision.as_str()}),
            trace_id: None,
            run_id: Some(new.run_id.as_str()),
            slot_id: None,
            commit_sha: None,
        },
    )
    .await
    .context("insert approval audit entry")?;

    tx.commit().await.context("commit record_decision tx")?;

    Ok(Approval {
        id,
        run_id: new.run_id.clone(),
        reviewer_id: new.reviewer_id.map(str::to_string),
        decision: new.decision,
        reason: new.reason.map(str::to_string),
        failure_reason_code: new.failure_reason_code,
        created_at,
    })
}

pub async fn list_for_run(pool: &PgPool, run_id: &RunId) -> Result<Vec<Approval>> {
    let rows = sqlx::query(
        "SELECT id, run_id, reviewer_id, decision, reason, failure_reason_code, created_at
         FROM approvals WHERE run_id = $1 ORDER BY created_at, id",
    )
    .bind(run_id.as_str())
    .fetch_all(pool)
    .await
    .context("list approvals")?;

    rows.into_iter()
        .map(|row| {
            let run_id_raw: String = row.try_get("run_id")?;
            let decision_raw: String = row.try_get("decision")?;
            let code_raw: Option<String> = row.try_get("failure_reason_code")?;

            Ok(Approval {
                id: row.try_get("id")?,
                run_id: RunId::parse(&run_id_raw).ok_or_else(|| anyhow!("invalid run_id in approvals"))?,
                reviewer_id: row.try_get("reviewer_id")?,
                decision: match decision_raw.as_str() {
                    "approved" => ApprovalDecision::Approved,
                    _ => ApprovalDecision::Rejected,
                },
                reason: row.try_get("reason")?,
                failure_reason_code: code_raw.and_then(|s| FailureReasonCode::parse(&s)),
                created_at: row.try_get("created_at")?,
            })
        })
        .collect()
}
