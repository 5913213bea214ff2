//! `runs` + `run_contexts` — the Run State Machine's persistence layer.
//!
//! `transition` is the one place `Run.status` is ever written: it loads the
//! row with `FOR UPDATE` (serializing concurrent transitions on the same
//! run), asks [`control_runstate::validate_transition`] whether the move is
//! legal, and if so updates the row, appends a `RunEvent`, and appends an
//! `AuditLog` entry — all inside one transaction.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use control_runstate::{validate_transition, TransitionError};
use control_schemas::{CoreError, FailureReasonCode, Run, RunId, RunStatus};
use sqlx::{PgPool, Row};

use crate::audit::{insert_audit_entry, NewAuditEntry};
use crate::events::{insert_event, NewRunEvent};

pub struct NewRun {
    pub run_id: RunId,
    pub title: Option<String>,
    pub prompt: String,
    pub route: String,
    pub parent_run_id: Option<RunId>,
    pub created_by: Option<String>,
    pub page_title: Option<String>,
    pub element_hint: Option<String>,
    pub note: Option<String>,
    pub trace_id: Option<String>,
}

/// Create a run in `queued` plus its immutable `RunContext` row, and emit
/// the initial `run_created` event. One transaction.
pub async fn insert_run(pool: &PgPool, new_run: &NewRun) -> Result<Run> {
    let mut tx = pool.begin().await.context("begin insert_run tx")?;

    sqlx::query(
        "INSERT INTO runs (run_id, title, prompt, status, route, parent_run_id, created_by)
         VALUES ($1, $2, $3, 'queued', $4, $5, $6)",
    )
    .bind(new_run.run_id.as_str())
    .bind(&new_run.title)
    .bind(&new_run.prompt)
    .bind(&new_run.route)
    .bind(new_run.parent_run_id.as_ref().map(RunId::as_str))
    .bind(&new_run.created_by)
    .execute(&mut *tx)
    .await
    .context("insert runs row")?;

    let mut metadata = serde_json::json!({});
    if let Some(trace_id) = &new_run.trace_id {
        metadata["trace_id"] = serde_json::Value::String(trace_id.clone());
    }

    sqlx::query(
        "INSERT INTO run_contexts (run_id, route, page_title, element_hint, note, metadata)
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(new_run.run_id.as_str())
    .bind(&new_run.route)
    .bind(&new_run.page_title)
    .bind(&new_run.element_hint)
    .bind(&new_run.note)
    .bind(&metadata)
    .execute(&mut *tx)
    .await
    .context("insert run_contexts row")?;

    insert_event(
        &mut *tx,
        &NewRunEvent {
            run_id: new_run.run_id.as_str(),
            event_type: "run_created",
            status_from: None,
            status_to: Some("queued"),
            payload: serde_json::json!({"route": new_run.route}),
        },
    )
    .await?;

    insert_audit_entry(
        &mut *tx,
        &NewAuditEntry {
            actor: new_run.created_by.as_deref().unwrap_or("system"),
            action: "run.create",
            payload: &serde_json::json!({"run_id": new_run.run_id.as_str()}),
            trace_id: new_run.trace_id.as_deref(),
            run_id: Some(new_run.run_id.as_str()),
            slot_id: None,
            commit_sha: None,
        },
    )
    .await?;

    tx.commit().await.context("commit insert_run tx")?;

    fetch_run(pool, &new_run.run_id).await
}

pub async fn fetch_run(pool: &PgPool, run_id: &RunId) -> Result<Run> {
    let row = sqlx::query(
        "SELECT run_id, title, prompt, status, route, slot_id, branch_name, worktree_path,
                commit_sha, parent_run_id, created_by, created_at, updated_at
         FROM runs WHERE run_id = $1",
    )
    .bind(run_id.as_str())
    .fetch_optional(pool)
    .await
    .context("fetch_run query")?
    .ok_or_else(|| anyhow!(CoreError::NotFound(format!("run {run_id} not found"))))?;

    row_to_run(row)
}

pub async fn list_runs(
    pool: &PgPool,
    status: Option<RunStatus>,
    route: Option<&str>,
    limit: i64,
    offset: i64,
) -> Result<Vec<Run>> {
    let rows = sqlx::query(
        "SELECT run_id, title, prompt, status, route, slot_id, branch_name, worktree_path,
                commit_sha, parent_run_id, created_by, created_at, updated_at
         FROM runs
         WHERE ($1::text IS NULL OR status = $1)
           AND ($2::text IS NULL OR route = $2)
         ORDER BY created_at DESC, run_id
         LIMIT $3 OFFSET $4",
    )
    .bind(status.map(|s| s.as_str()))
    .bind(route)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await
    .context("list_runs query")?;

    rows.into_iter().map(row_to_run).collect()
}

fn row_to_run(row: sqlx::postgres::PgRow) -> Result<Run> {
    let run_id_raw: String = row.try_get("run_id")?;
    let status_raw: String = row.try_get("status")?;
    let parent_raw: Option<String> = row.try_get("parent_run_id")?;

    Ok(Run {
        run_id: RunId::parse(&run_id_raw)
            .ok_or_else(|| anyhow!("invalid run_id stored in runs: {run_id_raw}"))?,
        title: row.try_get("title")?,
        prompt: row.try_get("prompt")?,
        status: RunStatus::parse(&status_raw)
            .ok_or_else(|| anyhow!("invalid status stored in runs: {status_raw}"))?,
        route: row.try_get("route")?,
        slot_id: row.try_get("slot_id")?,
        branch_name: row.try_get("branch_name")?,
        worktree_path: row.try_get("worktree_path")?,
        commit_sha: row.try_get("commit_sha")?,
        parent_run_id: parent_raw.and_then(|s| RunId::parse(&s)),
        created_by: row.try_get("created_by")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// The sole writer of `Run.status`. See module docs for the algorithm.
pub async fn transition(
    pool: &PgPool,
    run_id: &RunId,
    to_status: RunStatus,
    failure_reason_code: Option<FailureReasonCode>,
    payload: Option<serde_json::Value>,
) -> Result<Run, CoreError> {
    let mut tx = pool
        .begin()
        .await
        .map_err(|e| CoreError::Internal(e.to_string()))?;

    let row = sqlx::query(
        "SELECT status FROM runs WHERE run_id = $1 FOR UPDATE",
    )
    .bind(run_id.as_str())
    .fetch_optional(&mut *tx)
    .await
    .map_err(|e| CoreError::Internal(e.to_string()))?
    .ok_or_else(|| CoreError::NotFound(format!("run {run_id} not found")))?;

    let from_raw: String = row
        .try_get("status")
        .map_err(|e| CoreError::Internal(e.to_string()))?;
    let from = RunStatus::parse(&from_raw)
        .ok_or_else(|| CoreError::Internal(format!("invalid status in store: {from_raw}")))?;

    validate_transition(from, to_status, failure_reason_code).map_err(|e| match e {
        TransitionError::Terminal { .. } | TransitionError::NotAllowed { .. } => {
            CoreError::Conflict(e.to_string())
        }
        TransitionError::MissingFailureCode { .. } | TransitionError::UnexpectedFailureCode { .. } => {
            CoreError::Validation(e.to_string())
        }
    })?;

    sqlx::query("UPDATE runs SET status = $1, updated_at = now() WHERE run_id = $2")
        .bind(to_status.as_str())
        .bind(run_id.as_str())
        .execute(&mut *tx)
        .await
        .map_err(|e| CoreError::Internal(e.to_string()))?;

    let event_payload = payload.unwrap_or_else(|| serde_json::json!({}));
    let mut full_payload = event_payload.clone();
    if let Some(code) = failure_reason_code {
        full_payload["failure_reason_code"] = serde_json::Value::String(code.as_str().to_string());
    }

    insert_event(
        &mut *tx,
        &NewRunEvent {
            run_id: run_id.as_str(),
            event_type: "status_transition",
            status_from: Some(from.as_str()),
            status_to: Some(to_status.as_str()),
            payload: full_payload.clone(),
        },
    )
    .await
    .map_err(|e| CoreError::Internal(e.to_string()))?;

    insert_audit_entry(
        &mut *tx,
        &NewAuditEntry {
            actor: "state-machine",
            action: "run.transition",
            payload: &full_payload,
            trace_id: None,
            run_id: Some(run_id.as_str()),
            slot_id: None,
            commit_sha: None,
        },
    )
    .await
    .map_err(|e| CoreError::Internal(e.to_string()))?;

    tx.commit().await.map_err(|e| CoreError::Internal(e.to_string()))?;

    fetch_run(pool, run_id)
        .await
        .map_err(|e| CoreError::Internal(e.to_string()))
}

/// `retry(run_id)`: create a new run in `queued` with `parent_run_id` set,
/// copying prompt/route/context. Never mutates the parent.
pub async fn retry(pool: &PgPool, run_id: &RunId) -> Result<Run, CoreError> {
    let parent = fetch_run(pool, run_id)
        .await
        .map_err(|e| CoreError::Internal(e.to_string()))?;

    if !control_runstate::can_retry_from(parent.status) {
        return Err(CoreError::Conflict(format!(
            "run {run_id} is in {}; retry is only allowed from failed or expired",
            parent.status
        )));
    }

    let child = NewRun {
        run_id: RunId::generate(),
        title: parent.title.clone(),
        prompt: parent.prompt.clone(),
        route: parent.route.clone(),
        parent_run_id: Some(run_id.clone()),
        created_by: parent.created_by.clone(),
        page_title: None,
        element_hint: None,
        note: None,
        trace_id: None,
    };

    insert_run(pool, &child)
        .await
        .map_err(|e| CoreError::Internal(e.to_string()))
}

/// `cancel(run_id)`: transitions to `canceled` from any non-terminal
/// state. Does not itself release a slot lease — the caller (Control API
/// handler) composes this with `control_leases::release`.
pub async fn cancel(pool: &PgPool, run_id: &RunId, reason: Option<String>) -> Result<Run, CoreError> {
    let run = fetch_run(pool, run_id)
        .await
        .map_err(|e| CoreError::Internal(e.to_string()))?;

    if !control_runstate::can_cancel_from(run.status) {
        return Err(CoreError::Conflict(format!(
            "run {run_id} is terminal ({}); cannot cancel",
            run.status
        )));
    }

    let payload = reason.map(|r| serde_json::json!({"reason": r}));
    transition(pool, run_id, RunStatus::Canceled, None, payload).await
}

/// Record `Run.slot_id`, `branch_name`, `worktree_path` as set by the lease
/// / worktree managers. Does not touch `status`. Takes any sqlx executor —
/// callers pass `&mut *tx` so this lands in the same transaction as the
/// lease-state update it accompanies; a separate autocommitted write here
/// would let a crash leave `runs.slot_id` set with no matching lease row.
pub async fn set_allocation_fields<'e, E>(
    exec: E,
    run_id: &RunId,
    slot_id: Option<&str>,
    branch_name: Option<&str>,
    worktree_path: Option<&str>,
) -> Result<()>
where
    E: sqlx::Executor<'e, Database = sqlx::Postgres>,
{
    sqlx::query(
        "UPDATE runs SET slot_id = $1, branch_name = $2, worktree_path = $3, updated_at = now()
         WHERE run_id = $4",
    )
    .bind(slot_id)
    .bind(branch_name)
    .bind(worktree_path)
    .bind(run_id.as_str())
    .execute(exec)
    .await
    .context("set_allocation_fields")?;
    Ok(())
}

pub async fn set_commit_sha(pool: &PgPool, run_id: &RunId, commit_sha: &str) -> Result<()> {
    sqlx::query("UPDATE runs SET commit_sha = $1, updated_at = now() WHERE run_id = $2")
        .bind(commit_sha)
        .bind(run_id.as_str())
        .execute(pool)
        .await
        .context("set_commit_sha")?;
    Ok(())
}

pub type RunTimestamp = DateTime<Utc>;
