//! Axum router and all HTTP handlers for control-daemon.
//!
//! `build_router` is the single entry point; `main.rs` calls it and attaches
//! middleware layers. Handlers are `pub(crate)` so the scenario tests in
//! `tests/` can compose the router directly.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use control_orchestrator::AllocationOutcome;
use control_runstate::allowed_targets;
use control_schemas::{ApprovalDecision, CoreError, FailureReasonCode, Run, RunId, RunStatus};

use crate::api_types::*;
use crate::state::AppState;

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/runs/contract", get(runs_contract))
        .route("/api/slots/contract", get(slots_contract))
        .route("/api/runs", post(create_run).get(list_runs))
        .route("/api/runs/:id", get(get_run))
        .route("/api/runs/:id/transition", post(transition_run))
        .route("/api/runs/:id/cancel", post(cancel_run))
        .route("/api/runs/:id/retry", post(retry_run))
        .route("/api/runs/:id/expire", post(expire_run))
        .route("/api/runs/:id/resume", post(resume_run))
        .route("/api/runs/:id/events", get(list_run_events))
        .route("/api/runs/:id/checks", get(list_run_checks))
        .route("/api/runs/:id/approvals", get(list_run_approvals))
        .route("/api/runs/:id/artifacts", get(list_run_artifacts))
        .route("/api/runs/:id/approve", post(approve_run))
        .route("/api/runs/:id/reject", post(reject_run))
        .route("/api/slots", get(list_slots))
        .route("/api/slots/acquire", post(acquire_slot))
        .route("/api/slots/:slot_id/heartbeat", post(heartbeat_slot))
        .route("/api/slots/:slot_id/release", post(release_slot))
        .route("/api/slots/reap-expired", post(reap_expired))
        .route("/api/worktrees", get(list_worktrees))
        .route("/api/worktrees/assign", post(assign_worktree))
        .route("/api/worktrees/:slot_id/cleanup", post(cleanup_worktree))
        .route("/api/previewdb/reset", post(reset_preview_db))
        .route("/api/allocate", post(allocate))
        .route("/api/releases", get(list_releases))
        .route("/api/releases/:id", get(get_release))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

struct AppError(CoreError);

impl From<CoreError> for AppError {
    fn from(e: CoreError) -> Self {
        AppError(e)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::Conflict(_) | CoreError::LeaseMismatch(_) => StatusCode::CONFLICT,
            CoreError::Validation(_) | CoreError::UnsafeDatabaseTarget(_) => StatusCode::BAD_REQUEST,
            CoreError::AllocationWaiting { .. } => StatusCode::OK,
            CoreError::DriverFailed(_) => StatusCode::BAD_GATEWAY,
            CoreError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            CoreError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorResponse {
            kind: self.0.kind().to_string(),
            reason: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

fn parse_run_id(raw: &str) -> Result<RunId, AppError> {
    RunId::parse(raw).ok_or_else(|| AppError(CoreError::Validation(format!("invalid run_id: {raw}"))))
}

// ---------------------------------------------------------------------------
// GET /healthz
// ---------------------------------------------------------------------------

async fn healthz(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    let db_reachable = control_db::status(&st.pool).await.map(|s| s.ok).unwrap_or(false);
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: db_reachable,
            service: "control-daemon",
            version: env!("CARGO_PKG_VERSION"),
            db_reachable,
        }),
    )
}

// ---------------------------------------------------------------------------
// Contracts
// ---------------------------------------------------------------------------

async fn runs_contract() -> impl IntoResponse {
    use RunStatus::*;
    let table: Vec<_> = [
        Queued, Planning, Editing, Testing, PreviewReady, NeedsApproval, Approved, Merging, Deploying, Merged,
        Failed, Canceled, Expired,
    ]
    .into_iter()
    .map(|s| {
        serde_json::json!({
            "from": s.as_str(),
            "to": allowed_targets(s).iter().map(|t| t.as_str()).collect::<Vec<_>>(),
            "terminal": s.is_terminal(),
        })
    })
    .collect();

    Json(serde_json::json!({"transitions": table}))
}

async fn slots_contract(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "slot_ids": st.config.slot_ids,
        "slot_lease_ttl_seconds": st.config.slot_lease_ttl_seconds,
        "worktree_root": st.config.worktree_root,
        "preview_db_name_template": st.config.preview_db_name_template,
        "merge_gate_recheck_required": st.config.merge_gate_recheck_required,
        "config_hash": st.config_hash,
    }))
}

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

async fn create_run(State(st): State<Arc<AppState>>, Json(req): Json<CreateRunRequest>) -> Result<Json<Run>, AppError> {
    let parent_run_id = req
        .parent_run_id
        .as_deref()
        .map(parse_run_id)
        .transpose()?;

    let run = control_db::runs::insert_run(
        &st.pool,
        &control_db::runs::NewRun {
            run_id: RunId::generate(),
            title: req.title,
            prompt: req.prompt,
            route: req.route,
            parent_run_id,
            created_by: req.created_by,
            page_title: req.page_title,
            element_hint: req.element_hint,
            note: req.note,
            trace_id: None,
        },
    )
    .await
    .map_err(|e| AppError(CoreError::Internal(e.to_string())))?;

    Ok(Json(run))
}

async fn list_runs(State(st): State<Arc<AppState>>, Query(q): Query<ListRunsQuery>) -> Result<Json<Vec<Run>>, AppError> {
    let runs = control_db::runs::list_runs(
        &st.pool,
        q.status,
        q.route.as_deref(),
        q.limit.unwrap_or(50),
        q.offset.unwrap_or(0),
    )
    .await
    .map_err(|e| AppError(CoreError::Internal(e.to_string())))?;
    Ok(Json(runs))
}

async fn get_run(State(st): State<Arc<AppState>>, Path(id): Path<String>) -> Result<Json<Run>, AppError> {
    let run_id = parse_run_id(&id)?;
    let run = control_db::runs::fetch_run(&st.pool, &run_id)
        .await
        .map_err(|e| AppError(CoreError::NotFound(e.to_string())))?;
    Ok(Json(run))
}

async fn transition_run(
    State(st): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<TransitionRequest>,
) -> Result<Json<Run>, AppError> {
    let run_id = parse_run_id(&id)?;
    let run = control_db::runs::transition(&st.pool, &run_id, req.to_status, req.failure_reason_code, req.payload).await?;
    Ok(Json(run))
}

async fn cancel_run(
    State(st): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<CancelRequest>,
) -> Result<Json<Run>, AppError> {
    let run_id = parse_run_id(&id)?;
    let run = control_db::runs::cancel(&st.pool, &run_id, req.reason).await?;
    Ok(Json(run))
}

async fn retry_run(State(st): State<Arc<AppState>>, Path(id): Path<String>) -> Result<Json<Run>, AppError> {
    let run_id = parse_run_id(&id)?;
    let run = control_db::runs::retry(&st.pool, &run_id).await?;
    Ok(Json(run))
}

/// Administrative forced-expiry, distinct from the automatic path driven by
/// `reap_expired` — for a run that must be expired without an associated
/// lease timing out (e.g. an operator closing out a stale preview).
async fn expire_run(
    State(st): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<ExpireRequest>,
) -> Result<Json<Run>, AppError> {
    let run_id = parse_run_id(&id)?;
    let run = control_db::runs::fetch_run(&st.pool, &run_id)
        .await
        .map_err(|e| AppError(CoreError::NotFound(e.to_string())))?;

    let run = if allowed_targets(run.status).contains(&RunStatus::Expired) {
        control_db::runs::transition(&st.pool, &run_id, RunStatus::Expired, None, None).await?
    } else {
        control_db::runs::transition(
            &st.pool,
            &run_id,
            RunStatus::Failed,
            Some(req.failure_reason_code.unwrap_or(FailureReasonCode::PreviewExpired)),
            None,
        )
        .await?
    };
    Ok(Json(run))
}

/// Re-attempt allocation for a run already `queued` (or still waiting on a
/// slot) without creating a new run — thin wrapper over the allocation
/// orchestrator, exposed so a worker polling after a `WAITING_FOR_SLOT`
/// result can simply retry the same call.
async fn resume_run(
    State(st): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<ResumeRequest>,
) -> Result<Json<AllocationOutcome>, AppError> {
    let run_id = parse_run_id(&id)?;
    let outcome = st
        .orchestrator()
        .allocate(control_orchestrator::AllocateRequest {
            run_id: &run_id,
            existing_branch_name: req.existing_branch_name.as_deref(),
            strategy: req.strategy.unwrap_or(control_schemas::ResetStrategy::Seed),
            seed_version: req.seed_version.as_deref(),
            snapshot_version: req.snapshot_version.as_deref(),
            force: req.force,
        })
        .await?;
    Ok(Json(outcome))
}

async fn list_run_events(
    State(st): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<control_schemas::RunEvent>>, AppError> {
    let run_id = parse_run_id(&id)?;
    let events = control_db::events::list_events(&st.pool, run_id.as_str())
        .await
        .map_err(|e| AppError(CoreError::Internal(e.to_string())))?;
    Ok(Json(events))
}

async fn list_run_checks(
    State(st): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<control_schemas::ValidationCheck>>, AppError> {
    let run_id = parse_run_id(&id)?;
    let checks = control_db::checks::list_for_run(&st.pool, &run_id)
        .await
        .map_err(|e| AppError(CoreError::Internal(e.to_string())))?;
    Ok(Json(checks))
}

async fn list_run_approvals(
    State(st): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<control_schemas::Approval>>, AppError> {
    let run_id = parse_run_id(&id)?;
    let approvals = control_db::approvals::list_for_run(&st.pool, &run_id)
        .await
        .map_err(|e| AppError(CoreError::Internal(e.to_string())))?;
    Ok(Json(approvals))
}

async fn list_run_artifacts(
    State(st): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<control_schemas::RunArtifact>>, AppError> {
    let run_id = parse_run_id(&id)?;
    let artifacts = control_db::artifacts::list_for_run(&st.pool, &run_id)
        .await
        .map_err(|e| AppError(CoreError::Internal(e.to_string())))?;
    Ok(Json(artifacts))
}

/// Grants approval, transitions `needs_approval -> approved`, and then
/// synchronously drives the run through the Merge/Deploy Gate — the same
/// sequence the happy-path scenario describes as one continuous handoff
/// from approval to a deployed release.
async fn approve_run(
    State(st): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<ApproveRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let run_id = parse_run_id(&id)?;

    let approval = control_db::approvals::record_decision(
        &st.pool,
        &control_db::approvals::NewApproval {
            run_id: &run_id,
            reviewer_id: req.reviewer_id.as_deref(),
            decision: ApprovalDecision::Approved,
            reason: req.reason.as_deref(),
            failure_reason_code: None,
        },
    )
    .await
    .map_err(|e| AppError(CoreError::Internal(e.to_string())))?;

    control_db::runs::transition(&st.pool, &run_id, RunStatus::Approved, None, None).await?;

    let gate_outcome = st.deploy_gate().finalize(&run_id).await?;

    Ok(Json(serde_json::json!({"approval": approval, "gate_outcome": gate_outcome})))
}

async fn reject_run(
    State(st): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<RejectRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let run_id = parse_run_id(&id)?;
    let code = req.failure_reason_code.unwrap_or(FailureReasonCode::PolicyRejected);

    let approval = control_db::approvals::record_decision(
        &st.pool,
        &control_db::approvals::NewApproval {
            run_id: &run_id,
            reviewer_id: req.reviewer_id.as_deref(),
            decision: ApprovalDecision::Rejected,
            reason: req.reason.as_deref(),
            failure_reason_code: Some(code),
        },
    )
    .await
    .map_err(|e| AppError(CoreError::Internal(e.to_string())))?;

    let run = control_db::runs::transition(&st.pool, &run_id, RunStatus::Failed, Some(code), None).await?;

    Ok(Json(serde_json::json!({"approval": approval, "run": run})))
}

// ---------------------------------------------------------------------------
// Slots
// ---------------------------------------------------------------------------

async fn list_slots(State(st): State<Arc<AppState>>) -> Result<Json<Vec<control_schemas::SlotLease>>, AppError> {
    Ok(Json(st.leases().list_leases().await?))
}

async fn acquire_slot(
    State(st): State<Arc<AppState>>,
    Json(req): Json<AcquireRequest>,
) -> Result<Json<control_leases::AcquireOutcome>, AppError> {
    let run_id = parse_run_id(&req.run_id)?;
    Ok(Json(st.leases().acquire(&run_id, req.force).await?))
}

async fn heartbeat_slot(
    State(st): State<Arc<AppState>>,
    Path(slot_id): Path<String>,
    Json(req): Json<HeartbeatRequest>,
) -> Result<StatusCode, AppError> {
    let run_id = parse_run_id(&req.run_id)?;
    st.leases().heartbeat(&slot_id, &run_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn release_slot(
    State(st): State<Arc<AppState>>,
    Path(slot_id): Path<String>,
    Json(req): Json<ReleaseRequest>,
) -> Result<StatusCode, AppError> {
    let run_id = req.run_id.as_deref().map(parse_run_id).transpose()?;
    st.leases().release(&slot_id, run_id.as_ref()).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn reap_expired(
    State(st): State<Arc<AppState>>,
    Json(req): Json<ReapExpiredRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let policy = req.expiry_transition_failed.unwrap_or(st.config.expiry_transition_failed);
    let reaped = st.leases().reap_expired(policy).await?;
    Ok(Json(serde_json::json!({"reaped": reaped})))
}

// ---------------------------------------------------------------------------
// Worktrees
// ---------------------------------------------------------------------------

async fn list_worktrees(State(st): State<Arc<AppState>>) -> Result<Json<Vec<control_schemas::SlotWorktreeBinding>>, AppError> {
    let bindings = control_db::worktree::list_bindings(&st.pool).await?;
    Ok(Json(bindings))
}

async fn assign_worktree(
    State(st): State<Arc<AppState>>,
    Json(req): Json<AssignWorktreeRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let run_id = parse_run_id(&req.run_id)?;
    let outcome = st
        .worktrees()
        .assign(&run_id, &req.slot_id, req.existing_branch_name.as_deref())
        .await?;
    Ok(Json(serde_json::json!({
        "branch_name": outcome.branch_name,
        "worktree_path": outcome.worktree_path,
        "reused": outcome.reused,
    })))
}

async fn cleanup_worktree(
    State(st): State<Arc<AppState>>,
    Path(slot_id): Path<String>,
    Json(req): Json<CleanupWorktreeRequest>,
) -> Result<StatusCode, AppError> {
    let run_id = req.run_id.as_deref().map(parse_run_id).transpose()?;
    st.worktrees().cleanup(&slot_id, run_id.as_ref()).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Preview DB
// ---------------------------------------------------------------------------

async fn reset_preview_db(
    State(st): State<Arc<AppState>>,
    Json(req): Json<ResetPreviewDbRequest>,
) -> Result<Json<control_schemas::PreviewDbReset>, AppError> {
    let run_id = parse_run_id(&req.run_id)?;
    let reset = st
        .previewdb()
        .reset_and_seed(
            &run_id,
            &req.slot_id,
            req.strategy,
            req.seed_version.as_deref(),
            req.snapshot_version.as_deref(),
            req.dry_run,
        )
        .await?;
    Ok(Json(reset))
}

// ---------------------------------------------------------------------------
// Allocation (ambient composition of slots + worktrees + previewdb)
// ---------------------------------------------------------------------------

async fn allocate(
    State(st): State<Arc<AppState>>,
    Json(req): Json<AllocateRequest>,
) -> Result<Json<AllocationOutcome>, AppError> {
    let run_id = parse_run_id(&req.run_id)?;
    let outcome = st
        .orchestrator()
        .allocate(control_orchestrator::AllocateRequest {
            run_id: &run_id,
            existing_branch_name: req.existing_branch_name.as_deref(),
            strategy: req.strategy,
            seed_version: req.seed_version.as_deref(),
            snapshot_version: req.snapshot_version.as_deref(),
            force: req.force,
        })
        .await?;
    Ok(Json(outcome))
}

// ---------------------------------------------------------------------------
// Releases
// ---------------------------------------------------------------------------

#[derive(serde::Deserialize)]
struct PageQuery {
    limit: Option<i64>,
    offset: Option<i64>,
}

async fn list_releases(
    State(st): State<Arc<AppState>>,
    Query(q): Query<PageQuery>,
) -> Result<Json<Vec<control_schemas::Release>>, AppError> {
    let releases = control_db::releases::list_releases(&st.pool, q.limit.unwrap_or(50), q.offset.unwrap_or(0))
        .await
        .map_err(|e| AppError(CoreError::Internal(e.to_string())))?;
    Ok(Json(releases))
}

async fn get_release(
    State(st): State<Arc<AppState>>,
    Path(release_id): Path<String>,
) -> Result<Json<control_schemas::Release>, AppError> {
    let release = control_db::releases::fetch_release(&st.pool, &release_id)
        .await
        .map_err(|e| AppError(CoreError::NotFound(e.to_string())))?;
    Ok(Json(release))
}
