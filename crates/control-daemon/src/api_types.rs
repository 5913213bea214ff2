//! Request and response bodies for every control-daemon HTTP endpoint.
//!
//! No business logic lives here; these types are just the JSON shape at
//! the wire boundary.

use serde::{Deserialize, Serialize};

use control_schemas::{FailureReasonCode, ResetStrategy, RunStatus};

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: &'static str,
    pub version: &'static str,
    pub db_reachable: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub kind: String,
    pub reason: String,
}

// --- Runs -------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct CreateRunRequest {
    pub prompt: String,
    pub route: String,
    pub title: Option<String>,
    pub created_by: Option<String>,
    pub page_title: Option<String>,
    pub element_hint: Option<String>,
    pub note: Option<String>,
    pub parent_run_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListRunsQuery {
    pub status: Option<RunStatus>,
    pub route: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransitionRequest {
    pub to_status: RunStatus,
    pub failure_reason_code: Option<FailureReasonCode>,
    pub payload: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CancelRequest {
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ExpireRequest {
    pub failure_reason_code: Option<FailureReasonCode>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ResumeRequest {
    pub existing_branch_name: Option<String>,
    pub strategy: Option<ResetStrategy>,
    pub seed_version: Option<String>,
    pub snapshot_version: Option<String>,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApproveRequest {
    pub reviewer_id: Option<String>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RejectRequest {
    pub reviewer_id: Option<String>,
    pub reason: Option<String>,
    pub failure_reason_code: Option<FailureReasonCode>,
}

// --- Slots --------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct AcquireRequest {
    pub run_id: String,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatRequest {
    pub run_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseRequest {
    pub run_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ReapExpiredRequest {
    pub expiry_transition_failed: Option<bool>,
}

// --- Worktrees ------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct AssignWorktreeRequest {
    pub run_id: String,
    pub slot_id: String,
    pub existing_branch_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CleanupWorktreeRequest {
    pub run_id: Option<String>,
}

// --- Preview DB -----------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ResetPreviewDbRequest {
    pub run_id: String,
    pub slot_id: String,
    pub strategy: ResetStrategy,
    pub seed_version: Option<String>,
    pub snapshot_version: Option<String>,
    #[serde(default)]
    pub dry_run: bool,
}

// --- Allocation orchestrator (ambient composition endpoint) ---------------

#[derive(Debug, Clone, Deserialize)]
pub struct AllocateRequest {
    pub run_id: String,
    pub existing_branch_name: Option<String>,
    pub strategy: ResetStrategy,
    pub seed_version: Option<String>,
    pub snapshot_version: Option<String>,
    #[serde(default)]
    pub force: bool,
}
