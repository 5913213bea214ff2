//! Shared data-transfer types for the control plane: the row shapes of
//! every table in the store, the wire payloads of the event/audit log, and
//! the error taxonomy every component surfaces to its callers.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod ids;

pub use ids::RunId;

/// The 13 canonical run states. Terminal: `Merged`, `Failed`, `Canceled`, `Expired`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Planning,
    Editing,
    Testing,
    PreviewReady,
    NeedsApproval,
    Approved,
    Merging,
    Deploying,
    Merged,
    Failed,
    Canceled,
    Expired,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Planning => "planning",
            RunStatus::Editing => "editing",
            RunStatus::Testing => "testing",
            RunStatus::PreviewReady => "preview_ready",
            RunStatus::NeedsApproval => "needs_approval",
            RunStatus::Approved => "approved",
            RunStatus::Merging => "merging",
            RunStatus::Deploying => "deploying",
            RunStatus::Merged => "merged",
            RunStatus::Failed => "failed",
            RunStatus::Canceled => "canceled",
            RunStatus::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Merged | RunStatus::Failed | RunStatus::Canceled | RunStatus::Expired
        )
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "queued" => RunStatus::Queued,
            "planning" => RunStatus::Planning,
            "editing" => RunStatus::Editing,
            "testing" => RunStatus::Testing,
            "preview_ready" => RunStatus::PreviewReady,
            "needs_approval" => RunStatus::NeedsApproval,
            "approved" => RunStatus::Approved,
            "merging" => RunStatus::Merging,
            "deploying" => RunStatus::Deploying,
            "merged" => RunStatus::Merged,
            "failed" => RunStatus::Failed,
            "canceled" => RunStatus::Canceled,
            "expired" => RunStatus::Expired,
            _ => return None,
        })
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The standard failure reason codes. Required on every transition to `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReasonCode {
    WaitingForSlot,
    ValidationFailed,
    ChecksFailed,
    MergeConflict,
    MigrationFailed,
    DeployHealthcheckFailed,
    DeployPushFailed,
    PreviewPublishFailed,
    AgentTimeout,
    AgentCanceled,
    PreviewExpired,
    PolicyRejected,
    UnknownError,
}

impl FailureReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReasonCode::WaitingForSlot => "WAITING_FOR_SLOT",
            FailureReasonCode::ValidationFailed => "VALIDATION_FAILED",
            FailureReasonCode::ChecksFailed => "CHECKS_FAILED",
            FailureReasonCode::MergeConflict => "MERGE_CONFLICT",
            FailureReasonCode::MigrationFailed => "MIGRATION_FAILED",
            FailureReasonCode::DeployHealthcheckFailed => "DEPLOY_HEALTHCHECK_FAILED",
            FailureReasonCode::DeployPushFailed => "DEPLOY_PUSH_FAILED",
            FailureReasonCode::PreviewPublishFailed => "PREVIEW_PUBLISH_FAILED",
            FailureReasonCode::AgentTimeout => "AGENT_TIMEOUT",
            FailureReasonCode::AgentCanceled => "AGENT_CANCELED",
            FailureReasonCode::PreviewExpired => "PREVIEW_EXPIRED",
            FailureReasonCode::PolicyRejected => "POLICY_REJECTED",
            FailureReasonCode::UnknownError => "UNKNOWN_ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "WAITING_FOR_SLOT" => FailureReasonCode::WaitingForSlot,
            "VALIDATION_FAILED" => FailureReasonCode::ValidationFailed,
            "CHECKS_FAILED" => FailureReasonCode::ChecksFailed,
            "MERGE_CONFLICT" => FailureReasonCode::MergeConflict,
            "MIGRATION_FAILED" => FailureReasonCode::MigrationFailed,
            "DEPLOY_HEALTHCHECK_FAILED" => FailureReasonCode::DeployHealthcheckFailed,
            "DEPLOY_PUSH_FAILED" => FailureReasonCode::DeployPushFailed,
            "PREVIEW_PUBLISH_FAILED" => FailureReasonCode::PreviewPublishFailed,
            "AGENT_TIMEOUT" => FailureReasonCode::AgentTimeout,
            "AGENT_CANCELED" => FailureReasonCode::AgentCanceled,
            "PREVIEW_EXPIRED" => FailureReasonCode::PreviewExpired,
            "POLICY_REJECTED" => FailureReasonCode::PolicyRejected,
            "UNKNOWN_ERROR" => FailureReasonCode::UnknownError,
            _ => return None,
        })
    }
}

impl fmt::Display for FailureReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub run_id: RunId,
    pub title: Option<String>,
    pub prompt: String,
    pub status: RunStatus,
    pub route: String,
    pub slot_id: Option<String>,
    pub branch_name: Option<String>,
    pub worktree_path: Option<String>,
    pub commit_sha: Option<String>,
    pub parent_run_id: Option<RunId>,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunContext {
    pub run_id: RunId,
    pub route: String,
    pub page_title: Option<String>,
    pub element_hint: Option<String>,
    pub note: Option<String>,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    pub id: i64,
    pub run_id: RunId,
    pub event_type: String,
    pub status_from: Option<String>,
    pub status_to: Option<String>,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Pending,
    Running,
    Passed,
    Failed,
}

impl CheckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckStatus::Pending => "pending",
            CheckStatus::Running => "running",
            CheckStatus::Passed => "passed",
            CheckStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationCheck {
    pub id: i64,
    pub run_id: RunId,
    pub check_name: String,
    pub status: CheckStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub artifact_uri: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunArtifact {
    pub id: i64,
    pub run_id: RunId,
    pub artifact_type: String,
    pub uri: String,
    pub payload: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseState {
    Leased,
    Released,
    Expired,
}

impl LeaseState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeaseState::Leased => "leased",
            LeaseState::Released => "released",
            LeaseState::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "leased" => LeaseState::Leased,
            "released" => LeaseState::Released,
            "expired" => LeaseState::Expired,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotLease {
    pub slot_id: String,
    pub run_id: Option<RunId>,
    pub lease_state: LeaseState,
    pub leased_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingState {
    Active,
    Released,
}

impl BindingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BindingState::Active => "active",
            BindingState::Released => "released",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingAction {
    Assigned,
    Reused,
    CleanedUp,
}

impl BindingAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            BindingAction::Assigned => "assigned",
            BindingAction::Reused => "reused",
            BindingAction::CleanedUp => "cleaned_up",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotWorktreeBinding {
    pub slot_id: String,
    pub run_id: Option<RunId>,
    pub branch_name: Option<String>,
    pub worktree_path: Option<String>,
    pub binding_state: BindingState,
    pub last_action: BindingAction,
    pub assigned_at: Option<DateTime<Utc>>,
    pub released_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetStrategy {
    Seed,
    Snapshot,
}

impl ResetStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResetStrategy::Seed => "seed",
            ResetStrategy::Snapshot => "snapshot",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "seed" => ResetStrategy::Seed,
            "snapshot" => ResetStrategy::Snapshot,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetStatus {
    Applied,
    Rejected,
    Failed,
    DryRun,
}

impl ResetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResetStatus::Applied => "applied",
            ResetStatus::Rejected => "rejected",
            ResetStatus::Failed => "failed",
            ResetStatus::DryRun => "dry_run",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviewDbReset {
    pub id: i64,
    pub run_id: RunId,
    pub slot_id: String,
    pub db_name: String,
    pub strategy: ResetStrategy,
    pub seed_version: Option<String>,
    pub snapshot_version: Option<String>,
    pub reset_status: ResetStatus,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approved,
    Rejected,
}

impl ApprovalDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalDecision::Approved => "approved",
            ApprovalDecision::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Approval {
    pub id: i64,
    pub run_id: RunId,
    pub reviewer_id: Option<String>,
    pub decision: ApprovalDecision,
    pub reason: Option<String>,
    pub failure_reason_code: Option<FailureReasonCode>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseStatus {
    Deployed,
    Replaced,
    DeployFailed,
}

impl ReleaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReleaseStatus::Deployed => "deployed",
            ReleaseStatus::Replaced => "replaced",
            ReleaseStatus::DeployFailed => "deploy_failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Release {
    pub release_id: String,
    pub commit_sha: String,
    pub status: ReleaseStatus,
    pub migration_marker: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLog {
    pub id: i64,
    pub actor: String,
    pub action: String,
    pub payload_hash: String,
    pub trace_id: Option<String>,
    pub run_id: Option<RunId>,
    pub slot_id: Option<String>,
    pub commit_sha: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Error taxonomy surfaced by every component operation. `allocation_waiting`
/// is not an error condition in the usual sense — it is the typed "still
/// waiting" result of `acquire` — but it rides the same channel so callers
/// have one place to match on outcomes.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("validation: {0}")]
    Validation(String),

    #[error("unsafe database target: {0}")]
    UnsafeDatabaseTarget(String),

    #[error("lease mismatch: {0}")]
    LeaseMismatch(String),

    #[error("allocation waiting: {reason}")]
    AllocationWaiting {
        reason: FailureReasonCode,
        occupied_slots: Vec<String>,
    },

    #[error("driver failed: {0}")]
    DriverFailed(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("internal: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::NotFound(_) => "not_found",
            CoreError::Conflict(_) => "conflict",
            CoreError::Validation(_) => "validation",
            CoreError::UnsafeDatabaseTarget(_) => "unsafe_database_target",
            CoreError::LeaseMismatch(_) => "lease_mismatch",
            CoreError::AllocationWaiting { .. } => "allocation_waiting",
            CoreError::DriverFailed(_) => "driver_failed",
            CoreError::Timeout(_) => "timeout",
            CoreError::Internal(_) => "internal",
        }
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => CoreError::NotFound("row not found".to_string()),
            other => CoreError::Internal(other.to_string()),
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
