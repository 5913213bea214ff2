//! Slot Lease Manager.
//!
//! A thin policy wrapper over [`control_db::leases`]: holds the configured
//! slot set and TTL so callers never have to thread that configuration
//! through every call site by hand.

use control_db::leases;
use control_schemas::{CoreError, RunId, SlotLease};
use sqlx::PgPool;

pub use control_db::leases::AcquireOutcome;

pub struct SlotLeaseManager {
    pool: PgPool,
    slot_ids: Vec<String>,
    ttl_seconds: i64,
}

impl SlotLeaseManager {
    pub fn new(pool: PgPool, slot_ids: Vec<String>, ttl_seconds: i64) -> Self {
        Self {
            pool,
            slot_ids,
            ttl_seconds,
        }
    }

    pub fn slot_ids(&self) -> &[String] {
        &self.slot_ids
    }

    pub async fn acquire(&self, run_id: &RunId, force: bool) -> Result<AcquireOutcome, CoreError> {
        leases::acquire(&self.pool, run_id, &self.slot_ids, self.ttl_seconds, force).await
    }

    pub async fn heartbeat(&self, slot_id: &str, run_id: &RunId) -> Result<(), CoreError> {
        leases::heartbeat(&self.pool, slot_id, run_id, self.ttl_seconds).await
    }

    pub async fn release(&self, slot_id: &str, run_id: Option<&RunId>) -> Result<(), CoreError> {
        leases::release(&self.pool, slot_id, run_id).await
    }

    /// See Open Question #1 resolution (DESIGN.md): `expiry_transition_failed`
    /// picks between transitioning reaped runs to `expired` or to
    /// `failed(PREVIEW_EXPIRED)`.
    pub async fn reap_expired(&self, expiry_transition_failed: bool) -> Result<u64, CoreError> {
        leases::reap_expired(&self.pool, expiry_transition_failed).await
    }

    pub async fn list_leases(&self) -> Result<Vec<SlotLease>, CoreError> {
        leases::list_leases(&self.pool).await
    }
}
