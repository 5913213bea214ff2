//! `audit_log` — the append-only audit trail. Every mutating operation in
//! every other module inserts exactly one row here, in the same
//! transaction as its own table writes.

use anyhow::{Context, Result};
use serde_json::Value;
use sha2::{Digest, Sha256};

pub struct NewAuditEntry<'a> {
    pub actor: &'a str,
    pub action: &'a str,
    pub payload: &'a Value,
    pub trace_id: Option<&'a str>,
    pub run_id: Option<&'a str>,
    pub slot_id: Option<&'a str>,
    pub commit_sha: Option<&'a str>,
}

pub async fn insert_audit_entry<'e, E>(exec: E, entry: &NewAuditEntry<'_>) -> Result<()>
where
    E: sqlx::Executor<'e, Database = sqlx::Postgres>,
{
    let payload_hash = hash_payload(entry.payload);

    sqlx::query(
        "INSERT INTO audit_log (actor, action, payload_hash, trace_id, run_id, slot_id, commit_sha)
         VALUES ($1, $2, $3, $4, $5, $6, $7)",
    )
    .bind(entry.actor)
    .bind(entry.action)
    .bind(&payload_hash)
    .bind(entry.trace_id)
    .bind(entry.run_id)
    .bind(entry.slot_id)
    .bind(entry.commit_sha)
    .execute(exec)
    .await
    .context("insert audit_log row")?;

    Ok(())
}

fn hash_payload(payload: &Value) -> String {
    let canonical = serde_json::to_string(payload).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}
