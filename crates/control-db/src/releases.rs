//! `releases` — the current and historical deployed commits, as tracked by
//! the Merge/Deploy Gate. A successful deploy marks the previous `deployed`
//! row `replaced` and inserts a new `deployed` row in the same transaction,
//! so `current_release` is always well-defined by a single `WHERE status =
//! 'deployed'` query.

use anyhow::{anyhow, Context, Result};
use control_schemas::{Release, ReleaseStatus};
use sqlx::{PgPool, Row};

use crate::audit::{insert_audit_entry, NewAuditEntry};

pub async fn current_release(pool: &PgPool) -> Result<Option<Release>> {
    let row = sqlx::query(
        "SELECT release_id, commit_sha, status, migration_marker, created_at, updated_at
         FROM releases WHERE status = 'deployed' ORDER BY updated_at DESC LIMIT 1",
    )
    .fetch_optional(pool)
    .await
    .context("current_release query")?;

    row.map(row_to_release).transpose()
}

/// Record a successful deploy: retire whatever was `deployed` as `replaced`
/// and insert the new release row as `deployed`. Both writes land in one
/// transaction so `current_release` is never ambiguous mid-deploy.
pub async fn record_deployed(pool: &PgPool, release_id: &str, commit_sha: &str, migration_marker: Option<&str>) -> Result<Release> {
    let mut tx = pool.begin().await.context("begin record_deployed tx")?;

    sqlx::query("UPDATE releases SET status = 'replaced', updated_at = now() WHERE status = 'deployed'")
        .execute(&mut *tx)
        .await
        .context("retire previous release")?;

    let row = sqlx::query(
        "INSERT INTO releases (release_id, commit_sha, status, migration_marker)
         VALUES ($1, $2, 'deployed', $3)
         RETURNING release_id, commit_sha, status, migration_marker, created_at, updated_at",
    )
    .bind(release_id)
    .bind(commit_sha)
    .bind(migration_marker)
    .fetch_one(&mut *tx)
    .await
    .context("insert releases row")?;

    insert_audit_entry(
        &mut *tx,
        &NewAuditEntry {
            actor: "deploy-gate",
            action: "release.deploy",
            payload: &serde_json::json!({"release_id": release_id, "commit_sha": commit_sha}),
            trace_id: None,
            run_id: None,
            slot_id: None,
            commit_sha: Some(commit_sha),
        },
    )
    .await
    .context("insert release audit entry")?;

    tx.commit().await.context("commit record_deployed tx")?;

    row_to_release(row)
}

/// Record a failed deploy without touching which release is `deployed` —
/// the previous release stays live.
pub async fn record_deploy_failed(pool: &PgPool, release_id: &str, commit_sha: &str) -> Result<Release> {
    let mut tx = pool.begin().await.context("begin record_deploy_failed tx")?;

    let row = sqlx::query(
        "INSERT INTO releases (release_id, commit_sha, status, migration_marker)
         VALUES ($1, $2, 'deploy_failed', NULL)
         RETURNING release_id, commit_sha, status, migration_marker, created_at, updated_at",
    )
    .bind(release_id)
    .bind(commit_sha)
    .fetch_one(&mut *tx)
    .await
    .context("insert failed releases row")?;

    insert_audit_entry(
        &mut *tx,
        &NewAuditEntry {
            actor: "deploy-gate",
            action: "release.deploy_failed",
            payload: &serde_json::json!({"release_id": release_id, "commit_sha": commit_sha}),
            trace_id: None,
            run_id: None,
            slot_id: None,
            commit_sha: Some(commit_sha),
        },
    )
    .await
    .context("insert release-failure audit entry")?;

    tx.commit().await.context("commit record_deploy_failed tx")?;

    row_to_release(row)
}

pub async fn list_releases(pool: &PgPool, limit: i64, offset: i64) -> Result<Vec<Release>> {
    let rows = sqlx::query(
        "SELECT release_id, commit_sha, status, migration_marker, created_at, updated_at
         FROM releases ORDER BY created_at DESC, release_id LIMIT $1 OFFSET $2",
    )
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await
    .context("list_releases query")?;

    rows.into_iter().map(row_to_release).collect()
}

pub async fn fetch_release(pool: &PgPool, release_id: &str) -> Result<Release> {
    let row = sqlx::query(
        "SELECT release_id, commit_sha, status, migration_marker, created_at, updated_at
         FROM releases WHERE release_id = $1",
    )
    .bind(release_id)
    .fetch_optional(pool)
    .await
    .context("fetch_release query")?
    .ok_or_else(|| anyhow!(control_schemas::CoreError::NotFound(format!("release {release_id} not found"))))?;

    row_to_release(row)
}

fn row_to_release(row: sqlx::postgres::PgRow) -> Result<Release> {
    let status_raw: String = row.try_get("status")?;
    Ok(Release {
        release_id: row.try_get("release_id")?,
        commit_sha: row.try_get("commit_sha")?,
        status: match status_raw.as_str() {
            "deployed" => ReleaseStatus::Deployed,
            "replaced" => ReleaseStatus::Replaced,
            "deploy_failed" => ReleaseStatus::DeployFailed,
            other => return Err(anyhow!("invalid release status stored: {other}")),
        },
        migration_marker: row.try_get("migration_marker")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
