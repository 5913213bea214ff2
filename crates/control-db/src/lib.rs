//! Postgres-backed store for the control plane.
//!
//! One public operation = one transaction, released deterministically on
//! every exit path. Every module here owns a disjoint set of tables; no
//! module reaches into another module's tables directly — composition
//! happens one layer up, in the orchestrator/gate crates.

pub mod approvals;
pub mod artifacts;
pub mod audit;
pub mod checks;
pub mod events;
pub mod leases;
pub mod previewdb;
pub mod releases;
pub mod runs;
pub mod worktree;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

pub const ENV_DB_URL: &str = "CONTROL_DATABASE_URL";

/// Connect using `CONTROL_DATABASE_URL` from the environment.
pub async fn connect_from_env() -> Result<PgPool> {
    let url = std::env::var(ENV_DB_URL)
        .with_context(|| format!("environment variable {ENV_DB_URL} is not set"))?;
    connect(&url).await
}

pub async fn connect(url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(url)
        .await
        .context("connect to control-plane database")
}

/// Connect + migrate, for tests and for one-shot tooling. Mirrors the
/// teacher's `testkit_db_pool` convention: every integration test that
/// needs a real database reaches for this rather than hand-rolling setup.
pub async fn testkit_db_pool() -> Result<PgPool> {
    let pool = connect_from_env().await?;
    migrate(&pool).await?;
    Ok(pool)
}

pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("run control-plane migrations")
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct DbStatus {
    pub ok: bool,
    pub has_runs_table: bool,
}

pub async fn status(pool: &PgPool) -> Result<DbStatus> {
    let row: Option<(bool,)> = sqlx::query_as(
        "SELECT EXISTS (SELECT 1 FROM information_schema.tables WHERE table_name = 'runs')",
    )
    .fetch_optional(pool)
    .await
    .context("status query failed")?;

    let has_runs_table = row.map(|(exists,)| exists).unwrap_or(false);
    Ok(DbStatus {
        ok: true,
        has_runs_table,
    })
}

/// Ensure a `slot_leases` + `slot_worktree_bindings` row exists for every
/// configured slot id. Idempotent; called once at daemon startup so the
/// invariant "exactly one row per configured slot" holds before any
/// `acquire` call lands.
pub async fn ensure_slots(pool: &PgPool, slot_ids: &[String]) -> Result<()> {
    let mut tx = pool.begin().await.context("begin ensure_slots tx")?;
    for slot_id in slot_ids {
        sqlx::query(
            "INSERT INTO slot_leases (slot_id, lease_state) VALUES ($1, 'released')
             ON CONFLICT (slot_id) DO NOTHING",
        )
        .bind(slot_id)
        .execute(&mut *tx)
        .await
        .context("seed slot_leases row")?;

        sqlx::query(
            "INSERT INTO slot_worktree_bindings (slot_id, binding_state, last_action)
             VALUES ($1, 'released', 'cleaned_up')
             ON CONFLICT (slot_id) DO NOTHING",
        )
        .bind(slot_id)
        .execute(&mut *tx)
        .await
        .context("seed slot_worktree_bindings row")?;
    }
    tx.commit().await.context("commit ensure_slots tx")?;
    Ok(())
}

pub(crate) fn is_unique_constraint_violation(err: &sqlx::Error, constraint: &str) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if db_err.code().as_deref() == Some("23505") {
            return db_err.constraint() == Some(constraint);
        }
    }
    false
}
