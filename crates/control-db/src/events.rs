//! `run_events` — the append-only per-run event log. Every component
//! appends through [`insert_event`] inside its own transaction; no row is
//! ever updated or deleted (invariant 7, spec §3).

use anyhow::{Context, Result};
use control_schemas::RunEvent;
use sqlx::Row;

pub struct NewRunEvent<'a> {
    pub run_id: &'a str,
    pub event_type: &'a str,
    pub status_from: Option<&'a str>,
    pub status_to: Option<&'a str>,
    pub payload: serde_json::Value,
}

pub async fn insert_event<'e, E>(exec: E, ev: &NewRunEvent<'_>) -> Result<i64>
where
    E: sqlx::Executor<'e, Database = sqlx::Postgres>,
{
    let row = sqlx::query(
        "INSERT INTO run_events (run_id, event_type, status_from, status_to, payload)
         VALUES ($1, $2, $3, $4, $5)
         RETURNING id",
    )
    .bind(ev.run_id)
    .bind(ev.event_type)
    .bind(ev.status_from)
    .bind(ev.status_to)
    .bind(&ev.payload)
    .fetch_one(exec)
    .await
    .context("insert run_events row")?;

    Ok(row.try_get::<i64, _>("id")?)
}

pub async fn list_events(pool: &sqlx::PgPool, run_id: &str) -> Result<Vec<RunEvent>> {
    let rows = sqlx::query(
        "SELECT id, run_id, event_type, status_from, status_to, payload, created_at
         FROM run_events WHERE run_id = $1 ORDER BY created_at, id",
    )
    .bind(run_id)
    .fetch_all(pool)
    .await
    .context("list run_events")?;

    rows.into_iter()
        .map(|row| {
            Ok(RunEvent {
                id: row.try_get("id")?,
                run_id: control_schemas::RunId::parse(row.try_get::<String, _>("run_id")?.as_str())
                    .ok_or_else(|| anyhow::anyhow!("invalid run_id stored in run_events"))?,
                event_type: row.try_get("event_type")?,
                status_from: row.try_get("status_from")?,
                status_to: row.try_get("status_to")?,
                payload: row.try_get("payload")?,
                created_at: row.try_get("created_at")?,
            })
        })
        .collect()
}
