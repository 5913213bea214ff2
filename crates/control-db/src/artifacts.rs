//! `run_artifacts` — append-only. Diagnostics attached by the worker or
//! the Merge/Deploy Gate (push failure diagnostics, deploy reload logs).

use anyhow::{anyhow, Context, Result};
use control_schemas::{RunArtifact, RunId};
use sqlx::{PgPool, Row};

pub async fn record_artifact(
    pool: &PgPool,
    run_id: &RunId,
    artifact_type: &str,
    uri: &str,
    payload: Option<serde_json::Value>,
) -> Result<RunArtifact> {
    let row = sqlx::query(
        "INSERT INTO run_artifacts (run_id, artifact_type, uri, payload)
         VALUES ($1, $2, $3, $4)
         RETURNING id",
    )
    .bind(run_id.as_str())
    .bind(artifact_type)
    .bind(uri)
    .bind(&payload)
    .fetch_one(pool)
    .await
    .context("insert run_artifacts row")?;

    Ok(RunArtifact {
        id: row.try_get("id")?,
        run_id: run_id.clone(),
        artifact_type: artifact_type.to_string(),
        uri: uri.to_string(),
        payload,
    })
}

pub async fn list_for_run(pool: &PgPool, run_id: &RunId) -> Result<Vec<RunArtifact>> {
    let rows = sqlx::query(
        "SELECT id, run_id, artifact_type, uri, payload
         FROM run_artifacts WHERE run_id = $1 ORDER BY id",
    )
    .bind(run_id.as_str())
    .fetch_all(pool)
    .await
    .context("list run_artifacts")?;

    rows.into_iter()
        .map(|row| {
            let run_id_raw: String = row.try_get("run_id")?;
            Ok(RunArtifact {
                id: row.try_get("id")?,
                run_id: RunId::parse(&run_id_raw).ok_or_else(|| anyhow!("invalid run_id in run_artifacts"))?,
                artifact_type: row.try_get("artifact_type")?,
                uri: row.try_get("uri")?,
                payload: row.try_get("payload")?,
            })
        })
        .collect()
}
