//! `validation_checks` — append-only per-check-attempt log. The worker
//! (external, out of core scope) is the writer; the Merge/Deploy Gate and
//! the Control API are readers.

use anyhow::{anyhow, Context, Result};
use control_schemas::{CheckStatus, RunId, ValidationCheck};
use sqlx::{PgPool, Row};

pub struct NewValidationCheck<'a> {
    pub run_id: &'a RunId,
    pub check_name: &'a str,
    pub status: CheckStatus,
    pub artifact_uri: Option<&'a str>,
}

pub async fn record_check(pool: &PgPool, new: &NewValidationCheck<'_>) -> Result<ValidationCheck> {
    let row = sqlx::query(
        "INSERT INTO validation_checks (run_id, check_name, status, started_at, ended_at, artifact_uri)
         VALUES ($1, $2, $3,
                 CASE WHEN $3 IN ('running','passed','failed') THEN now() END,
                 CASE WHEN $3 IN ('passed','failed') THEN now() END,
                 $4)
         RETURNING id, started_at, ended_at",
    )
    .bind(new.run_id.as_str())
    .bind(new.check_name)
    .bind(new.status.as_str())
    .bind(new.artifact_uri)
    .fetch_one(pool)
    .await
    .context("insert validation_checks row")?;

    Ok(ValidationCheck {
        id: row.try_get("id")?,
        run_id: new.run_id.clone(),
        check_name: new.check_name.to_string(),
        status: new.status,
        started_at: row.try_get("started_at")?,
        ended_at: row.try_get("ended_at")?,
        artifact_uri: new.artifact_uri.map(str::to_string),
    })
}

pub async fn list_for_run(pool: &PgPool, run_id: &RunId) -> Result<Vec<ValidationCheck>> {
    let rows = sqlx::query(
        "SELECT id, run_id, check_name, status, started_at, ended_at, artifact_uri
         FROM validation_checks WHERE run_id = $1 ORDER BY id",
    )
    .bind(run_id.as_str())
    .fetch_all(pool)
    .await
    .context("list validation_checks")?;

    rows.into_iter()
        .map(|row| {
            let run_id_raw: String = row.try_get("run_id")?;
            let status_raw: String = row.try_get("status")?;
            Ok(ValidationCheck {
                id: row.try_get("id")?,
                run_id: RunId::parse(&run_id_raw).ok_or_else(|| anyhow!("invalid run_id in validation_checks"))?,
                check_name: row.try_get("check_name")?,
                status: match status_raw.as_str() {
                    "pending" => CheckStatus::Pending,
                    "running" => CheckStatus::Running,
                    "passed" => CheckStatus::Passed,
                    _ => CheckStatus::Failed,
                },
                started_at: row.try_get("started_at")?,
                ended_at: row.try_get("ended_at")?,
                artifact_uri: row.try_get("artifact_uri")?,
            })
        })
        .collect()
}

/// The latest attempt per distinct `check_name`, for the merge gate's
/// re-check step: every one of these must be `passed` before merge.
pub async fn latest_per_check_name(pool: &PgPool, run_id: &RunId) -> Result<Vec<ValidationCheck>> {
    let all = list_for_run(pool, run_id).await?;
    let mut latest: std::collections::HashMap<String, ValidationCheck> = std::collections::HashMap::new();
    for check in all {
        latest.insert(check.check_name.clone(), check);
    }
    Ok(latest.into_values().collect())
}
