//! The Preview DB Reset/Seed Coordinator's one collaborator: something
//! that can actually drop/recreate a schema and load a seed or snapshot
//! file into a named preview database. The slot→db safety check happens
//! one layer up, in `control-db::previewdb`, before this is ever called.

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::Executor;
use std::path::Path;

use crate::{DriverError, DriverResult};

#[async_trait]
pub trait DbResetDriver: Send + Sync {
    /// Drop and recreate the `public` schema of `db_name`, then grant the
    /// app role usage on it. Must be a no-op-safe operation to call
    /// against an already-empty database.
    async fn reset_schema(&self, db_name: &str) -> DriverResult<()>;

    /// Execute the SQL file at `sql_path` against `db_name`.
    async fn apply_sql_file(&self, db_name: &str, sql_path: &Path) -> DriverResult<()>;
}

/// Connects directly to each named preview database via a base connection
/// string with the database segment swapped per call.
pub struct PostgresDbResetDriver {
    base_connection_url: String,
    app_role: String,
}

impl PostgresDbResetDriver {
    pub fn new(base_connection_url: impl Into<String>, app_role: impl Into<String>) -> Self {
        Self {
            base_connection_url: base_connection_url.into(),
            app_role: app_role.into(),
        }
    }

    fn url_for_db(&self, db_name: &str) -> String {
        match self.base_connection_url.rsplit_once('/') {
            Some((prefix, _)) => format!("{prefix}/{db_name}"),
            None => format!("{}/{db_name}", self.base_connection_url),
        }
    }
}

#[async_trait]
impl DbResetDriver for PostgresDbResetDriver {
    async fn reset_schema(&self, db_name: &str) -> DriverResult<()> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect(&self.url_for_db(db_name))
            .await?;

        pool.execute("DROP SCHEMA public CASCADE").await?;
        pool.execute("CREATE SCHEMA public").await?;
        pool.execute(format!("GRANT ALL ON SCHEMA public TO {}", self.app_role).as_str())
            .await?;

        Ok(())
    }

    async fn apply_sql_file(&self, db_name: &str, sql_path: &Path) -> DriverResult<()> {
        let sql = tokio::fs::read_to_string(sql_path)
            .await
            .map_err(DriverError::Io)?;

        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect(&self.url_for_db(db_name))
            .await?;

        pool.execute(sql.as_str()).await?;
        Ok(())
    }
}
