//! The Merge/Deploy Gate's two external collaborators: the reload hook and
//! the health probe. Both are configured as shell commands with a timeout;
//! a non-zero exit or a timeout are both "unhealthy" from the gate's
//! perspective.

use async_trait::async_trait;
use std::time::{Duration, Instant};
use tokio::process::Command;

use crate::{DriverError, DriverResult};

#[derive(Debug, Clone)]
pub struct DriverOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

#[async_trait]
pub trait DeployDriver: Send + Sync {
    /// Invoke the configured reload command (e.g. restart the app server
    /// process / signal it to pick up the new release).
    async fn reload(&self, timeout: Duration) -> DriverResult<DriverOutcome>;

    /// Invoke the configured health check command.
    async fn health_check(&self, timeout: Duration) -> DriverResult<DriverOutcome>;

    /// Best-effort restoration of whatever release was live before this
    /// deploy attempt. Called only after `reload`/`health_check` failed.
    async fn restore_previous_release(&self, previous_commit_sha: &str) -> DriverResult<()>;
}

pub struct ShellDeployDriver {
    reload_command: String,
    health_command: String,
    repo_root: String,
}

impl ShellDeployDriver {
    pub fn new(reload_command: impl Into<String>, health_command: impl Into<String>, repo_root: impl Into<String>) -> Self {
        Self {
            reload_command: reload_command.into(),
            health_command: health_command.into(),
            repo_root: repo_root.into(),
        }
    }

    async fn run_command(&self, command_line: &str, timeout: Duration) -> DriverResult<DriverOutcome> {
        let started = Instant::now();
        let fut = Command::new("sh")
            .arg("-c")
            .arg(command_line)
            .current_dir(&self.repo_root)
            .output();

        let output = tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| DriverError::Timeout(timeout.as_millis() as u64))??;

        let outcome = DriverOutcome {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            duration_ms: started.elapsed().as_millis() as u64,
        };

        if !output.status.success() {
            return Err(DriverError::NonZeroExit {
                code: outcome.exit_code,
                stderr: outcome.stderr,
            });
        }
        Ok(outcome)
    }
}

#[async_trait]
impl DeployDriver for ShellDeployDriver {
    async fn reload(&self, timeout: Duration) -> DriverResult<DriverOutcome> {
        self.run_command(&self.reload_command, timeout).await
    }

    async fn health_check(&self, timeout: Duration) -> DriverResult<DriverOutcome> {
        self.run_command(&self.health_command, timeout).await
    }

    async fn restore_previous_release(&self, previous_commit_sha: &str) -> DriverResult<()> {
        let command_line = format!("git checkout {previous_commit_sha} && ({})", self.reload_command);
        self.run_command(&command_line, Duration::from_secs(120)).await?;
        Ok(())
    }
}
