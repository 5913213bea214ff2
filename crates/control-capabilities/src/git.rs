//! The Worktree Binding Manager's one collaborator: a git driver capable
//! of creating/removing worktrees and performing the merge-gate's
//! non-interactive merge + push. Grounded in the pluggable-provider shape
//! the corpus uses for external-system adapters — one trait, one shell
//! implementation, fakes live in the test harness.

use async_trait::async_trait;
use std::process::Output;
use std::time::Duration;
use tokio::process::Command;

use crate::{DriverError, DriverResult};

#[async_trait]
pub trait GitDriver: Send + Sync {
    /// `git worktree add <worktree_path> -b <branch_name>` from `main`.
    async fn create_worktree(&self, branch_name: &str, worktree_path: &str) -> DriverResult<()>;

    /// `git worktree remove <worktree_path>` followed by branch deletion.
    /// Must be safe to call on an already-removed worktree. Never forces
    /// removal of a worktree with uncommitted changes — a dirty worktree
    /// must surface as a cleanup failure, not silently lose the work.
    async fn remove_worktree(&self, worktree_path: &str, branch_name: &str) -> DriverResult<()>;

    /// Non-interactive merge of `branch_name` into `main` at the repo
    /// root, returning the resulting merge commit sha. A real conflict
    /// must surface as `DriverError::MergeConflict`, never a generic error.
    async fn merge_to_main(&self, branch_name: &str, expected_commit_sha: &str) -> DriverResult<String>;

    /// Push `main` to the configured remote.
    async fn push_main(&self) -> DriverResult<()>;
}

/// Shells out to the system `git` binary against a fixed repo root.
pub struct ShellGitDriver {
    repo_root: String,
    main_branch: String,
    command_timeout: Duration,
}

impl ShellGitDriver {
    pub fn new(repo_root: impl Into<String>, main_branch: impl Into<String>, command_timeout: Duration) -> Self {
        Self {
            repo_root: repo_root.into(),
            main_branch: main_branch.into(),
            command_timeout,
        }
    }

    async fn run(&self, args: &[&str]) -> DriverResult<Output> {
        let fut = Command::new("git").arg("-C").arg(&self.repo_root).args(args).output();

        let output = tokio::time::timeout(self.command_timeout, fut)
            .await
            .map_err(|_| DriverError::Timeout(self.command_timeout.as_millis() as u64))??;

        if !output.status.success() {
            return Err(DriverError::NonZeroExit {
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(output)
    }
}

#[async_trait]
impl GitDriver for ShellGitDriver {
    async fn create_worktree(&self, branch_name: &str, worktree_path: &str) -> DriverResult<()> {
        self.run(&[
            "worktree",
            "add",
            worktree_path,
            "-b",
            branch_name,
            &self.main_branch,
        ])
        .await?;
        Ok(())
    }

    async fn remove_worktree(&self, worktree_path: &str, branch_name: &str) -> DriverResult<()> {
        // No --force: a worktree with uncommitted changes must fail cleanup
        // rather than silently discard the work.
        match self.run(&["worktree", "remove", worktree_path]).await {
            Ok(_) => {}
            Err(DriverError::NonZeroExit { stderr, .. }) if stderr.contains("is not a working tree") => {}
            Err(other) => return Err(other),
        }
        match self.run(&["branch", "-D", branch_name]).await {
            Ok(_) => Ok(()),
            Err(DriverError::NonZeroExit { stderr, .. }) if stderr.contains("not found") => Ok(()),
            Err(other) => Err(other),
        }
    }

    async fn merge_to_main(&self, branch_name: &str, expected_commit_sha: &str) -> DriverResult<String> {
        let head = self.run(&["rev-parse", branch_name]).await?;
        let head_sha = String::from_utf8_lossy(&head.stdout).trim().to_string();
        if head_sha != expected_commit_sha {
            return Err(DriverError::Other(format!(
                "branch {branch_name} head {head_sha} does not match expected commit {expected_commit_sha}"
            )));
        }

        self.run(&["checkout", &self.main_branch]).await?;

        match self
            .run(&["merge", "--no-ff", "--no-edit", branch_name])
            .await
        {
            Ok(_) => {}
            Err(DriverError::NonZeroExit { stderr, .. }) => {
                let _ = self.run(&["merge", "--abort"]).await;
                return Err(DriverError::MergeConflict(stderr));
            }
            Err(other) => return Err(other),
        }

        let merged = self.run(&["rev-parse", "HEAD"]).await?;
        Ok(String::from_utf8_lossy(&merged.stdout).trim().to_string())
    }

    async fn push_main(&self) -> DriverResult<()> {
        self.run(&["push", "origin", &self.main_branch]).await?;
        Ok(())
    }
}
