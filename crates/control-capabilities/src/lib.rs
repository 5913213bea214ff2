//! The capability interfaces the control plane drives but does not own:
//! the git worktree driver, the preview database reset driver, and the
//! deploy hook / health probe pair. Concrete implementations shell out or
//! talk to Postgres directly; the orchestrator and gate crates only ever
//! see the trait objects, so tests substitute fakes from `control-testkit`
//! without touching a real git checkout or a real deploy target.

pub mod deploy;
pub mod git;
pub mod previewdb;

pub use deploy::{DeployDriver, DriverOutcome, ShellDeployDriver};
pub use git::{GitDriver, ShellGitDriver};
pub use previewdb::{DbResetDriver, PostgresDbResetDriver};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("driver command timed out after {0}ms")]
    Timeout(u64),

    #[error("driver command exited with status {code}: {stderr}")]
    NonZeroExit { code: i32, stderr: String },

    #[error("merge conflict: {0}")]
    MergeConflict(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Db(#[from] sqlx::Error),

    #[error("{0}")]
    Other(String),
}

pub type DriverResult<T> = Result<T, DriverError>;
