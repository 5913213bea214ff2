//! In-memory stand-in for [`control_capabilities::GitDriver`]. Tracks
//! worktrees and a fake commit graph well enough to drive the merge gate's
//! re-check/merge/push sequence without touching a real checkout.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use control_capabilities::{DriverError, DriverResult, GitDriver};

#[derive(Default)]
struct State {
    worktrees: HashMap<String, String>,
    branch_heads: HashMap<String, String>,
    main_head: String,
    fail_merge: Option<String>,
    fail_push: bool,
}

/// Every branch this fake creates gets a deterministic head sha derived
/// from the branch name, so callers can set `expected_commit_sha` to
/// `FakeGitDriver::commit_for(branch_name)` without touching internals.
pub struct FakeGitDriver {
    state: Mutex<State>,
}

impl FakeGitDriver {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                main_head: "main-0".to_string(),
                ..Default::default()
            }),
        }
    }

    pub fn commit_for(branch_name: &str) -> String {
        format!("commit-{branch_name}")
    }

    /// Subsequent `merge_to_main` calls fail with a merge conflict.
    pub fn fail_next_merge(&self, detail: impl Into<String>) {
        self.state.lock().unwrap().fail_merge = Some(detail.into());
    }

    /// Subsequent `push_main` calls fail.
    pub fn fail_next_push(&self) {
        self.state.lock().unwrap().fail_push = true;
    }

    pub fn main_head(&self) -> String {
        self.state.lock().unwrap().main_head.clone()
    }

    pub fn worktree_exists(&self, worktree_path: &str) -> bool {
        self.state.lock().unwrap().worktrees.contains_key(worktree_path)
    }
}

impl Default for FakeGitDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GitDriver for FakeGitDriver {
    async fn create_worktree(&self, branch_name: &str, worktree_path: &str) -> DriverResult<()> {
        let mut state = self.state.lock().unwrap();
        state.worktrees.insert(worktree_path.to_string(), branch_name.to_string());
        state.branch_heads.insert(branch_name.to_string(), Self::commit_for(branch_name));
        Ok(())
    }

    async fn remove_worktree(&self, worktree_path: &str, branch_name: &str) -> DriverResult<()> {
        let mut state = self.state.lock().unwrap();
        state.worktrees.remove(worktree_path);
        state.branch_heads.remove(branch_name);
        Ok(())
    }

    async fn merge_to_main(&self, branch_name: &str, expected_commit_sha: &str) -> DriverResult<String> {
        let mut state = self.state.lock().unwrap();

        if let Some(detail) = state.fail_merge.take() {
            return Err(DriverError::MergeConflict(detail));
        }

        let head = state
            .branch_heads
            .get(branch_name)
            .cloned()
            .unwrap_or_else(|| Self::commit_for(branch_name));

        if head != expected_commit_sha {
            return Err(DriverError::Other(format!(
                "branch {branch_name} head {head} does not match expected commit {expected_commit_sha}"
            )));
        }

        let merge_commit = format!("merge-{branch_name}");
        state.main_head = merge_commit.clone();
        Ok(merge_commit)
    }

    async fn push_main(&self) -> DriverResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_push {
            state.fail_push = false;
            return Err(DriverError::NonZeroExit {
                code: 1,
                stderr: "fake push rejected".to_string(),
            });
        }
        Ok(())
    }
}
