//! Requires `CONTROL_DATABASE_URL` to point at a disposable Postgres
//! instance; mirrors the teacher's `testkit_db_pool` convention for tests
//! that need a real transactional store.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use control_capabilities::{DriverResult, GitDriver};
use control_schemas::RunId;
use control_worktree::WorktreeManager;

#[derive(Default)]
struct FakeGitDriver {
    created: Mutex<Vec<(String, String)>>,
    removed: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl GitDriver for FakeGitDriver {
    async fn create_worktree(&self, branch_name: &str, worktree_path: &str) -> DriverResult<()> {
        self.created
            .lock()
            .unwrap()
            .push((branch_name.to_string(), worktree_path.to_string()));
        Ok(())
    }

    async fn remove_worktree(&self, worktree_path: &str, branch_name: &str) -> DriverResult<()> {
        self.removed
            .lock()
            .unwrap()
            .push((branch_name.to_string(), worktree_path.to_string()));
        Ok(())
    }

    async fn merge_to_main(&self, _branch_name: &str, _expected_commit_sha: &str) -> DriverResult<String> {
        Ok("deadbeef".to_string())
    }

    async fn push_main(&self) -> DriverResult<()> {
        Ok(())
    }
}

#[tokio::test]
#[ignore = "requires CONTROL_DATABASE_URL"]
async fn assign_is_idempotent_and_cleanup_releases_the_binding() {
    let pool = control_db::testkit_db_pool().await.unwrap();
    control_db::ensure_slots(&pool, &["preview-1".to_string()]).await.unwrap();

    let run = control_db::runs::insert_run(
        &pool,
        &control_db::runs::NewRun {
            run_id: RunId::generate(),
            title: None,
            prompt: "add a button".to_string(),
            route: "/".to_string(),
            parent_run_id: None,
            created_by: None,
            page_title: None,
            element_hint: None,
            note: None,
            trace_id: None,
        },
    )
    .await
    .unwrap();

    let driver = Arc::new(FakeGitDriver::default());
    let manager = WorktreeManager::new(pool.clone(), driver.clone(), "/srv/worktrees");

    let first = manager.assign(&run.run_id, "preview-1", None).await.unwrap();
    assert!(!first.reused);
    assert_eq!(driver.created.lock().unwrap().len(), 1);

    let second = manager
        .assign(&run.run_id, "preview-1", Some(&first.branch_name))
        .await
        .unwrap();
    assert!(second.reused);
    assert_eq!(driver.created.lock().unwrap().len(), 1, "reuse must not re-create the worktree");

    manager.cleanup("preview-1", Some(&run.run_id)).await.unwrap();
    let binding = control_db::worktree::fetch_binding(&pool, "preview-1").await.unwrap();
    assert_eq!(binding.binding_state, control_schemas::BindingState::Released);
    assert_eq!(driver.removed.lock().unwrap().len(), 1);
}
