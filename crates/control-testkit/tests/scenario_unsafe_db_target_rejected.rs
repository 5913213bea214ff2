//! Requires `CONTROL_DATABASE_URL`. Covers spec scenario S5: a slot id that
//! does not map to the configured preview-db template is rejected before
//! any driver call, and the rejection is recorded as provenance.

use std::sync::Arc;

use control_previewdb::PreviewDbCoordinator;
use control_schemas::{ResetStatus, ResetStrategy, RunId};
use control_testkit::FakeDbResetDriver;

#[tokio::test]
#[ignore = "requires CONTROL_DATABASE_URL"]
async fn slot_outside_the_preview_template_is_rejected_without_touching_the_driver() {
    let pool = control_db::testkit_db_pool().await.unwrap();

    let run_id = RunId::parse("S5RUN").unwrap();
    control_db::runs::insert_run(
        &pool,
        &control_db::runs::NewRun {
            run_id: run_id.clone(),
            title: None,
            prompt: "p".to_string(),
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

    let driver = Arc::new(FakeDbResetDriver::new());
    let coordinator = PreviewDbCoordinator::new(
        pool.clone(),
        driver.clone(),
        "app_preview_{n}".to_string(),
        "/srv/seeds/{version}.sql".to_string(),
        "/srv/snapshots/{version}.sql".to_string(),
    );

    let reset = coordinator
        .reset_and_seed(&run_id, "control-plane", ResetStrategy::Seed, Some("v1"), None, false)
        .await
        .unwrap();

    assert_eq!(reset.reset_status, ResetStatus::Rejected);
    assert!(driver.calls().is_empty());
}

#[tokio::test]
#[ignore = "requires CONTROL_DATABASE_URL"]
async fn matching_slot_is_applied_and_recorded() {
    let pool = control_db::testkit_db_pool().await.unwrap();

    let run_id = RunId::parse("S5OK").unwrap();
    control_db::runs::insert_run(
        &pool,
        &control_db::runs::NewRun {
            run_id: run_id.clone(),
            title: None,
            prompt: "p".to_string(),
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

    let driver = Arc::new(FakeDbResetDriver::new());
    let coordinator = PreviewDbCoordinator::new(
        pool.clone(),
        driver.clone(),
        "app_preview_{n}".to_string(),
        "/srv/seeds/{version}.sql".to_string(),
        "/srv/snapshots/{version}.sql".to_string(),
    );

    let reset = coordinator
        .reset_and_seed(&run_id, "preview-1", ResetStrategy::Seed, Some("v1"), None, false)
        .await
        .unwrap();

    assert_eq!(reset.reset_status, ResetStatus::Applied);
    assert_eq!(reset.db_name, "app_preview_1");
    assert_eq!(driver.calls().len(), 2);
}

#[tokio::test]
#[ignore = "requires CONTROL_DATABASE_URL"]
async fn misconfigured_template_pointing_at_the_control_plane_db_is_rejected() {
    let pool = control_db::testkit_db_pool().await.unwrap();

    let run_id = RunId::parse("S5BADTPL").unwrap();
    control_db::runs::insert_run(
        &pool,
        &control_db::runs::NewRun {
            run_id: run_id.clone(),
            title: None,
            prompt: "p".to_string(),
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

    let driver = Arc::new(FakeDbResetDriver::new());
    // A valid slot id, but a template misconfigured to resolve to the
    // control-plane database rather than any `app_preview_<n>` name.
    let coordinator = PreviewDbCoordinator::new(
        pool.clone(),
        driver.clone(),
        "builder_control".to_string(),
        "/srv/seeds/{version}.sql".to_string(),
        "/srv/snapshots/{version}.sql".to_string(),
    );

    let reset = coordinator
        .reset_and_seed(&run_id, "preview-1", ResetStrategy::Seed, Some("v1"), None, false)
        .await
        .unwrap();

    assert_eq!(reset.reset_status, ResetStatus::Rejected);
    assert_eq!(reset.db_name, "builder_control");
    assert!(driver.calls().is_empty());
}
