//! Requires `CONTROL_DATABASE_URL`. Covers spec scenario S4: a transition
//! outside the canonical table is rejected as a conflict and leaves the run
//! exactly where it was.

use control_schemas::{CoreError, RunId, RunStatus};

#[tokio::test]
#[ignore = "requires CONTROL_DATABASE_URL"]
async fn queued_run_cannot_jump_straight_to_deploying() {
    let pool = control_db::testkit_db_pool().await.unwrap();

    let run_id = RunId::parse("S4RUN").unwrap();
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

    let err = control_db::runs::transition(&pool, &run_id, RunStatus::Deploying, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Conflict(_)));

    let run = control_db::runs::fetch_run(&pool, &run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Queued);
}

#[tokio::test]
#[ignore = "requires CONTROL_DATABASE_URL"]
async fn terminal_run_rejects_every_further_transition() {
    let pool = control_db::testkit_db_pool().await.unwrap();

    let run_id = RunId::parse("S4TERM").unwrap();
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

    control_db::runs::cancel(&pool, &run_id, Some("not needed anymore".to_string()))
        .await
        .unwrap();

    let err = control_db::runs::transition(&pool, &run_id, RunStatus::Planning, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Conflict(_)));
}
