//! Requires `CONTROL_DATABASE_URL`. Covers spec scenarios S2 (saturation)
//! and S3 (expiry reaping) at the lease-manager level, independent of the
//! allocation orchestrator.

use control_leases::SlotLeaseManager;
use control_schemas::RunId;
use std::time::Duration;

async fn insert_run(pool: &sqlx::PgPool, run_id: &RunId) {
    control_db::runs::insert_run(
        pool,
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
}

#[tokio::test]
#[ignore = "requires CONTROL_DATABASE_URL"]
async fn saturated_pool_reports_waiting_with_occupied_slots() {
    let pool = control_db::testkit_db_pool().await.unwrap();
    let slots = vec!["preview-1", "preview-2", "preview-3"]
        .into_iter()
        .map(str::to_string)
        .collect::<Vec<_>>();
    control_db::ensure_slots(&pool, &slots).await.unwrap();

    let manager = SlotLeaseManager::new(pool.clone(), slots, 1800);

    for label in ["R1", "R2", "R3"] {
        let run_id = RunId::parse(label).unwrap();
        insert_run(&pool, &run_id).await;
        let outcome = manager.acquire(&run_id, false).await.unwrap();
        assert!(outcome.acquired);
    }

    let r4 = RunId::parse("R4").unwrap();
    insert_run(&pool, &r4).await;
    let outcome = manager.acquire(&r4, false).await.unwrap();

    assert!(!outcome.acquired);
    assert_eq!(outcome.occupied_slots.len(), 3);
}

#[tokio::test]
#[ignore = "requires CONTROL_DATABASE_URL"]
async fn expired_leases_are_reaped_and_the_run_transitions_to_expired() {
    let pool = control_db::testkit_db_pool().await.unwrap();
    let slots = vec!["preview-1".to_string()];
    control_db::ensure_slots(&pool, &slots).await.unwrap();

    let manager = SlotLeaseManager::new(pool.clone(), slots, 1);

    let run_id = RunId::parse("R1").unwrap();
    insert_run(&pool, &run_id).await;
    manager.acquire(&run_id, false).await.unwrap();

    tokio::time::sleep(Duration::from_secs(2)).await;

    let reaped = manager.reap_expired(false).await.unwrap();
    assert_eq!(reaped, 1);

    let run = control_db::runs::fetch_run(&pool, &run_id).await.unwrap();
    assert_eq!(run.status, control_schemas::RunStatus::Expired);
    assert!(run.slot_id.is_none());
}
