//! PostgreSQL store integration tests for time-billing-service.
//!
//! Require a running PostgreSQL reachable through `TEST_DATABASE_URL`:
//! `cargo test -p time-billing-service -- --ignored`

mod common;

use chrono::{Datelike, Utc};
use common::{hours, TestDb};
use rust_decimal::Decimal;
use serial_test::serial;
use time_billing_service::models::{BillingStatus, NewClient, NewTimeEntry};
use time_billing_service::services::allowance::{self, year_start};
use time_billing_service::services::{BillingError, BillingStore};

fn this_year_client(name: &str, allowance: i64, used: i64) -> NewClient {
    let reset = year_start(Utc::now().year()).unwrap();
    NewClient::new(name, hours(allowance)).with_usage(hours(used), reset)
}

#[tokio::test]
#[ignore]
#[serial]
async fn logging_time_persists_entry_and_usage() {
    let db = TestDb::spawn().await;
    let store = db.app.db();
    let service = db.app.service();

    let client = store
        .create_client(&this_year_client("Acme", 10, 9))
        .await
        .unwrap();
    let task = store.create_task(client.client_id, "Build").await.unwrap();
    let developer = store
        .create_developer("Dana", Some(Decimal::from(90)))
        .await
        .unwrap();

    let entry = service
        .log_time(
            NewTimeEntry::new(task.task_id, Utc::now())
                .minutes(120)
                .by_developer(developer.developer_id),
        )
        .await
        .unwrap();
    assert_eq!(entry.billable_amount, Decimal::from(90));
    assert_eq!(entry.developer_amount, Decimal::from(180));

    let stored_entry = store.get_time_entry(entry.entry_id).await.unwrap().unwrap();
    assert_eq!(stored_entry.billing(), entry.billing());
    assert_eq!(stored_entry.billing_status, BillingStatus::Pending);

    let stored = store.get_client(client.client_id).await.unwrap().unwrap();
    assert_eq!(stored.yearly_hours_used, hours(11));
    assert_eq!(stored.usage_version, client.usage_version + 1);

    db.cleanup().await;
}

#[tokio::test]
#[ignore]
#[serial]
async fn stale_version_write_is_rejected() {
    let db = TestDb::spawn().await;
    let store = db.app.db();
    let service = db.app.service();

    let client = store
        .create_client(&this_year_client("Acme", 10, 0))
        .await
        .unwrap();
    let task = store.create_task(client.client_id, "Build").await.unwrap();
    service
        .log_time(NewTimeEntry::new(task.task_id, Utc::now()).minutes(60))
        .await
        .unwrap();

    let entries = store.list_client_entries(client.client_id).await.unwrap();
    let plan = allowance::recalculate(client.annual_hour_allowance, &entries).unwrap();
    let result = store
        .commit_recalculation(client.client_id, client.usage_version, &plan)
        .await;

    assert!(matches!(
        result,
        Err(BillingError::ConcurrentUpdateConflict { .. })
    ));

    db.cleanup().await;
}

#[tokio::test]
#[ignore]
#[serial]
async fn partial_recalculation_is_rolled_back() {
    let db = TestDb::spawn().await;
    let store = db.app.db();
    let service = db.app.service();

    let client = store
        .create_client(&this_year_client("Acme", 1, 0))
        .await
        .unwrap();
    let task = store.create_task(client.client_id, "Build").await.unwrap();
    let now = Utc::now();
    let kept = service
        .log_time(NewTimeEntry::new(task.task_id, now).minutes(60))
        .await
        .unwrap();
    let removed = service
        .log_time(NewTimeEntry::new(task.task_id, now - chrono::Duration::hours(2)).minutes(60))
        .await
        .unwrap();

    let before = store.get_client(client.client_id).await.unwrap().unwrap();
    let entries = store.list_client_entries(client.client_id).await.unwrap();
    assert_eq!(entries[0].entry_id, removed.entry_id);
    let plan = allowance::recalculate(before.annual_hour_allowance, &entries).unwrap();

    assert!(store.delete_time_entry(removed.entry_id).await.unwrap());

    let result = store
        .commit_recalculation(client.client_id, before.usage_version, &plan)
        .await;
    match result {
        Err(BillingError::PartialRecalculationFailure {
            failed_entry_ids, ..
        }) => assert_eq!(failed_entry_ids, vec![removed.entry_id]),
        other => panic!("expected partial failure, got {:?}", other),
    }

    let after = store.get_client(client.client_id).await.unwrap().unwrap();
    assert_eq!(after.usage_version, before.usage_version);
    let survivor = store.get_time_entry(kept.entry_id).await.unwrap().unwrap();
    assert_eq!(survivor.billing(), kept.billing());

    db.cleanup().await;
}

#[tokio::test]
#[ignore]
#[serial]
async fn allowance_update_and_year_reset_round_trip() {
    let db = TestDb::spawn().await;
    let store = db.app.db();
    let service = db.app.service();

    let client = store
        .create_client(&this_year_client("Acme", 1, 0))
        .await
        .unwrap();
    let stale = store
        .create_client(
            &NewClient::new("Stale", hours(5))
                .with_usage(hours(3), year_start(Utc::now().year() - 1).unwrap()),
        )
        .await
        .unwrap();
    let task = store.create_task(client.client_id, "Build").await.unwrap();
    service
        .log_time(NewTimeEntry::new(task.task_id, Utc::now()).minutes(120))
        .await
        .unwrap();

    let update = service
        .update_allowance(client.client_id, hours(2))
        .await
        .unwrap();
    assert!(update.recalculation.is_some());
    let entries = store.list_client_entries(client.client_id).await.unwrap();
    assert!(entries[0].is_within_allowance);

    let touched = service
        .reset_all_years(service.current_year())
        .await
        .unwrap();
    assert_eq!(touched, 1);
    let stale_after = store.get_client(stale.client_id).await.unwrap().unwrap();
    assert_eq!(stale_after.yearly_hours_used, Decimal::ZERO);

    let reset = service
        .reset_year(client.client_id, service.current_year())
        .await
        .unwrap();
    assert_eq!(reset.yearly_hours_used, Decimal::ZERO);

    db.cleanup().await;
}

#[tokio::test]
#[ignore]
#[serial]
async fn unknown_task_owner_is_not_found() {
    let db = TestDb::spawn().await;
    let store = db.app.db();

    let result = store.create_task(uuid::Uuid::new_v4(), "Orphan").await;
    assert!(matches!(result, Err(BillingError::NotFound { .. })));

    store.health_check().await.unwrap();
    db.cleanup().await;
}

#[tokio::test]
#[ignore]
#[serial]
async fn migrations_can_be_reapplied() {
    let db = TestDb::spawn().await;
    let store = db.app.db();

    store.run_migrations().await.unwrap();
    let client = store
        .create_client(&this_year_client("Acme", 10, 0))
        .await
        .unwrap();
    assert_eq!(client.usage_version, 0);

    db.cleanup().await;
}

#[tokio::test]
#[ignore]
#[serial]
async fn allowance_change_invalidates_earlier_snapshot() {
    let db = TestDb::spawn().await;
    let store = db.app.db();

    let client = store
        .create_client(&this_year_client("Acme", 10, 2))
        .await
        .unwrap();
    let changed = store
        .set_allowance(client.client_id, Decimal::ZERO)
        .await
        .unwrap();
    assert_eq!(changed.usage_version, client.usage_version + 1);

    let plan = allowance::recalculate(client.annual_hour_allowance, &[]).unwrap();
    let result = store
        .commit_recalculation(client.client_id, client.usage_version, &plan)
        .await;
    assert!(matches!(
        result,
        Err(BillingError::ConcurrentUpdateConflict { .. })
    ));

    db.cleanup().await;
}
