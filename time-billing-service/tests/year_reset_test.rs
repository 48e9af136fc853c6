//! Year reset tests for time-billing-service.

mod common;

use common::{at, hours, test_now, TestEngine};
use rust_decimal::Decimal;
use time_billing_service::models::NewClient;
use time_billing_service::services::BillingError;
use uuid::Uuid;

#[tokio::test]
async fn resetting_one_client_zeroes_its_counter() {
    let engine = TestEngine::spawn();
    let client = engine.client(10, hours(8)).await;

    let reset = engine
        .service
        .reset_year(client.client_id, 2025)
        .await
        .unwrap();

    assert_eq!(reset.yearly_hours_used, Decimal::ZERO);
    assert_eq!(reset.last_year_reset, Some(at(2025, 1, 1, 0)));
    assert!(reset.usage_version > client.usage_version);
}

#[tokio::test]
async fn reset_keeps_existing_entries() {
    let engine = TestEngine::spawn();
    let (client, task) = engine.client_with_task(10, Decimal::ZERO).await;
    let entry = engine.log_minutes(task.task_id, at(2024, 6, 1, 9), 120).await;

    engine
        .service
        .reset_year(client.client_id, 2024)
        .await
        .unwrap();

    let entries = engine.stored_entries(client.client_id).await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].billing(), entry.billing());
    assert_eq!(
        engine.stored_client(client.client_id).await.yearly_hours_used,
        Decimal::ZERO
    );
}

#[tokio::test]
async fn entries_after_reset_draw_on_a_fresh_allowance() {
    let engine = TestEngine::spawn();
    let (client, task) = engine.client_with_task(2, hours(5)).await;

    engine
        .service
        .reset_year(client.client_id, 2024)
        .await
        .unwrap();
    let entry = engine.log_minutes(task.task_id, at(2024, 6, 1, 9), 60).await;

    assert!(entry.is_within_allowance);
    assert_eq!(
        engine.stored_client(client.client_id).await.yearly_hours_used,
        hours(1)
    );
}

#[tokio::test]
async fn bulk_reset_touches_only_stale_clients() {
    let engine = TestEngine::spawn();
    let current = engine.client(10, hours(4)).await;
    let stale = engine
        .store
        .insert_client(NewClient::new("Stale", hours(10)).with_usage(hours(7), at(2023, 1, 1, 0)))
        .await;
    let never = engine
        .store
        .insert_client(NewClient::new("Never reset", hours(10)))
        .await;

    let touched = engine.service.reset_all_years(2024).await.unwrap();

    assert_eq!(touched, 2);
    let current_after = engine.stored_client(current.client_id).await;
    assert_eq!(current_after.yearly_hours_used, hours(4));
    assert_eq!(current_after.usage_version, current.usage_version);

    for client_id in [stale.client_id, never.client_id] {
        let client = engine.stored_client(client_id).await;
        assert_eq!(client.yearly_hours_used, Decimal::ZERO);
        assert_eq!(client.last_year_reset, Some(at(2024, 1, 1, 0)));
    }

    // Running it again is a no-op.
    assert_eq!(engine.service.reset_all_years(2024).await.unwrap(), 0);
}

#[tokio::test]
async fn summary_flags_clients_due_for_reset() {
    let engine = TestEngine::spawn();
    let client = engine
        .store
        .insert_client(NewClient::new("Stale", hours(10)).with_usage(hours(7), at(2023, 1, 1, 0)))
        .await;

    let summary = engine
        .service
        .allowance_summary(client.client_id)
        .await
        .unwrap();
    assert!(summary.needs_year_reset);
    assert_eq!(summary.hours_used, Decimal::ZERO);
    assert_eq!(summary.remaining_hours, hours(10));

    engine.clock.set(at(2025, 1, 2, 0));
    assert_eq!(engine.service.current_year(), 2025);
    engine.clock.set(test_now());
}

#[tokio::test]
async fn reset_rejects_unknown_client_and_invalid_year() {
    let engine = TestEngine::spawn();
    let client = engine.client(10, hours(3)).await;

    let missing = engine.service.reset_year(Uuid::new_v4(), 2024).await;
    assert!(matches!(missing, Err(BillingError::NotFound { .. })));

    let invalid = engine.service.reset_year(client.client_id, 300_000).await;
    assert!(matches!(invalid, Err(BillingError::InvalidInput(_))));
    assert_eq!(
        engine.stored_client(client.client_id).await.yearly_hours_used,
        hours(3)
    );

    let invalid_bulk = engine.service.reset_all_years(i32::MAX).await;
    assert!(matches!(invalid_bulk, Err(BillingError::InvalidInput(_))));
}
