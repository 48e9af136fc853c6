//! Persistence seam for the billing engine.

use crate::models::{BillingStatus, Client, Developer, Task, TimeEntry, UsageUpdate};
use crate::services::allowance::RecalculationPlan;
use crate::services::error::BillingError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

/// Storage for clients, tasks, developers and time entries.
///
/// Writes to a client's usage fields are compare-and-swap on
/// `Client::usage_version`: when the stored version differs from
/// `expected_version` nothing is written and
/// `BillingError::ConcurrentUpdateConflict` is returned.
#[async_trait]
pub trait BillingStore: Send + Sync {
    async fn get_client(&self, client_id: Uuid) -> Result<Option<Client>, BillingError>;

    async fn list_client_ids(&self) -> Result<Vec<Uuid>, BillingError>;

    async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>, BillingError>;

    async fn get_developer(&self, developer_id: Uuid) -> Result<Option<Developer>, BillingError>;

    async fn get_time_entry(&self, entry_id: Uuid) -> Result<Option<TimeEntry>, BillingError>;

    /// All entries on the client's tasks, ordered by start time then id.
    async fn list_client_entries(&self, client_id: Uuid) -> Result<Vec<TimeEntry>, BillingError>;

    /// Insert `entry` and write `usage` to its client in one atomic step.
    async fn record_time_entry(
        &self,
        client_id: Uuid,
        expected_version: i64,
        entry: &TimeEntry,
        usage: &UsageUpdate,
    ) -> Result<Client, BillingError>;

    /// Persist every planned entry and the new usage counter, or nothing.
    async fn commit_recalculation(
        &self,
        client_id: Uuid,
        expected_version: i64,
        plan: &RecalculationPlan,
    ) -> Result<Client, BillingError>;

    /// Store a new allowance and bump `usage_version`, so any write based on
    /// a snapshot taken under the old allowance loses its compare-and-swap.
    async fn set_allowance(
        &self,
        client_id: Uuid,
        annual_hour_allowance: Decimal,
    ) -> Result<Client, BillingError>;

    /// Zero the counter and stamp `reset_at`.
    async fn reset_client_year(
        &self,
        client_id: Uuid,
        reset_at: DateTime<Utc>,
    ) -> Result<Client, BillingError>;

    /// Reset every client whose last reset is absent or before `reset_at`.
    /// Returns the number of clients touched.
    async fn reset_stale_clients(&self, reset_at: DateTime<Utc>) -> Result<u64, BillingError>;

    /// Move an entry from `from` to `to`; fails with `InvalidInput` when the
    /// stored status is no longer `from`.
    async fn set_billing_status(
        &self,
        entry_id: Uuid,
        from: BillingStatus,
        to: BillingStatus,
    ) -> Result<TimeEntry, BillingError>;
}
