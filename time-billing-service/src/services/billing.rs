//! Billing service: drives the allowance engine against a store.
//!
//! Every operation that reads and then writes a client's usage counter runs
//! under that client's in-process lock, and the store write itself is a
//! compare-and-swap on `usage_version`. The lock serializes writers within
//! one process; the version check catches writers in other processes, in
//! which case the whole read-evaluate-write sequence is retried against a
//! fresh snapshot.

use crate::config::EngineConfig;
use crate::models::{AllowanceSummary, BillingStatus, Client, NewTimeEntry, TimeEntry};
use crate::services::allowance::{self, resolve_duration_minutes, resolve_hourly_rate};
use crate::services::clock::Clock;
use crate::services::error::BillingError;
use crate::services::metrics::{
    record_error, record_recalculation, record_time_entry, record_usage_conflict,
    record_year_reset,
};
use crate::services::store::BillingStore;
use chrono::Datelike;
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use service_core::retry::{retry_with_backoff, RetryConfig};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Outcome of recalculating one client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecalculationSummary {
    pub client_id: Uuid,
    pub entries_recalculated: usize,
    pub entries_changed: usize,
    pub yearly_hours_used: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecalculationFailure {
    pub client_id: Uuid,
    pub error: String,
}

/// Outcome of a bulk recalculation across clients.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecalculationReport {
    pub succeeded: Vec<RecalculationSummary>,
    pub failed: Vec<RecalculationFailure>,
}

/// Result of changing a client's allowance.
#[derive(Debug, Clone)]
pub struct AllowanceUpdate {
    pub client: Client,
    /// Present when existing usage forced a recalculation.
    pub recalculation: Option<RecalculationSummary>,
}

pub struct BillingService {
    store: Arc<dyn BillingStore>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    client_locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl BillingService {
    pub fn new(store: Arc<dyn BillingStore>, clock: Arc<dyn Clock>, config: EngineConfig) -> Self {
        Self {
            store,
            clock,
            config,
            client_locks: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn BillingStore> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Calendar year of the service clock.
    pub fn current_year(&self) -> i32 {
        self.clock.now().year()
    }

    fn client_lock(&self, client_id: Uuid) -> Arc<Mutex<()>> {
        self.client_locks.entry(client_id).or_default().clone()
    }

    fn retry_config(&self) -> RetryConfig {
        RetryConfig::quick(self.config.conflict_retries)
    }

    async fn load_client(&self, client_id: Uuid) -> Result<Client, BillingError> {
        self.store
            .get_client(client_id)
            .await?
            .ok_or_else(|| BillingError::not_found("client", client_id))
    }

    // =========================================================================
    // Time Entry Operations
    // =========================================================================

    /// Log a unit of work and charge it against the client's allowance.
    #[instrument(skip(self, input), fields(task_id = %input.task_id))]
    pub async fn log_time(&self, input: NewTimeEntry) -> Result<TimeEntry, BillingError> {
        let result = self.log_time_inner(&input).await;
        match &result {
            Ok(entry) => {
                record_time_entry(
                    entry.is_within_allowance,
                    entry.billable_amount.to_f64().unwrap_or_default(),
                    entry.developer_amount.to_f64().unwrap_or_default(),
                );
                info!(
                    entry_id = %entry.entry_id,
                    duration_minutes = entry.duration_minutes,
                    billable_amount = %entry.billable_amount,
                    within_allowance = entry.is_within_allowance,
                    "Time entry logged"
                );
            }
            Err(e) => {
                record_error(e.kind(), "log_time");
                warn!(error = %e, "Failed to log time entry");
            }
        }
        result
    }

    async fn log_time_inner(&self, input: &NewTimeEntry) -> Result<TimeEntry, BillingError> {
        let duration_minutes =
            resolve_duration_minutes(input.start_time, input.end_time, input.duration_minutes)?;

        let task = self
            .store
            .get_task(input.task_id)
            .await?
            .ok_or_else(|| BillingError::not_found("task", input.task_id))?;

        let developer_rate = match input.developer_id {
            Some(developer_id) => {
                self.store
                    .get_developer(developer_id)
                    .await?
                    .ok_or_else(|| BillingError::not_found("developer", developer_id))?
                    .hourly_rate
            }
            None => None,
        };
        let hourly_rate = resolve_hourly_rate(
            input.hourly_rate,
            developer_rate,
            self.config.default_hourly_rate,
        )?;

        let lock = self.client_lock(task.client_id);
        let _guard = lock.lock().await;

        retry_with_backoff(
            &self.retry_config(),
            "log_time",
            BillingError::is_retryable,
            || self.try_log_time(task.client_id, input, duration_minutes, hourly_rate),
        )
        .await
    }

    async fn try_log_time(
        &self,
        client_id: Uuid,
        input: &NewTimeEntry,
        duration_minutes: i64,
        hourly_rate: Decimal,
    ) -> Result<TimeEntry, BillingError> {
        let client = self.load_client(client_id).await?;
        let now = self.clock.now();

        let billing = allowance::evaluate_entry(&client, duration_minutes, hourly_rate, now)?;
        let usage = allowance::apply_usage(&client, duration_minutes, now)?;

        let entry = TimeEntry {
            entry_id: Uuid::new_v4(),
            task_id: input.task_id,
            developer_id: input.developer_id,
            description: input.description.clone(),
            start_time: input.start_time,
            end_time: input.end_time,
            duration_minutes,
            hourly_rate,
            billing_status: billing.billing_status,
            billable_amount: billing.billable_amount,
            developer_amount: billing.developer_amount,
            is_within_allowance: billing.is_within_allowance,
            created_utc: now,
            updated_utc: now,
        };

        self.store
            .record_time_entry(client_id, client.usage_version, &entry, &usage)
            .await
            .inspect_err(|e| {
                if e.is_retryable() {
                    record_usage_conflict("log_time");
                }
            })?;

        Ok(entry)
    }

    /// Advance an entry through the invoicing lifecycle.
    #[instrument(skip(self), fields(entry_id = %entry_id, to = %to))]
    pub async fn update_billing_status(
        &self,
        entry_id: Uuid,
        to: BillingStatus,
    ) -> Result<TimeEntry, BillingError> {
        let entry = self
            .store
            .get_time_entry(entry_id)
            .await?
            .ok_or_else(|| BillingError::not_found("time entry", entry_id))?;

        if !entry.billing_status.can_transition_to(to) {
            return Err(BillingError::invalid(format!(
                "cannot move time entry from {} to {}",
                entry.billing_status, to
            )));
        }

        let updated = self
            .store
            .set_billing_status(entry_id, entry.billing_status, to)
            .await?;
        info!(from = %entry.billing_status, "Billing status updated");
        Ok(updated)
    }

    // =========================================================================
    // Recalculation Operations
    // =========================================================================

    /// Rebuild billing fields of all the client's entries from scratch.
    #[instrument(skip(self), fields(client_id = %client_id))]
    pub async fn recalculate_client(
        &self,
        client_id: Uuid,
    ) -> Result<RecalculationSummary, BillingError> {
        let lock = self.client_lock(client_id);
        let _guard = lock.lock().await;

        self.recalculate_locked(client_id).await
    }

    /// Caller must hold the client's lock.
    async fn recalculate_locked(
        &self,
        client_id: Uuid,
    ) -> Result<RecalculationSummary, BillingError> {
        let result = retry_with_backoff(
            &self.retry_config(),
            "recalculate_client",
            BillingError::is_retryable,
            || self.try_recalculate(client_id),
        )
        .await;

        match &result {
            Ok(summary) => {
                record_recalculation("success");
                info!(
                    entries = summary.entries_recalculated,
                    changed = summary.entries_changed,
                    yearly_hours_used = %summary.yearly_hours_used,
                    "Client recalculated"
                );
            }
            Err(e) => {
                record_recalculation("failed");
                record_error(e.kind(), "recalculate_client");
                warn!(error = %e, "Recalculation failed");
            }
        }
        result
    }

    async fn try_recalculate(&self, client_id: Uuid) -> Result<RecalculationSummary, BillingError> {
        let client = self.load_client(client_id).await?;
        let entries = self.store.list_client_entries(client_id).await?;

        let plan = allowance::recalculate(client.annual_hour_allowance, &entries)?;
        let entries_changed = plan.changed_count(&entries);

        let updated = self
            .store
            .commit_recalculation(client_id, client.usage_version, &plan)
            .await
            .inspect_err(|e| {
                if e.is_retryable() {
                    record_usage_conflict("recalculate_client");
                }
            })?;

        Ok(RecalculationSummary {
            client_id,
            entries_recalculated: plan.entries.len(),
            entries_changed,
            yearly_hours_used: updated.yearly_hours_used,
        })
    }

    /// Recalculate every client, several clients at a time.
    #[instrument(skip(self))]
    pub async fn recalculate_all(&self) -> Result<RecalculationReport, BillingError> {
        let client_ids = self.store.list_client_ids().await?;
        let total = client_ids.len();

        let outcomes: Vec<(Uuid, Result<RecalculationSummary, BillingError>)> =
            stream::iter(client_ids)
                .map(|client_id| async move { (client_id, self.recalculate_client(client_id).await) })
                .buffer_unordered(self.config.recalculation_concurrency)
                .collect()
                .await;

        let mut report = RecalculationReport::default();
        for (client_id, outcome) in outcomes {
            match outcome {
                Ok(summary) => report.succeeded.push(summary),
                Err(e) => report.failed.push(RecalculationFailure {
                    client_id,
                    error: e.to_string(),
                }),
            }
        }

        info!(
            clients = total,
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            "Bulk recalculation finished"
        );
        Ok(report)
    }

    // =========================================================================
    // Allowance Operations
    // =========================================================================

    /// Change the annual allowance; existing usage is re-split under the new value.
    ///
    /// Runs under the client's lock, and the store bumps `usage_version`, so a
    /// log racing from another process retries against the new allowance.
    #[instrument(skip(self), fields(client_id = %client_id, allowance = %annual_hour_allowance))]
    pub async fn update_allowance(
        &self,
        client_id: Uuid,
        annual_hour_allowance: Decimal,
    ) -> Result<AllowanceUpdate, BillingError> {
        if annual_hour_allowance.is_sign_negative() && !annual_hour_allowance.is_zero() {
            return Err(BillingError::invalid(format!(
                "annual hour allowance must not be negative (got {})",
                annual_hour_allowance
            )));
        }

        let lock = self.client_lock(client_id);
        let _guard = lock.lock().await;

        let client = self
            .store
            .set_allowance(client_id, annual_hour_allowance)
            .await?;
        info!("Annual hour allowance updated");

        if client.yearly_hours_used > Decimal::ZERO {
            let recalculation = self.recalculate_locked(client_id).await?;
            let client = self.load_client(client_id).await?;
            return Ok(AllowanceUpdate {
                client,
                recalculation: Some(recalculation),
            });
        }

        Ok(AllowanceUpdate {
            client,
            recalculation: None,
        })
    }

    /// Zero one client's counter as of January 1 of `target_year`.
    #[instrument(skip(self), fields(client_id = %client_id, target_year = target_year))]
    pub async fn reset_year(&self, client_id: Uuid, target_year: i32) -> Result<Client, BillingError> {
        let reset_at = allowance::year_start(target_year)?;

        let lock = self.client_lock(client_id);
        let _guard = lock.lock().await;

        let client = self.store.reset_client_year(client_id, reset_at).await?;
        record_year_reset("client", 1);
        info!("Yearly hours reset");
        Ok(client)
    }

    /// Zero the counter of every client not yet reset for `target_year`.
    #[instrument(skip(self), fields(target_year = target_year))]
    pub async fn reset_all_years(&self, target_year: i32) -> Result<u64, BillingError> {
        let reset_at = allowance::year_start(target_year)?;

        let touched = self.store.reset_stale_clients(reset_at).await?;
        record_year_reset("bulk", touched);
        info!(clients = touched, "Yearly hours reset for stale clients");
        Ok(touched)
    }

    pub async fn allowance_summary(&self, client_id: Uuid) -> Result<AllowanceSummary, BillingError> {
        let client = self.load_client(client_id).await?;
        Ok(allowance::allowance_summary(&client, self.clock.now()))
    }
}
