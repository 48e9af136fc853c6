//! In-process `BillingStore` backed by hash maps.

use crate::models::{
    BillingStatus, Client, Developer, NewClient, Task, TimeEntry, UsageUpdate,
};
use crate::services::allowance::RecalculationPlan;
use crate::services::error::BillingError;
use crate::services::store::BillingStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, instrument};
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    clients: HashMap<Uuid, Client>,
    developers: HashMap<Uuid, Developer>,
    tasks: HashMap<Uuid, Task>,
    entries: HashMap<Uuid, TimeEntry>,
}

impl Inner {
    fn client_mut(
        &mut self,
        client_id: Uuid,
        expected_version: i64,
    ) -> Result<&mut Client, BillingError> {
        let client = self
            .clients
            .get_mut(&client_id)
            .ok_or_else(|| BillingError::not_found("client", client_id))?;
        if client.usage_version != expected_version {
            return Err(BillingError::ConcurrentUpdateConflict { client_id });
        }
        Ok(client)
    }
}

/// Store used by tests and by callers embedding the engine without a database.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_client(&self, input: NewClient) -> Client {
        let now = Utc::now();
        let client = Client {
            client_id: Uuid::new_v4(),
            name: input.name,
            annual_hour_allowance: input.annual_hour_allowance,
            yearly_hours_used: input.yearly_hours_used,
            last_year_reset: input.last_year_reset,
            usage_version: 0,
            created_utc: now,
            updated_utc: now,
        };
        self.inner
            .write()
            .await
            .clients
            .insert(client.client_id, client.clone());
        client
    }

    pub async fn insert_task(&self, client_id: Uuid, title: &str) -> Result<Task, BillingError> {
        let mut inner = self.inner.write().await;
        if !inner.clients.contains_key(&client_id) {
            return Err(BillingError::not_found("client", client_id));
        }
        let task = Task {
            task_id: Uuid::new_v4(),
            client_id,
            title: title.to_string(),
            created_utc: Utc::now(),
        };
        inner.tasks.insert(task.task_id, task.clone());
        Ok(task)
    }

    pub async fn insert_developer(&self, name: &str, hourly_rate: Option<Decimal>) -> Developer {
        let developer = Developer {
            developer_id: Uuid::new_v4(),
            name: name.to_string(),
            hourly_rate,
            created_utc: Utc::now(),
        };
        self.inner
            .write()
            .await
            .developers
            .insert(developer.developer_id, developer.clone());
        developer
    }

    /// Delete an entry. The client's usage counter is left untouched.
    pub async fn remove_time_entry(&self, entry_id: Uuid) -> Option<TimeEntry> {
        self.inner.write().await.entries.remove(&entry_id)
    }
}

#[async_trait]
impl BillingStore for MemoryStore {
    async fn get_client(&self, client_id: Uuid) -> Result<Option<Client>, BillingError> {
        Ok(self.inner.read().await.clients.get(&client_id).cloned())
    }

    async fn list_client_ids(&self) -> Result<Vec<Uuid>, BillingError> {
        let mut ids: Vec<Uuid> = self.inner.read().await.clients.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }

    async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>, BillingError> {
        Ok(self.inner.read().await.tasks.get(&task_id).cloned())
    }

    async fn get_developer(&self, developer_id: Uuid) -> Result<Option<Developer>, BillingError> {
        Ok(self.inner.read().await.developers.get(&developer_id).cloned())
    }

    async fn get_time_entry(&self, entry_id: Uuid) -> Result<Option<TimeEntry>, BillingError> {
        Ok(self.inner.read().await.entries.get(&entry_id).cloned())
    }

    async fn list_client_entries(&self, client_id: Uuid) -> Result<Vec<TimeEntry>, BillingError> {
        let inner = self.inner.read().await;
        let mut entries: Vec<TimeEntry> = inner
            .entries
            .values()
            .filter(|e| {
                inner
                    .tasks
                    .get(&e.task_id)
                    .is_some_and(|t| t.client_id == client_id)
            })
            .cloned()
            .collect();
        entries.sort_by(|a, b| {
            a.start_time
                .cmp(&b.start_time)
                .then_with(|| a.entry_id.cmp(&b.entry_id))
        });
        Ok(entries)
    }

    #[instrument(skip(self, entry, usage), fields(entry_id = %entry.entry_id))]
    async fn record_time_entry(
        &self,
        client_id: Uuid,
        expected_version: i64,
        entry: &TimeEntry,
        usage: &UsageUpdate,
    ) -> Result<Client, BillingError> {
        let mut inner = self.inner.write().await;
        if inner.entries.contains_key(&entry.entry_id) {
            return Err(BillingError::invalid(format!(
                "time entry {} already exists",
                entry.entry_id
            )));
        }

        let client = inner.client_mut(client_id, expected_version)?;
        client.yearly_hours_used = usage.yearly_hours_used;
        client.last_year_reset = usage.last_year_reset;
        client.usage_version += 1;
        client.updated_utc = Utc::now();
        let updated = client.clone();

        inner.entries.insert(entry.entry_id, entry.clone());
        debug!(usage_version = updated.usage_version, "Time entry recorded");
        Ok(updated)
    }

    #[instrument(skip(self, plan), fields(entries = plan.entries.len()))]
    async fn commit_recalculation(
        &self,
        client_id: Uuid,
        expected_version: i64,
        plan: &RecalculationPlan,
    ) -> Result<Client, BillingError> {
        let mut inner = self.inner.write().await;
        inner.client_mut(client_id, expected_version)?;

        let failed_entry_ids: Vec<Uuid> = plan
            .entries
            .iter()
            .filter(|p| !inner.entries.contains_key(&p.entry_id))
            .map(|p| p.entry_id)
            .collect();
        if !failed_entry_ids.is_empty() {
            return Err(BillingError::PartialRecalculationFailure {
                client_id,
                failed_entry_ids,
            });
        }

        let now = Utc::now();
        for planned in &plan.entries {
            if let Some(entry) = inner.entries.get_mut(&planned.entry_id) {
                entry.apply_billing(&planned.billing);
                entry.updated_utc = now;
            }
        }

        let client = inner.client_mut(client_id, expected_version)?;
        client.yearly_hours_used = plan.yearly_hours_used;
        client.usage_version += 1;
        client.updated_utc = now;
        Ok(client.clone())
    }

    async fn set_allowance(
        &self,
        client_id: Uuid,
        annual_hour_allowance: Decimal,
    ) -> Result<Client, BillingError> {
        let mut inner = self.inner.write().await;
        let client = inner
            .clients
            .get_mut(&client_id)
            .ok_or_else(|| BillingError::not_found("client", client_id))?;
        client.annual_hour_allowance = annual_hour_allowance;
        client.usage_version += 1;
        client.updated_utc = Utc::now();
        Ok(client.clone())
    }

    async fn reset_client_year(
        &self,
        client_id: Uuid,
        reset_at: DateTime<Utc>,
    ) -> Result<Client, BillingError> {
        let mut inner = self.inner.write().await;
        let client = inner
            .clients
            .get_mut(&client_id)
            .ok_or_else(|| BillingError::not_found("client", client_id))?;
        client.yearly_hours_used = Decimal::ZERO;
        client.last_year_reset = Some(reset_at);
        client.usage_version += 1;
        client.updated_utc = Utc::now();
        Ok(client.clone())
    }

    async fn reset_stale_clients(&self, reset_at: DateTime<Utc>) -> Result<u64, BillingError> {
        let mut inner = self.inner.write().await;
        let now = Utc::now();
        let mut touched = 0;
        for client in inner.clients.values_mut() {
            if client.last_year_reset.map_or(true, |last| last < reset_at) {
                client.yearly_hours_used = Decimal::ZERO;
                client.last_year_reset = Some(reset_at);
                client.usage_version += 1;
                client.updated_utc = now;
                touched += 1;
            }
        }
        Ok(touched)
    }

    async fn set_billing_status(
        &self,
        entry_id: Uuid,
        from: BillingStatus,
        to: BillingStatus,
    ) -> Result<TimeEntry, BillingError> {
        let mut inner = self.inner.write().await;
        let entry = inner
            .entries
            .get_mut(&entry_id)
            .ok_or_else(|| BillingError::not_found("time entry", entry_id))?;
        if entry.billing_status != from {
            return Err(BillingError::invalid(format!(
                "time entry {} is {}, expected {}",
                entry_id, entry.billing_status, from
            )));
        }
        entry.billing_status = to;
        entry.updated_utc = Utc::now();
        Ok(entry.clone())
    }
}
