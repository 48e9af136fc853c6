//! Database service for time-billing-service.

use crate::models::{
    BillingStatus, Client, Developer, NewClient, Task, TimeEntry, UsageUpdate,
};
use crate::services::allowance::RecalculationPlan;
use crate::services::error::BillingError;
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::store::BillingStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

const CLIENT_COLUMNS: &str = "client_id, name, annual_hour_allowance, yearly_hours_used, last_year_reset, usage_version, created_utc, updated_utc";

const ENTRY_COLUMNS: &str = "entry_id, task_id, developer_id, description, start_time, end_time, duration_minutes, hourly_rate, billing_status, billable_amount, developer_amount, is_within_allowance, created_utc, updated_utc";

fn db_error(context: &str, e: sqlx::Error) -> BillingError {
    BillingError::Database(anyhow::anyhow!("{}: {}", context, e))
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "time-billing-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;

        timer.observe_duration();
        Ok(())
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, BillingError> {
        self.pool
            .begin()
            .await
            .map_err(|e| db_error("Failed to begin transaction", e))
    }

    /// Lock the client row and verify nobody changed its usage since
    /// `expected_version` was read.
    async fn lock_client_version(
        tx: &mut Transaction<'static, Postgres>,
        client_id: Uuid,
        expected_version: i64,
    ) -> Result<(), BillingError> {
        let current = sqlx::query_scalar::<_, i64>(
            "SELECT usage_version FROM clients WHERE client_id = $1 FOR UPDATE",
        )
        .bind(client_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| db_error("Failed to lock client", e))?;

        match current {
            None => Err(BillingError::not_found("client", client_id)),
            Some(version) if version != expected_version => {
                Err(BillingError::ConcurrentUpdateConflict { client_id })
            }
            Some(_) => Ok(()),
        }
    }

    // =========================================================================
    // Seeding Operations
    // =========================================================================

    /// Create a client.
    #[instrument(skip(self, input), fields(name = %input.name))]
    pub async fn create_client(&self, input: &NewClient) -> Result<Client, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_client"])
            .start_timer();

        let client = sqlx::query_as::<_, Client>(&format!(
            r#"
            INSERT INTO clients (client_id, name, annual_hour_allowance, yearly_hours_used, last_year_reset)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {CLIENT_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(&input.name)
        .bind(input.annual_hour_allowance)
        .bind(input.yearly_hours_used)
        .bind(input.last_year_reset)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("Failed to create client", e))?;

        timer.observe_duration();
        info!(client_id = %client.client_id, "Client created");

        Ok(client)
    }

    /// Create a task for a client.
    #[instrument(skip(self), fields(client_id = %client_id))]
    pub async fn create_task(&self, client_id: Uuid, title: &str) -> Result<Task, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_task"])
            .start_timer();

        let task = sqlx::query_as::<_, Task>(
            r#"
            INSERT INTO tasks (task_id, client_id, title)
            VALUES ($1, $2, $3)
            RETURNING task_id, client_id, title, created_utc
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(client_id)
        .bind(title)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_foreign_key_violation() => {
                BillingError::not_found("client", client_id)
            }
            other => db_error("Failed to create task", other),
        })?;

        timer.observe_duration();

        Ok(task)
    }

    /// Create a developer.
    #[instrument(skip(self))]
    pub async fn create_developer(
        &self,
        name: &str,
        hourly_rate: Option<Decimal>,
    ) -> Result<Developer, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_developer"])
            .start_timer();

        let developer = sqlx::query_as::<_, Developer>(
            r#"
            INSERT INTO developers (developer_id, name, hourly_rate)
            VALUES ($1, $2, $3)
            RETURNING developer_id, name, hourly_rate, created_utc
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .bind(hourly_rate)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("Failed to create developer", e))?;

        timer.observe_duration();

        Ok(developer)
    }

    /// Delete an entry. The client's usage counter is left untouched.
    #[instrument(skip(self), fields(entry_id = %entry_id))]
    pub async fn delete_time_entry(&self, entry_id: Uuid) -> Result<bool, BillingError> {
        let result = sqlx::query("DELETE FROM time_entries WHERE entry_id = $1")
            .bind(entry_id)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("Failed to delete time entry", e))?;

        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl BillingStore for Database {
    #[instrument(skip(self), fields(client_id = %client_id))]
    async fn get_client(&self, client_id: Uuid) -> Result<Option<Client>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_client"])
            .start_timer();

        let client = sqlx::query_as::<_, Client>(&format!(
            "SELECT {CLIENT_COLUMNS} FROM clients WHERE client_id = $1"
        ))
        .bind(client_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to get client", e))?;

        timer.observe_duration();

        Ok(client)
    }

    async fn list_client_ids(&self) -> Result<Vec<Uuid>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_client_ids"])
            .start_timer();

        let ids = sqlx::query_scalar::<_, Uuid>("SELECT client_id FROM clients ORDER BY client_id")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_error("Failed to list clients", e))?;

        timer.observe_duration();

        Ok(ids)
    }

    async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_task"])
            .start_timer();

        let task = sqlx::query_as::<_, Task>(
            "SELECT task_id, client_id, title, created_utc FROM tasks WHERE task_id = $1",
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to get task", e))?;

        timer.observe_duration();

        Ok(task)
    }

    async fn get_developer(&self, developer_id: Uuid) -> Result<Option<Developer>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_developer"])
            .start_timer();

        let developer = sqlx::query_as::<_, Developer>(
            "SELECT developer_id, name, hourly_rate, created_utc FROM developers WHERE developer_id = $1",
        )
        .bind(developer_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to get developer", e))?;

        timer.observe_duration();

        Ok(developer)
    }

    async fn get_time_entry(&self, entry_id: Uuid) -> Result<Option<TimeEntry>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_time_entry"])
            .start_timer();

        let entry = sqlx::query_as::<_, TimeEntry>(&format!(
            "SELECT {ENTRY_COLUMNS} FROM time_entries WHERE entry_id = $1"
        ))
        .bind(entry_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to get time entry", e))?;

        timer.observe_duration();

        Ok(entry)
    }

    #[instrument(skip(self), fields(client_id = %client_id))]
    async fn list_client_entries(&self, client_id: Uuid) -> Result<Vec<TimeEntry>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_client_entries"])
            .start_timer();

        let entries = sqlx::query_as::<_, TimeEntry>(&format!(
            r#"
            SELECT {columns}
            FROM time_entries e
            JOIN tasks t ON t.task_id = e.task_id
            WHERE t.client_id = $1
            ORDER BY e.start_time, e.entry_id
            "#,
            columns = ENTRY_COLUMNS
                .split(", ")
                .map(|c| format!("e.{}", c))
                .collect::<Vec<_>>()
                .join(", ")
        ))
        .bind(client_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list client entries", e))?;

        timer.observe_duration();

        Ok(entries)
    }

    #[instrument(skip(self, entry, usage), fields(client_id = %client_id, entry_id = %entry.entry_id))]
    async fn record_time_entry(
        &self,
        client_id: Uuid,
        expected_version: i64,
        entry: &TimeEntry,
        usage: &UsageUpdate,
    ) -> Result<Client, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["record_time_entry"])
            .start_timer();

        let mut tx = self.begin().await?;
        if let Err(e) = Self::lock_client_version(&mut tx, client_id, expected_version).await {
            tx.rollback().await.ok();
            return Err(e);
        }

        sqlx::query(&format!(
            r#"
            INSERT INTO time_entries ({ENTRY_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#
        ))
        .bind(entry.entry_id)
        .bind(entry.task_id)
        .bind(entry.developer_id)
        .bind(&entry.description)
        .bind(entry.start_time)
        .bind(entry.end_time)
        .bind(entry.duration_minutes)
        .bind(entry.hourly_rate)
        .bind(entry.billing_status)
        .bind(entry.billable_amount)
        .bind(entry.developer_amount)
        .bind(entry.is_within_allowance)
        .bind(entry.created_utc)
        .bind(entry.updated_utc)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("Failed to insert time entry", e))?;

        let client = sqlx::query_as::<_, Client>(&format!(
            r#"
            UPDATE clients
            SET yearly_hours_used = $2,
                last_year_reset = $3,
                usage_version = usage_version + 1,
                updated_utc = NOW()
            WHERE client_id = $1
            RETURNING {CLIENT_COLUMNS}
            "#
        ))
        .bind(client_id)
        .bind(usage.yearly_hours_used)
        .bind(usage.last_year_reset)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| db_error("Failed to update client usage", e))?;

        tx.commit()
            .await
            .map_err(|e| db_error("Failed to commit transaction", e))?;

        timer.observe_duration();

        Ok(client)
    }

    #[instrument(skip(self, plan), fields(client_id = %client_id, entries = plan.entries.len()))]
    async fn commit_recalculation(
        &self,
        client_id: Uuid,
        expected_version: i64,
        plan: &RecalculationPlan,
    ) -> Result<Client, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["commit_recalculation"])
            .start_timer();

        let mut tx = self.begin().await?;
        if let Err(e) = Self::lock_client_version(&mut tx, client_id, expected_version).await {
            tx.rollback().await.ok();
            return Err(e);
        }

        let mut failed_entry_ids = Vec::new();
        for planned in &plan.entries {
            let result = sqlx::query(
                r#"
                UPDATE time_entries
                SET billing_status = $2,
                    billable_amount = $3,
                    developer_amount = $4,
                    is_within_allowance = $5,
                    updated_utc = NOW()
                WHERE entry_id = $1
                "#,
            )
            .bind(planned.entry_id)
            .bind(planned.billing.billing_status)
            .bind(planned.billing.billable_amount)
            .bind(planned.billing.developer_amount)
            .bind(planned.billing.is_within_allowance)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("Failed to update time entry", e))?;

            if result.rows_affected() == 0 {
                failed_entry_ids.push(planned.entry_id);
            }
        }

        if !failed_entry_ids.is_empty() {
            tx.rollback().await.ok();
            return Err(BillingError::PartialRecalculationFailure {
                client_id,
                failed_entry_ids,
            });
        }

        let client = sqlx::query_as::<_, Client>(&format!(
            r#"
            UPDATE clients
            SET yearly_hours_used = $2,
                usage_version = usage_version + 1,
                updated_utc = NOW()
            WHERE client_id = $1
            RETURNING {CLIENT_COLUMNS}
            "#
        ))
        .bind(client_id)
        .bind(plan.yearly_hours_used)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| db_error("Failed to update client usage", e))?;

        tx.commit()
            .await
            .map_err(|e| db_error("Failed to commit recalculation", e))?;

        timer.observe_duration();
        info!(usage_version = client.usage_version, "Recalculation committed");

        Ok(client)
    }

    #[instrument(skip(self), fields(client_id = %client_id))]
    async fn set_allowance(
        &self,
        client_id: Uuid,
        annual_hour_allowance: Decimal,
    ) -> Result<Client, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["set_allowance"])
            .start_timer();

        let client = sqlx::query_as::<_, Client>(&format!(
            r#"
            UPDATE clients
            SET annual_hour_allowance = $2,
                usage_version = usage_version + 1,
                updated_utc = NOW()
            WHERE client_id = $1
            RETURNING {CLIENT_COLUMNS}
            "#
        ))
        .bind(client_id)
        .bind(annual_hour_allowance)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to set allowance", e))?
        .ok_or_else(|| BillingError::not_found("client", client_id))?;

        timer.observe_duration();

        Ok(client)
    }

    #[instrument(skip(self), fields(client_id = %client_id))]
    async fn reset_client_year(
        &self,
        client_id: Uuid,
        reset_at: DateTime<Utc>,
    ) -> Result<Client, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["reset_client_year"])
            .start_timer();

        let client = sqlx::query_as::<_, Client>(&format!(
            r#"
            UPDATE clients
            SET yearly_hours_used = 0,
                last_year_reset = $2,
                usage_version = usage_version + 1,
                updated_utc = NOW()
            WHERE client_id = $1
            RETURNING {CLIENT_COLUMNS}
            "#
        ))
        .bind(client_id)
        .bind(reset_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to reset client year", e))?
        .ok_or_else(|| BillingError::not_found("client", client_id))?;

        timer.observe_duration();

        Ok(client)
    }

    #[instrument(skip(self))]
    async fn reset_stale_clients(&self, reset_at: DateTime<Utc>) -> Result<u64, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["reset_stale_clients"])
            .start_timer();

        let result = sqlx::query(
            r#"
            UPDATE clients
            SET yearly_hours_used = 0,
                last_year_reset = $1,
                usage_version = usage_version + 1,
                updated_utc = NOW()
            WHERE last_year_reset IS NULL OR last_year_reset < $1
            "#,
        )
        .bind(reset_at)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to reset stale clients", e))?;

        timer.observe_duration();

        Ok(result.rows_affected())
    }

    #[instrument(skip(self), fields(entry_id = %entry_id))]
    async fn set_billing_status(
        &self,
        entry_id: Uuid,
        from: BillingStatus,
        to: BillingStatus,
    ) -> Result<TimeEntry, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["set_billing_status"])
            .start_timer();

        let entry = sqlx::query_as::<_, TimeEntry>(&format!(
            r#"
            UPDATE time_entries
            SET billing_status = $3, updated_utc = NOW()
            WHERE entry_id = $1 AND billing_status = $2
            RETURNING {ENTRY_COLUMNS}
            "#
        ))
        .bind(entry_id)
        .bind(from)
        .bind(to)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to set billing status", e))?;

        timer.observe_duration();

        match entry {
            Some(entry) => Ok(entry),
            None => match self.get_time_entry(entry_id).await? {
                Some(current) => Err(BillingError::invalid(format!(
                    "time entry {} is {}, expected {}",
                    entry_id, current.billing_status, from
                ))),
                None => Err(BillingError::not_found("time entry", entry_id)),
            },
        }
    }
}
