//! Application startup and lifecycle management.

use crate::config::BillingConfig;
use crate::services::{init_metrics, BillingService, Database, SystemClock};
use service_core::error::AppError;
use std::sync::Arc;

/// Database handle and billing service wired together.
pub struct Application {
    db: Arc<Database>,
    service: BillingService,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: BillingConfig) -> Result<Self, AppError> {
        Self::build_internal(config, true).await
    }

    /// Build the application without running migrations.
    /// Use this in tests when migrations are already applied by the test harness.
    pub async fn build_without_migrations(config: BillingConfig) -> Result<Self, AppError> {
        Self::build_internal(config, false).await
    }

    async fn build_internal(config: BillingConfig, run_migrations: bool) -> Result<Self, AppError> {
        init_metrics();

        let db = Database::new(
            &config.database.url,
            config.database.max_connections,
            config.database.min_connections,
        )
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to PostgreSQL");
            e
        })?;

        if run_migrations {
            db.run_migrations().await.map_err(|e| {
                tracing::error!(error = %e, "Failed to run migrations");
                e
            })?;
        }

        db.health_check().await?;

        let db = Arc::new(db);
        let service = BillingService::new(db.clone(), Arc::new(SystemClock), config.engine);

        tracing::info!(
            service = %config.service_name,
            version = %config.service_version,
            "Time billing service ready"
        );

        Ok(Self { db, service })
    }

    /// Get a reference to the database.
    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn service(&self) -> &BillingService {
        &self.service
    }
}
