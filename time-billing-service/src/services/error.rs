use service_core::error::AppError;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum BillingError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("Usage of client {client_id} changed concurrently")]
    ConcurrentUpdateConflict { client_id: Uuid },

    #[error("Recalculation of client {client_id} rolled back; {} entries failed to persist", .failed_entry_ids.len())]
    PartialRecalculationFailure {
        client_id: Uuid,
        failed_entry_ids: Vec<Uuid>,
    },

    #[error("Database error: {0}")]
    Database(anyhow::Error),
}

impl BillingError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        BillingError::InvalidInput(msg.into())
    }

    pub fn not_found(entity: &'static str, id: Uuid) -> Self {
        BillingError::NotFound { entity, id }
    }

    /// Only lost optimistic-concurrency races are worth retrying; the caller
    /// re-reads the client and runs the whole operation again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BillingError::ConcurrentUpdateConflict { .. })
    }

    /// Short, stable label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            BillingError::InvalidInput(_) => "invalid_input",
            BillingError::NotFound { .. } => "not_found",
            BillingError::ConcurrentUpdateConflict { .. } => "concurrent_update_conflict",
            BillingError::PartialRecalculationFailure { .. } => "partial_recalculation_failure",
            BillingError::Database(_) => "database",
        }
    }
}

impl From<BillingError> for AppError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::InvalidInput(msg) => AppError::BadRequest(anyhow::anyhow!(msg)),
            e @ BillingError::NotFound { .. } => AppError::NotFound(anyhow::anyhow!(e.to_string())),
            e @ BillingError::ConcurrentUpdateConflict { .. } => {
                AppError::Conflict(anyhow::anyhow!(e.to_string()))
            }
            e @ BillingError::PartialRecalculationFailure { .. } => {
                AppError::Conflict(anyhow::anyhow!(e.to_string()))
            }
            BillingError::Database(e) => AppError::DatabaseError(e),
        }
    }
}
