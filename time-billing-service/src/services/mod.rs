//! Services module for time-billing-service.

pub mod allowance;
pub mod billing;
pub mod clock;
pub mod database;
pub mod error;
pub mod memory;
pub mod metrics;
pub mod store;

pub use billing::{AllowanceUpdate, BillingService, RecalculationReport, RecalculationSummary};
pub use clock::{Clock, FixedClock, SystemClock};
pub use database::Database;
pub use error::BillingError;
pub use memory::MemoryStore;
pub use metrics::{get_metrics, init_metrics};
pub use store::BillingStore;
