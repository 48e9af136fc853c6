//! service-core: Shared infrastructure for the SHP platform services.
pub mod config;
pub mod error;
pub mod observability;
pub mod retry;

pub use tracing;
