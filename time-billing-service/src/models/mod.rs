//! Domain models for time-billing-service.

mod client;
mod time_entry;

pub use client::{AllowanceSummary, Client, Developer, NewClient, Task, UsageUpdate};
pub use time_entry::{BillingStatus, EntryBilling, NewTimeEntry, TimeEntry};
