//! Time entry model and billing status lifecycle.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Billing status of a time entry.
///
/// New entries are always `Pending`; the remaining states are reached through
/// the invoicing workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BillingStatus {
    Pending,
    Billed,
    Paid,
    WrittenOff,
}

impl BillingStatus {
    /// Get string representation for database.
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingStatus::Pending => "PENDING",
            BillingStatus::Billed => "BILLED",
            BillingStatus::Paid => "PAID",
            BillingStatus::WrittenOff => "WRITTEN_OFF",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(BillingStatus::Pending),
            "BILLED" => Some(BillingStatus::Billed),
            "PAID" => Some(BillingStatus::Paid),
            "WRITTEN_OFF" => Some(BillingStatus::WrittenOff),
            _ => None,
        }
    }

    /// PENDING -> BILLED -> PAID, and PENDING/BILLED -> WRITTEN_OFF.
    pub fn can_transition_to(self, next: BillingStatus) -> bool {
        matches!(
            (self, next),
            (BillingStatus::Pending, BillingStatus::Billed)
                | (BillingStatus::Billed, BillingStatus::Paid)
                | (BillingStatus::Pending, BillingStatus::WrittenOff)
                | (BillingStatus::Billed, BillingStatus::WrittenOff)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, BillingStatus::Paid | BillingStatus::WrittenOff)
    }
}

impl std::fmt::Display for BillingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Logged unit of work against a task.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TimeEntry {
    pub entry_id: Uuid,
    pub task_id: Uuid,
    pub developer_id: Option<Uuid>,
    pub description: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_minutes: i64,
    pub hourly_rate: Decimal,
    pub billing_status: BillingStatus,
    pub billable_amount: Decimal,
    pub developer_amount: Decimal,
    pub is_within_allowance: bool,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl TimeEntry {
    /// Current billing fields of the entry.
    pub fn billing(&self) -> EntryBilling {
        EntryBilling {
            billing_status: self.billing_status,
            billable_amount: self.billable_amount,
            developer_amount: self.developer_amount,
            is_within_allowance: self.is_within_allowance,
        }
    }

    pub fn apply_billing(&mut self, billing: &EntryBilling) {
        self.billing_status = billing.billing_status;
        self.billable_amount = billing.billable_amount;
        self.developer_amount = billing.developer_amount;
        self.is_within_allowance = billing.is_within_allowance;
    }
}

/// Input for logging time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTimeEntry {
    pub task_id: Uuid,
    pub developer_id: Option<Uuid>,
    pub description: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    /// Takes precedence over `end_time - start_time` when present.
    pub duration_minutes: Option<i64>,
    pub hourly_rate: Option<Decimal>,
}

impl NewTimeEntry {
    pub fn new(task_id: Uuid, start_time: DateTime<Utc>) -> Self {
        Self {
            task_id,
            developer_id: None,
            description: None,
            start_time,
            end_time: None,
            duration_minutes: None,
            hourly_rate: None,
        }
    }

    pub fn minutes(mut self, duration_minutes: i64) -> Self {
        self.duration_minutes = Some(duration_minutes);
        self
    }

    pub fn ending_at(mut self, end_time: DateTime<Utc>) -> Self {
        self.end_time = Some(end_time);
        self
    }

    pub fn rate(mut self, hourly_rate: Decimal) -> Self {
        self.hourly_rate = Some(hourly_rate);
        self
    }

    pub fn by_developer(mut self, developer_id: Uuid) -> Self {
        self.developer_id = Some(developer_id);
        self
    }
}

/// Billing fields computed for one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryBilling {
    pub billing_status: BillingStatus,
    pub billable_amount: Decimal,
    pub developer_amount: Decimal,
    pub is_within_allowance: bool,
}
