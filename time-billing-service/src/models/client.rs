//! Client, developer and task models.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Client with the fields the allowance engine reads and writes.
///
/// `yearly_hours_used` is only meaningful for the calendar year of
/// `last_year_reset`; readers must go through the allowance engine rather
/// than trusting the stored value.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Client {
    pub client_id: Uuid,
    pub name: String,
    pub annual_hour_allowance: Decimal,
    pub yearly_hours_used: Decimal,
    pub last_year_reset: Option<DateTime<Utc>>,
    /// Bumped on every write to the usage fields.
    pub usage_version: i64,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

/// Input for creating a client.
#[derive(Debug, Clone)]
pub struct NewClient {
    pub name: String,
    pub annual_hour_allowance: Decimal,
    pub yearly_hours_used: Decimal,
    pub last_year_reset: Option<DateTime<Utc>>,
}

impl NewClient {
    pub fn new(name: impl Into<String>, annual_hour_allowance: Decimal) -> Self {
        Self {
            name: name.into(),
            annual_hour_allowance,
            yearly_hours_used: Decimal::ZERO,
            last_year_reset: None,
        }
    }

    pub fn with_usage(mut self, yearly_hours_used: Decimal, last_year_reset: DateTime<Utc>) -> Self {
        self.yearly_hours_used = yearly_hours_used;
        self.last_year_reset = Some(last_year_reset);
        self
    }
}

/// Person who performs work; carries the second tier of the rate fallback.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Developer {
    pub developer_id: Uuid,
    pub name: String,
    pub hourly_rate: Option<Decimal>,
    pub created_utc: DateTime<Utc>,
}

/// Task owned by exactly one client.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub task_id: Uuid,
    pub client_id: Uuid,
    pub title: String,
    pub created_utc: DateTime<Utc>,
}

/// New value of a client's usage counter after an entry is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageUpdate {
    pub yearly_hours_used: Decimal,
    pub last_year_reset: Option<DateTime<Utc>>,
}

/// Allowance position of a client as of a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowanceSummary {
    pub client_id: Uuid,
    pub annual_hour_allowance: Decimal,
    pub hours_used: Decimal,
    pub remaining_hours: Decimal,
    /// True when the stored counter belongs to an earlier year.
    pub needs_year_reset: bool,
}
