//! Allowance engine.
//!
//! Splits logged time into the part covered by a client's free annual
//! allowance and the billable remainder, and derives the client's yearly
//! usage counter. Everything here is a pure function of its inputs; the
//! store persists the results and `BillingService` serializes access.

use crate::models::{AllowanceSummary, BillingStatus, Client, EntryBilling, TimeEntry, UsageUpdate};
use crate::services::error::BillingError;
use chrono::{DateTime, Datelike, TimeZone, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const MINUTES_PER_HOUR: i64 = 60;

/// Monetary amounts are stored in cents.
pub const MONEY_SCALE: u32 = 2;

/// Decimal places kept on persisted hour counters.
pub const HOURS_SCALE: u32 = 6;

/// Decimal places kept when an hour counter is read back as minutes. Coarse
/// enough to absorb the `HOURS_SCALE` rounding of a stored counter.
pub const MINUTE_SCALE: u32 = 2;

/// True when the stored counter belongs to an earlier calendar year (or was
/// never reset) and must be treated as zero.
pub fn needs_year_reset(last_year_reset: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match last_year_reset {
        None => true,
        Some(reset) => reset.year() < now.year(),
    }
}

/// Hours used in the current year, honouring stale-counter semantics.
pub fn effective_hours_used(client: &Client, now: DateTime<Utc>) -> Decimal {
    if needs_year_reset(client.last_year_reset, now) {
        Decimal::ZERO
    } else {
        client.yearly_hours_used
    }
}

/// Hour counter for `minutes`, rounded to `HOURS_SCALE`.
pub fn minutes_to_hours(minutes: Decimal) -> Decimal {
    (minutes / Decimal::from(MINUTES_PER_HOUR))
        .round_dp_with_strategy(HOURS_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// Minutes represented by an hour counter or allowance.
pub fn hours_to_minutes(hours: Decimal) -> Result<Decimal, BillingError> {
    hours
        .checked_mul(Decimal::from(MINUTES_PER_HOUR))
        .map(|m| m.round_dp_with_strategy(MINUTE_SCALE, RoundingStrategy::MidpointAwayFromZero))
        .ok_or_else(|| BillingError::invalid("hours exceed representable range"))
}

fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

fn ensure_duration(duration_minutes: i64) -> Result<(), BillingError> {
    if duration_minutes < 0 {
        return Err(BillingError::invalid(format!(
            "duration must not be negative (got {} minutes)",
            duration_minutes
        )));
    }
    Ok(())
}

fn ensure_rate(hourly_rate: Decimal) -> Result<(), BillingError> {
    if hourly_rate.is_sign_negative() && !hourly_rate.is_zero() {
        return Err(BillingError::invalid(format!(
            "hourly rate must not be negative (got {})",
            hourly_rate
        )));
    }
    Ok(())
}

/// Price of `minutes` at an hourly rate, divided once and rounded to cents.
fn amount(minutes: Decimal, hourly_rate: Decimal) -> Result<Decimal, BillingError> {
    minutes
        .checked_mul(hourly_rate)
        .map(|total| round_money(total / Decimal::from(MINUTES_PER_HOUR)))
        .ok_or_else(|| BillingError::invalid("amount exceeds representable range"))
}

/// Split `duration_minutes` against an allowance of which `used_minutes` is
/// already consumed. All quantities are minutes.
fn split(
    allowance_minutes: Decimal,
    used_minutes: Decimal,
    duration_minutes: i64,
    hourly_rate: Decimal,
) -> Result<EntryBilling, BillingError> {
    let remaining_free_minutes = (allowance_minutes - used_minutes).max(Decimal::ZERO);
    let duration = Decimal::from(duration_minutes);
    let free_minutes = duration.min(remaining_free_minutes);
    let billable_minutes = duration - free_minutes;

    Ok(EntryBilling {
        billing_status: BillingStatus::Pending,
        billable_amount: amount(billable_minutes, hourly_rate)?,
        // Developers are paid for every minute, allowance or not.
        developer_amount: amount(duration, hourly_rate)?,
        is_within_allowance: billable_minutes.is_zero(),
    })
}

/// Compute billing fields for a new entry against the client's allowance
/// state as of `now`.
pub fn evaluate_entry(
    client: &Client,
    duration_minutes: i64,
    hourly_rate: Decimal,
    now: DateTime<Utc>,
) -> Result<EntryBilling, BillingError> {
    ensure_duration(duration_minutes)?;
    ensure_rate(hourly_rate)?;

    split(
        hours_to_minutes(client.annual_hour_allowance)?,
        hours_to_minutes(effective_hours_used(client, now))?,
        duration_minutes,
        hourly_rate,
    )
}

/// New usage counter after an entry of `duration_minutes` is applied.
///
/// A year reset discards the prior counter entirely; historical usage is not
/// re-derived.
pub fn apply_usage(
    client: &Client,
    duration_minutes: i64,
    now: DateTime<Utc>,
) -> Result<UsageUpdate, BillingError> {
    ensure_duration(duration_minutes)?;
    let duration = Decimal::from(duration_minutes);

    if needs_year_reset(client.last_year_reset, now) {
        return Ok(UsageUpdate {
            yearly_hours_used: minutes_to_hours(duration),
            last_year_reset: Some(now),
        });
    }

    let used_minutes = hours_to_minutes(client.yearly_hours_used)?
        .checked_add(duration)
        .ok_or_else(|| BillingError::invalid("yearly hours exceed representable range"))?;

    Ok(UsageUpdate {
        yearly_hours_used: minutes_to_hours(used_minutes),
        last_year_reset: client.last_year_reset,
    })
}

/// Billing fields for one entry in a recalculation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedEntry {
    pub entry_id: Uuid,
    pub billing: EntryBilling,
}

/// Result of replaying a client's entries against its allowance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecalculationPlan {
    /// In application order (start time ascending).
    pub entries: Vec<PlannedEntry>,
    pub yearly_hours_used: Decimal,
}

impl RecalculationPlan {
    /// Number of entries whose billing fields differ from `current`.
    pub fn changed_count(&self, current: &[TimeEntry]) -> usize {
        self.entries
            .iter()
            .filter(|planned| {
                current
                    .iter()
                    .find(|e| e.entry_id == planned.entry_id)
                    .map(|e| e.billing() != planned.billing)
                    .unwrap_or(true)
            })
            .count()
    }
}

/// Replay every entry in start-time order from an empty counter.
///
/// Calendar-year boundaries inside the set are NOT honoured: all entries
/// draw on a single allowance pool. This differs from `apply_usage`, which
/// resets at year boundaries; the mismatch is kept as-is until the intended
/// behaviour is settled.
///
/// Every entry comes back as `Pending`, exactly as `evaluate_entry` would
/// produce it, so a pass also undoes earlier `Billed`/`Paid`/`WrittenOff`
/// transitions. Kept as-is for the same reason.
pub fn recalculate(
    annual_hour_allowance: Decimal,
    entries: &[TimeEntry],
) -> Result<RecalculationPlan, BillingError> {
    let allowance_minutes = hours_to_minutes(annual_hour_allowance)?;
    let mut ordered: Vec<&TimeEntry> = entries.iter().collect();
    ordered.sort_by(|a, b| {
        a.start_time
            .cmp(&b.start_time)
            .then_with(|| a.entry_id.cmp(&b.entry_id))
    });

    let mut cumulative_minutes = Decimal::ZERO;
    let mut planned = Vec::with_capacity(ordered.len());

    for entry in ordered {
        ensure_duration(entry.duration_minutes)?;
        ensure_rate(entry.hourly_rate)?;

        let billing = split(
            allowance_minutes,
            cumulative_minutes,
            entry.duration_minutes,
            entry.hourly_rate,
        )?;
        planned.push(PlannedEntry {
            entry_id: entry.entry_id,
            billing,
        });

        cumulative_minutes = cumulative_minutes
            .checked_add(Decimal::from(entry.duration_minutes))
            .ok_or_else(|| BillingError::invalid("yearly hours exceed representable range"))?;
    }

    Ok(RecalculationPlan {
        entries: planned,
        yearly_hours_used: minutes_to_hours(cumulative_minutes),
    })
}

/// Midnight UTC on January 1 of `target_year`.
pub fn year_start(target_year: i32) -> Result<DateTime<Utc>, BillingError> {
    Utc.with_ymd_and_hms(target_year, 1, 1, 0, 0, 0)
        .single()
        .ok_or_else(|| BillingError::invalid(format!("invalid target year {}", target_year)))
}

/// Duration in whole minutes: an explicit value wins, otherwise the span
/// between start and end rounded to the nearest minute. An open entry with
/// neither counts as zero.
pub fn resolve_duration_minutes(
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    explicit_minutes: Option<i64>,
) -> Result<i64, BillingError> {
    if let Some(minutes) = explicit_minutes {
        ensure_duration(minutes)?;
        return Ok(minutes);
    }

    match end_time {
        Some(end) if end < start_time => Err(BillingError::invalid(format!(
            "end time {} is before start time {}",
            end, start_time
        ))),
        Some(end) => {
            let seconds = (end - start_time).num_seconds();
            Ok((seconds + 30) / 60)
        }
        None => Ok(0),
    }
}

/// Entry rate, then developer rate, then the configured default.
pub fn resolve_hourly_rate(
    entry_rate: Option<Decimal>,
    developer_rate: Option<Decimal>,
    default_rate: Decimal,
) -> Result<Decimal, BillingError> {
    let rate = entry_rate.or(developer_rate).unwrap_or(default_rate);
    ensure_rate(rate)?;
    Ok(rate)
}

pub fn allowance_summary(client: &Client, now: DateTime<Utc>) -> AllowanceSummary {
    let hours_used = effective_hours_used(client, now);
    AllowanceSummary {
        client_id: client.client_id,
        annual_hour_allowance: client.annual_hour_allowance,
        hours_used,
        remaining_hours: (client.annual_hour_allowance - hours_used).max(Decimal::ZERO),
        needs_year_reset: needs_year_reset(client.last_year_reset, now),
    }
}
