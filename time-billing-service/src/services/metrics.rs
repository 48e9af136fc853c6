//! Metrics module for time-billing-service.
//! Provides Prometheus metrics for allowance accounting.

use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, opts, register_histogram_vec, register_int_counter_vec, CounterVec, Encoder,
    HistogramVec, IntCounterVec, TextEncoder,
};
use std::sync::OnceLock;

/// Database query duration histogram
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "time_billing_db_query_duration_seconds",
            "Database query duration"
        ),
        &["operation"]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Time entries logged, split by allowance outcome
pub static TIME_ENTRIES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Lost compare-and-swap races on a client's usage counter
pub static USAGE_CONFLICTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Recalculation passes by outcome
pub static RECALCULATIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Year resets by scope (single client or bulk)
pub static YEAR_RESETS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Error counter for alerting
pub static ERRORS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Billable amount of newly logged entries
pub static BILLABLE_AMOUNT_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Initialize all metrics. Call once at startup.
pub fn init_metrics() {
    TIME_ENTRIES_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "time_billing_entries_total",
                "Total time entries logged by allowance outcome"
            ),
            &["allowance"]
        )
        .expect("Failed to register TIME_ENTRIES_TOTAL")
    });

    USAGE_CONFLICTS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "time_billing_usage_conflicts_total",
                "Concurrent usage updates detected by operation"
            ),
            &["operation"]
        )
        .expect("Failed to register USAGE_CONFLICTS_TOTAL")
    });

    RECALCULATIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "time_billing_recalculations_total",
                "Total recalculation passes by status"
            ),
            &["status"]
        )
        .expect("Failed to register RECALCULATIONS_TOTAL")
    });

    YEAR_RESETS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("time_billing_year_resets_total", "Clients reset by scope"),
            &["scope"]
        )
        .expect("Failed to register YEAR_RESETS_TOTAL")
    });

    ERRORS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("time_billing_errors_total", "Total errors by type for alerting"),
            &["error_type", "operation"]
        )
        .expect("Failed to register ERRORS_TOTAL")
    });

    BILLABLE_AMOUNT_TOTAL.get_or_init(|| {
        prometheus::register_counter_vec!(
            prometheus::opts!(
                "time_billing_billable_amount_total",
                "Billable amount of logged time by kind"
            ),
            &["kind"]
        )
        .expect("Failed to register BILLABLE_AMOUNT_TOTAL")
    });

    // Force initialization of lazy statics
    let _ = &*DB_QUERY_DURATION;
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Record a logged time entry.
pub fn record_time_entry(within_allowance: bool, billable_amount: f64, developer_amount: f64) {
    if let Some(counter) = TIME_ENTRIES_TOTAL.get() {
        let label = if within_allowance { "within" } else { "exceeded" };
        counter.with_label_values(&[label]).inc();
    }
    if let Some(counter) = BILLABLE_AMOUNT_TOTAL.get() {
        counter
            .with_label_values(&["client"])
            .inc_by(billable_amount.abs());
        counter
            .with_label_values(&["developer"])
            .inc_by(developer_amount.abs());
    }
}

/// Record a lost usage race.
pub fn record_usage_conflict(operation: &str) {
    if let Some(counter) = USAGE_CONFLICTS_TOTAL.get() {
        counter.with_label_values(&[operation]).inc();
    }
}

/// Record a recalculation pass.
pub fn record_recalculation(status: &str) {
    if let Some(counter) = RECALCULATIONS_TOTAL.get() {
        counter.with_label_values(&[status]).inc();
    }
}

/// Record clients reset.
pub fn record_year_reset(scope: &str, clients: u64) {
    if let Some(counter) = YEAR_RESETS_TOTAL.get() {
        counter.with_label_values(&[scope]).inc_by(clients);
    }
}

/// Record an error for alerting.
pub fn record_error(error_type: &str, operation: &str) {
    if let Some(counter) = ERRORS_TOTAL.get() {
        counter.with_label_values(&[error_type, operation]).inc();
    }
}
