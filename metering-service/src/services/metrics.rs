//! Metrics module for metering-service.
//! Provides Prometheus metrics for the usage pipeline, provider calls and webhooks.

use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, opts, register_histogram_vec, register_int_counter_vec, register_int_gauge,
    Encoder, HistogramVec, IntCounterVec, IntGauge, TextEncoder,
};
use std::sync::OnceLock;

/// Database query duration histogram
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "metering_db_query_duration_seconds",
            "Database query duration"
        ),
        &["operation"]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Outbound billing provider call duration histogram
pub static PROVIDER_REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "metering_provider_request_duration_seconds",
            "Billing provider request duration",
            vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
        ),
        &["operation", "status"]
    )
    .expect("Failed to register PROVIDER_REQUEST_DURATION")
});

/// Quantity accepted by the tracker
pub static USAGE_TRACKED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Flush attempts by trigger and outcome
pub static USAGE_FLUSHES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Usage rows written by flushes
pub static USAGE_RECORDS_FLUSHED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Distinct keys currently buffered
pub static USAGE_BUFFERED_KEYS: OnceLock<IntGauge> = OnceLock::new();

/// Usage groups pushed to the provider ledger
pub static USAGE_REPORTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Webhook events by type and outcome
pub static WEBHOOK_EVENTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Subscription operations
pub static SUBSCRIPTION_OPERATIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Limit checks that came back exceeded
pub static LIMIT_EXCEEDED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Error counter for alerting
pub static ERRORS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Initialize all metrics. Safe to call more than once.
pub fn init_metrics() {
    USAGE_TRACKED_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "metering_usage_tracked_total",
                "Total quantity tracked by metric"
            ),
            &["metric"]
        )
        .expect("Failed to register USAGE_TRACKED_TOTAL")
    });

    USAGE_FLUSHES_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "metering_usage_flushes_total",
                "Usage buffer flushes by trigger and outcome"
            ),
            &["trigger", "outcome"]
        )
        .expect("Failed to register USAGE_FLUSHES_TOTAL")
    });

    USAGE_RECORDS_FLUSHED_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "metering_usage_records_flushed_total",
                "Usage records written by flushes"
            ),
            &["metric"]
        )
        .expect("Failed to register USAGE_RECORDS_FLUSHED_TOTAL")
    });

    USAGE_BUFFERED_KEYS.get_or_init(|| {
        register_int_gauge!(opts!(
            "metering_usage_buffered_keys",
            "Distinct tenant/metric keys waiting for the next flush"
        ))
        .expect("Failed to register USAGE_BUFFERED_KEYS")
    });

    USAGE_REPORTS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "metering_usage_reports_total",
                "Usage groups reported to the billing provider by outcome"
            ),
            &["outcome"]
        )
        .expect("Failed to register USAGE_REPORTS_TOTAL")
    });

    WEBHOOK_EVENTS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "metering_webhook_events_total",
                "Webhook events by type and outcome"
            ),
            &["event_type", "outcome"]
        )
        .expect("Failed to register WEBHOOK_EVENTS_TOTAL")
    });

    SUBSCRIPTION_OPERATIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "metering_subscription_operations_total",
                "Subscription operations by type"
            ),
            &["operation"]
        )
        .expect("Failed to register SUBSCRIPTION_OPERATIONS_TOTAL")
    });

    LIMIT_EXCEEDED_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "metering_limit_exceeded_total",
                "Limit checks that reported an exceeded cap"
            ),
            &["metric"]
        )
        .expect("Failed to register LIMIT_EXCEEDED_TOTAL")
    });

    ERRORS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("metering_errors_total", "Total errors by type for alerting"),
            &["error_type", "operation"]
        )
        .expect("Failed to register ERRORS_TOTAL")
    });

    // Force initialization of lazy statics
    let _ = &*DB_QUERY_DURATION;
    let _ = &*PROVIDER_REQUEST_DURATION;
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

pub fn record_usage_tracked(metric: &str, quantity: i64) {
    if let Some(counter) = USAGE_TRACKED_TOTAL.get() {
        counter
            .with_label_values(&[metric])
            .inc_by(quantity.max(0) as u64);
    }
}

pub fn record_flush(trigger: &str, outcome: &str) {
    if let Some(counter) = USAGE_FLUSHES_TOTAL.get() {
        counter.with_label_values(&[trigger, outcome]).inc();
    }
}

pub fn record_records_flushed(metric: &str, count: u64) {
    if let Some(counter) = USAGE_RECORDS_FLUSHED_TOTAL.get() {
        counter.with_label_values(&[metric]).inc_by(count);
    }
}

pub fn set_buffered_keys(count: usize) {
    if let Some(gauge) = USAGE_BUFFERED_KEYS.get() {
        gauge.set(count as i64);
    }
}

pub fn record_usage_report(outcome: &str) {
    if let Some(counter) = USAGE_REPORTS_TOTAL.get() {
        counter.with_label_values(&[outcome]).inc();
    }
}

pub fn record_webhook_event(event_type: &str, outcome: &str) {
    if let Some(counter) = WEBHOOK_EVENTS_TOTAL.get() {
        counter.with_label_values(&[event_type, outcome]).inc();
    }
}

pub fn record_subscription_operation(operation: &str) {
    if let Some(counter) = SUBSCRIPTION_OPERATIONS_TOTAL.get() {
        counter.with_label_values(&[operation]).inc();
    }
}

pub fn record_limit_exceeded(metric: &str) {
    if let Some(counter) = LIMIT_EXCEEDED_TOTAL.get() {
        counter.with_label_values(&[metric]).inc();
    }
}

/// Record an error for alerting.
pub fn record_error(error_type: &str, operation: &str) {
    if let Some(counter) = ERRORS_TOTAL.get() {
        counter.with_label_values(&[error_type, operation]).inc();
    }
}
