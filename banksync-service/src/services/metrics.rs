//! Prometheus metrics for banksync-service.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec, TextEncoder,
};

/// Histogram for database query duration.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "banksync_db_query_duration_seconds",
        "Database query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Counter for aggregator API calls by endpoint and outcome.
pub static AGGREGATOR_REQUESTS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "banksync_aggregator_requests_total",
        "Total number of aggregator API requests",
        &["endpoint", "status"]
    )
    .expect("Failed to register AGGREGATOR_REQUESTS")
});

/// Counter for connection lifecycle transitions.
pub static CONNECTION_TRANSITIONS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "banksync_connection_transitions_total",
        "Total number of connection state transitions",
        &["to_status"]
    )
    .expect("Failed to register CONNECTION_TRANSITIONS")
});

/// Counter for sync scheduler runs.
pub static SYNC_RUNS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "banksync_sync_runs_total",
        "Total number of transaction sync runs",
        &["status"]
    )
    .expect("Failed to register SYNC_RUNS")
});

/// Counter for newly ingested bank movements.
pub static MOVEMENTS_INGESTED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "banksync_movements_ingested_total",
        "Total number of newly ingested bank movements",
        &["direction"]
    )
    .expect("Failed to register MOVEMENTS_INGESTED")
});

/// Counter for reconciliation match outcomes.
pub static MATCH_OUTCOMES: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "banksync_match_outcomes_total",
        "Total number of reconciliation match outcomes",
        &["outcome"]
    )
    .expect("Failed to register MATCH_OUTCOMES")
});

/// Counter for recurring obligation scheduler actions.
pub static RECURRING_ACTIONS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "banksync_recurring_actions_total",
        "Total number of recurring scheduler actions",
        &["action"]
    )
    .expect("Failed to register RECURRING_ACTIONS")
});

/// Counter for errors by type.
pub static ERRORS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "banksync_errors_total",
        "Total number of errors",
        &["error_type"]
    )
    .expect("Failed to register ERRORS")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&DB_QUERY_DURATION);
    Lazy::force(&AGGREGATOR_REQUESTS);
    Lazy::force(&CONNECTION_TRANSITIONS);
    Lazy::force(&SYNC_RUNS);
    Lazy::force(&MOVEMENTS_INGESTED);
    Lazy::force(&MATCH_OUTCOMES);
    Lazy::force(&RECURRING_ACTIONS);
    Lazy::force(&ERRORS);
}

/// Get all metrics as Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

pub fn record_aggregator_request(endpoint: &str, status: &str) {
    AGGREGATOR_REQUESTS
        .with_label_values(&[endpoint, status])
        .inc();
}

pub fn record_connection_transition(to_status: &str) {
    CONNECTION_TRANSITIONS.with_label_values(&[to_status]).inc();
}

pub fn record_sync_run(status: &str) {
    SYNC_RUNS.with_label_values(&[status]).inc();
}

pub fn record_movement_ingested(direction: &str) {
    MOVEMENTS_INGESTED.with_label_values(&[direction]).inc();
}

pub fn record_match_outcome(outcome: &str) {
    MATCH_OUTCOMES.with_label_values(&[outcome]).inc();
}

pub fn record_recurring_action(action: &str) {
    RECURRING_ACTIONS.with_label_values(&[action]).inc();
}

pub fn record_error(error_type: &str) {
    ERRORS.with_label_values(&[error_type]).inc();
}
