//! # Metrics
//!
//! Prometheus metrics for monitoring the reconciler-manager.
//!
//! ## Metrics Exposed
//!
//! - `reconciler_manager_reconciliations_total` - Reconcile passes by outcome
//! - `reconciler_manager_reconciliation_errors_total` - Failed passes by error class
//! - `reconciler_manager_reconciliation_duration_seconds` - Duration of reconcile passes
//! - `reconciler_manager_dependent_operations_total` - Writes to dependents by kind and operation
//! - `reconciler_manager_drift_corrections_total` - External changes reverted, by kind
//! - `reconciler_manager_write_conflicts_total` - Writes that lost a race, by kind
//! - `reconciler_manager_reconciles_in_flight` - Reconcile passes currently running

use anyhow::Result;
use prometheus::{Histogram, IntCounterVec, IntGauge, Registry};
use std::sync::LazyLock;

// Metrics
pub(crate) static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static RECONCILIATIONS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "reconciler_manager_reconciliations_total",
            "Total number of reconcile passes by outcome",
        ),
        &["outcome"],
    )
    .expect("Failed to create RECONCILIATIONS_TOTAL metric - this should never happen")
});

static RECONCILIATION_ERRORS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "reconciler_manager_reconciliation_errors_total",
            "Total number of failed reconcile passes by error class",
        ),
        &["reason"],
    )
    .expect("Failed to create RECONCILIATION_ERRORS_TOTAL metric - this should never happen")
});

static RECONCILIATION_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "reconciler_manager_reconciliation_duration_seconds",
            "Duration of reconciliation in seconds",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0]),
    )
    .expect("Failed to create RECONCILIATION_DURATION metric - this should never happen")
});

static DEPENDENT_OPERATIONS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "reconciler_manager_dependent_operations_total",
            "Total number of writes to dependent objects by kind and operation",
        ),
        &["kind", "operation"],
    )
    .expect("Failed to create DEPENDENT_OPERATIONS_TOTAL metric - this should never happen")
});

static DRIFT_CORRECTIONS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "reconciler_manager_drift_corrections_total",
            "Total number of external changes to managed fields that were reverted",
        ),
        &["kind"],
    )
    .expect("Failed to create DRIFT_CORRECTIONS_TOTAL metric - this should never happen")
});

static WRITE_CONFLICTS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "reconciler_manager_write_conflicts_total",
            "Total number of dependent writes that raced another writer",
        ),
        &["kind"],
    )
    .expect("Failed to create WRITE_CONFLICTS_TOTAL metric - this should never happen")
});

static RECONCILES_IN_FLIGHT: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "reconciler_manager_reconciles_in_flight",
        "Number of reconcile passes currently running",
    )
    .expect("Failed to create RECONCILES_IN_FLIGHT metric - this should never happen")
});

/// Register all metrics with the registry
///
/// Call once at startup, before the metrics endpoint is served.
pub fn register_metrics() -> Result<()> {
    REGISTRY.register(Box::new(RECONCILIATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_DURATION.clone()))?;
    REGISTRY.register(Box::new(DEPENDENT_OPERATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DRIFT_CORRECTIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(WRITE_CONFLICTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILES_IN_FLIGHT.clone()))?;

    Ok(())
}

pub fn increment_reconciliations(outcome: &str) {
    RECONCILIATIONS_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn increment_reconciliation_errors(reason: &str) {
    RECONCILIATION_ERRORS_TOTAL.with_label_values(&[reason]).inc();
}

pub fn observe_reconciliation_duration(duration: f64) {
    RECONCILIATION_DURATION.observe(duration);
}

pub fn record_dependent_operation(kind: &str, operation: &str) {
    DEPENDENT_OPERATIONS_TOTAL
        .with_label_values(&[kind, operation])
        .inc();
}

pub fn increment_drift_corrections(kind: &str) {
    DRIFT_CORRECTIONS_TOTAL.with_label_values(&[kind]).inc();
}

pub fn increment_write_conflicts(kind: &str) {
    WRITE_CONFLICTS_TOTAL.with_label_values(&[kind]).inc();
}

pub fn increment_reconciles_in_flight() {
    RECONCILES_IN_FLIGHT.inc();
}

pub fn decrement_reconciles_in_flight() {
    RECONCILES_IN_FLIGHT.dec();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labelled_counters_accumulate() {
        let before = DRIFT_CORRECTIONS_TOTAL
            .with_label_values(&["test-kind"])
            .get();
        increment_drift_corrections("test-kind");
        increment_drift_corrections("test-kind");
        assert_eq!(
            DRIFT_CORRECTIONS_TOTAL
                .with_label_values(&["test-kind"])
                .get(),
            before + 2
        );
    }
}
