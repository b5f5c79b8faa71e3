//! # Metrics
//!
//! Prometheus metrics for monitoring the operator.
//!
//! ## Metrics Exposed
//!
//! - `opensearch_operator_reconciliations_total` - Total number of reconciliations
//! - `opensearch_operator_reconciliation_errors_total` - Total number of reconciliation errors
//! - `opensearch_operator_status_updates_total` - Total number of status subresource patches
//! - `opensearch_operator_watch_restarts_total` - Total number of watch reconnects
//! - `opensearch_operator_snapshot_errors_total` - Total number of failed snapshot repository reconciliations
//! - `opensearch_operator_managed_clusters` - Current number of managed clusters

use anyhow::Result;
use prometheus::{IntCounter, IntGauge, Registry};
use std::sync::LazyLock;

pub(crate) static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static RECONCILIATIONS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "opensearch_operator_reconciliations_total",
        "Total number of reconciliations",
    )
    .expect("Failed to create RECONCILIATIONS_TOTAL metric - this should never happen")
});

static RECONCILIATION_ERRORS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "opensearch_operator_reconciliation_errors_total",
        "Total number of reconciliation errors",
    )
    .expect("Failed to create RECONCILIATION_ERRORS_TOTAL metric - this should never happen")
});

static STATUS_UPDATES_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "opensearch_operator_status_updates_total",
        "Total number of status subresource patches",
    )
    .expect("Failed to create STATUS_UPDATES_TOTAL metric - this should never happen")
});

static WATCH_RESTARTS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "opensearch_operator_watch_restarts_total",
        "Total number of watch reconnects after transient errors",
    )
    .expect("Failed to create WATCH_RESTARTS_TOTAL metric - this should never happen")
});

static SNAPSHOT_ERRORS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "opensearch_operator_snapshot_errors_total",
        "Total number of failed snapshot repository reconciliations",
    )
    .expect("Failed to create SNAPSHOT_ERRORS_TOTAL metric - this should never happen")
});

static MANAGED_CLUSTERS: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "opensearch_operator_managed_clusters",
        "Current number of managed clusters",
    )
    .expect("Failed to create MANAGED_CLUSTERS metric - this should never happen")
});

/// Register all metrics with the registry. Call once at startup.
pub fn register_metrics() -> Result<()> {
    REGISTRY.register(Box::new(RECONCILIATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(STATUS_UPDATES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(WATCH_RESTARTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(SNAPSHOT_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(MANAGED_CLUSTERS.clone()))?;
    Ok(())
}

pub fn increment_reconciliations() {
    RECONCILIATIONS_TOTAL.inc();
}

pub fn increment_reconciliation_errors() {
    RECONCILIATION_ERRORS_TOTAL.inc();
}

pub fn increment_status_updates() {
    STATUS_UPDATES_TOTAL.inc();
}

pub fn increment_watch_restarts() {
    WATCH_RESTARTS_TOTAL.inc();
}

pub fn increment_snapshot_errors() {
    SNAPSHOT_ERRORS_TOTAL.inc();
}

pub fn set_managed_clusters(count: i64) {
    MANAGED_CLUSTERS.set(count);
}
