//! Tracing, logging, metrics (shared setup).

/// Initialize process-wide observability (tracing/logging + metrics recorder).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
    let _ = metrics::init_metrics();
}

/// Tracing configuration (filters, layers).
pub mod tracing;

/// Metric names and Prometheus exporter.
pub mod metrics;
