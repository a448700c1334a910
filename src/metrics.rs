//! Metrics and observability support for the gateway core.
//!
//! Prometheus metrics for the batching, caching and admission layers.
//!
//! # Metrics Exposed
//!
//! - `gateway_cache_operations_total` - Cache operations by result
//!   (hit_local, hit_shared, miss, set, delete, degraded)
//! - `gateway_batch_size` - Histogram of dispatched batch sizes
//! - `gateway_operation_cost` - Histogram of estimated operation costs
//! - `gateway_rate_limit_rejections_total` - Rate-limit rejections by role
//! - `gateway_admissions_total` - Admission outcomes by stage and result
//!
//! Metrics live in an instance [`prometheus::Registry`] owned by the process
//! context rather than the global default registry, so tests and embedders
//! can hold independent instances.

use prometheus::{
    Histogram, HistogramOpts, IntCounterVec, Opts, Registry, TextEncoder,
};

/// Histogram buckets for batch sizes (keys per dispatch)
const BATCH_SIZE_BUCKETS: &[f64] = &[1.0, 2.0, 5.0, 10.0, 25.0, 50.0, 100.0];

/// Histogram buckets for operation cost estimates
const COST_BUCKETS: &[f64] = &[
    1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0,
];

/// Gateway metrics for Prometheus scraping.
pub struct Metrics {
    registry: Registry,
    /// Cache operations by result: hit_local, hit_shared, miss, set, delete, degraded
    pub cache_operations: IntCounterVec,
    /// Keys per dispatched batch
    pub batch_size: Histogram,
    /// Estimated operation cost
    pub operation_cost: Histogram,
    /// Rate-limit rejections by role
    pub rate_limit_rejections: IntCounterVec,
    /// Admission outcomes by stage and result
    pub admissions: IntCounterVec,
}

impl Metrics {
    /// Create a metrics instance backed by its own registry
    pub fn new() -> crate::Result<Self> {
        let registry = Registry::new();

        let cache_operations = IntCounterVec::new(
            Opts::new(
                "gateway_cache_operations_total",
                "Cache operations by result",
            ),
            &["result"],
        )
        .map_err(|e| crate::Error::Internal(format!("metric registration: {e}")))?;

        let batch_size = Histogram::with_opts(
            HistogramOpts::new("gateway_batch_size", "Keys per dispatched batch")
                .buckets(BATCH_SIZE_BUCKETS.to_vec()),
        )
        .map_err(|e| crate::Error::Internal(format!("metric registration: {e}")))?;

        let operation_cost = Histogram::with_opts(
            HistogramOpts::new("gateway_operation_cost", "Estimated operation cost")
                .buckets(COST_BUCKETS.to_vec()),
        )
        .map_err(|e| crate::Error::Internal(format!("metric registration: {e}")))?;

        let rate_limit_rejections = IntCounterVec::new(
            Opts::new(
                "gateway_rate_limit_rejections_total",
                "Rate-limit rejections by role",
            ),
            &["role"],
        )
        .map_err(|e| crate::Error::Internal(format!("metric registration: {e}")))?;

        let admissions = IntCounterVec::new(
            Opts::new("gateway_admissions_total", "Admission outcomes"),
            &["stage", "result"],
        )
        .map_err(|e| crate::Error::Internal(format!("metric registration: {e}")))?;

        for collector in [
            Box::new(cache_operations.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(batch_size.clone()),
            Box::new(operation_cost.clone()),
            Box::new(rate_limit_rejections.clone()),
            Box::new(admissions.clone()),
        ] {
            registry
                .register(collector)
                .map_err(|e| crate::Error::Internal(format!("metric registration: {e}")))?;
        }

        Ok(Self {
            registry,
            cache_operations,
            batch_size,
            operation_cost,
            rate_limit_rejections,
            admissions,
        })
    }

    /// Record a cache operation outcome
    pub fn record_cache(&self, result: &str) {
        self.cache_operations.with_label_values(&[result]).inc();
    }

    /// Record the size of a dispatched batch
    pub fn record_batch_size(&self, size: usize) {
        self.batch_size.observe(size as f64);
    }

    /// Record an estimated operation cost
    pub fn record_operation_cost(&self, cost: u64) {
        self.operation_cost.observe(cost as f64);
    }

    /// Record a rate-limit rejection for a role
    pub fn record_rate_limit_rejection(&self, role: &str) {
        self.rate_limit_rejections.with_label_values(&[role]).inc();
    }

    /// Record an admission outcome for a pipeline stage
    pub fn record_admission(&self, stage: &str, result: &str) {
        self.admissions.with_label_values(&[stage, result]).inc();
    }

    /// Render all metrics in Prometheus text format
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder
            .encode_to_string(&metric_families)
            .unwrap_or_default()
    }
}
