//! Provisioning Metrics
//!
//! Prometheus counters and histograms for the storage operations the drivers
//! perform. Metrics are registered into a caller owned registry rather than
//! the process global one, so several operators (or tests) can coexist.

use crate::crd::StorageBackend;
use crate::error::Result;
use prometheus::{histogram_opts, opts, HistogramVec, IntCounterVec, Registry};
use std::time::Instant;

/// Metrics recorded by the provisioning state machine
#[derive(Clone)]
pub struct Metrics {
    pub operations: IntCounterVec,
    pub operation_duration: HistogramVec,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let operations = IntCounterVec::new(
            opts!(
                "registry_storage_operations_total",
                "Storage operations by backend, operation and result"
            ),
            &["backend", "operation", "result"],
        )?;
        let operation_duration = HistogramVec::new(
            histogram_opts!(
                "registry_storage_operation_duration_seconds",
                "Duration of storage operations in seconds",
                vec![0.05, 0.1, 0.5, 1., 5., 15., 60., 300.]
            ),
            &["backend", "operation"],
        )?;

        Ok(Self {
            operations,
            operation_duration,
        })
    }

    /// Register all metrics with the given registry
    pub fn register(self, registry: &Registry) -> Result<Self> {
        registry.register(Box::new(self.operations.clone()))?;
        registry.register(Box::new(self.operation_duration.clone()))?;
        Ok(self)
    }

    /// Start timing an operation
    pub fn start(&self, backend: StorageBackend, operation: &'static str) -> OperationTimer<'_> {
        OperationTimer {
            metrics: self,
            backend,
            operation,
            started: Instant::now(),
        }
    }
}

/// Measures one operation; consumed by `finish`
pub struct OperationTimer<'a> {
    metrics: &'a Metrics,
    backend: StorageBackend,
    operation: &'static str,
    started: Instant,
}

impl OperationTimer<'_> {
    pub fn finish<T>(self, result: &Result<T>) {
        let backend = self.backend.to_string();
        let outcome = if result.is_ok() { "success" } else { "error" };
        self.metrics
            .operations
            .with_label_values(&[backend.as_str(), self.operation, outcome])
            .inc();
        self.metrics
            .operation_duration
            .with_label_values(&[backend.as_str(), self.operation])
            .observe(self.started.elapsed().as_secs_f64());
    }
}
