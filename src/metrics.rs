//! Prometheus metrics for the reconcile loops

use crate::error::{Error, Result};
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};
use std::time::Instant;

/// Per-controller reconcile metrics
#[derive(Clone)]
pub struct ControllerMetrics {
    reconciles: IntCounterVec,
    failures: IntCounterVec,
    duration: HistogramVec,
}

impl ControllerMetrics {
    /// Create the metric families and register them with `registry`
    pub fn register(registry: &Registry) -> Result<Self> {
        let reconciles = IntCounterVec::new(
            Opts::new(
                "storage_topology_reconciles_total",
                "Total number of reconcile passes",
            ),
            &["controller"],
        )
        .map_err(metrics_error)?;
        let failures = IntCounterVec::new(
            Opts::new(
                "storage_topology_reconcile_errors_total",
                "Reconcile passes that returned an error",
            ),
            &["controller", "reason"],
        )
        .map_err(metrics_error)?;
        let duration = HistogramVec::new(
            HistogramOpts::new(
                "storage_topology_reconcile_duration_seconds",
                "Duration of reconcile passes",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0]),
            &["controller"],
        )
        .map_err(metrics_error)?;

        registry
            .register(Box::new(reconciles.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(failures.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(duration.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            reconciles,
            failures,
            duration,
        })
    }

    /// Record one finished pass
    pub fn observe(&self, controller: &str, started: Instant, error: Option<&Error>) {
        self.reconciles.with_label_values(&[controller]).inc();
        self.duration
            .with_label_values(&[controller])
            .observe(started.elapsed().as_secs_f64());
        if let Some(error) = error {
            self.failures
                .with_label_values(&[controller, error.reason()])
                .inc();
        }
    }

    pub fn reconciles(&self, controller: &str) -> u64 {
        self.reconciles.with_label_values(&[controller]).get()
    }

    pub fn failures(&self, controller: &str, reason: &str) -> u64 {
        self.failures.with_label_values(&[controller, reason]).get()
    }
}

fn metrics_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics registration failed: {}", e))
}
