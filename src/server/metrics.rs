//! Prometheus metrics for router operations
//!
//! - `flowshift_router_operations_total{router,operation,result}`
//! - `flowshift_router_operation_duration_seconds{router,operation}`
//! - `flowshift_canary_weight{name,namespace}`

use prometheus::{
    Encoder, GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

pub type SharedMetrics = Arc<ControllerMetrics>;

pub struct ControllerMetrics {
    registry: Registry,
    router_operations: IntCounterVec,
    router_duration: HistogramVec,
    canary_weight: GaugeVec,
}

impl ControllerMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let router_operations = IntCounterVec::new(
            Opts::new(
                "flowshift_router_operations_total",
                "Router operations by router, operation and result",
            ),
            &["router", "operation", "result"],
        )?;
        let router_duration = HistogramVec::new(
            HistogramOpts::new(
                "flowshift_router_operation_duration_seconds",
                "Router operation latency",
            )
            .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
            &["router", "operation"],
        )?;
        let canary_weight = GaugeVec::new(
            Opts::new("flowshift_canary_weight", "Canary traffic weight in percent"),
            &["name", "namespace"],
        )?;

        registry.register(Box::new(router_operations.clone()))?;
        registry.register(Box::new(router_duration.clone()))?;
        registry.register(Box::new(canary_weight.clone()))?;

        Ok(Self {
            registry,
            router_operations,
            router_duration,
            canary_weight,
        })
    }

    /// Records one router call; `result` is `success` or an error label
    pub fn record_router_operation(
        &self,
        router: &str,
        operation: &str,
        result: &str,
        duration_secs: f64,
    ) {
        self.router_operations
            .with_label_values(&[router, operation, result])
            .inc();
        self.router_duration
            .with_label_values(&[router, operation])
            .observe(duration_secs);
    }

    pub fn set_canary_weight(&self, name: &str, namespace: &str, weight: u32) {
        self.canary_weight
            .with_label_values(&[name, namespace])
            .set(f64::from(weight));
    }

    /// Drops the weight series of a deleted canary
    pub fn remove_canary(&self, name: &str, namespace: &str) {
        let _ = self.canary_weight.remove_label_values(&[name, namespace]);
    }

    /// Text exposition format for `/metrics`
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

pub fn create_metrics() -> Result<SharedMetrics, prometheus::Error> {
    Ok(Arc::new(ControllerMetrics::new()?))
}
