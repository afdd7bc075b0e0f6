use std::sync::Arc;

use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

use crate::lifecycle::Operation;

/// Counters reported by the store and its cache.
pub trait MetricsCollector: Send + Sync {
    fn bytes_written(&self, amount: u64);
    fn bytes_read(&self, amount: u64);
    fn cache_hit(&self);
    fn cache_miss(&self);
    fn operation_failed(&self, operation: Operation);
}

/// Discards everything. Used when no collector is configured.
#[derive(Debug, Clone, Default)]
pub struct NoOpMetrics;

impl MetricsCollector for NoOpMetrics {
    fn bytes_written(&self, _amount: u64) {}
    fn bytes_read(&self, _amount: u64) {}
    fn cache_hit(&self) {}
    fn cache_miss(&self) {}
    fn operation_failed(&self, _operation: Operation) {}
}

/// Prometheus backed collector with its own registry.
#[derive(Clone)]
pub struct PrometheusMetrics {
    registry: Registry,
    bytes_written: IntCounter,
    bytes_read: IntCounter,
    cache_hits: IntCounter,
    cache_misses: IntCounter,
    failures: IntCounterVec,
}

impl PrometheusMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let bytes_written = IntCounter::new(
            "filedock_bytes_written_total",
            "Bytes written into primary storage",
        )?;
        let bytes_read = IntCounter::new(
            "filedock_bytes_read_total",
            "Bytes delivered to read destinations",
        )?;
        let cache_hits = IntCounter::new("filedock_cache_hits_total", "Reads served by the cache")?;
        let cache_misses = IntCounter::new(
            "filedock_cache_misses_total",
            "Cache lookups that fell through to primary storage",
        )?;
        let failures = IntCounterVec::new(
            Opts::new("filedock_operation_failures_total", "Failed operations"),
            &["operation"],
        )?;

        registry.register(Box::new(bytes_written.clone()))?;
        registry.register(Box::new(bytes_read.clone()))?;
        registry.register(Box::new(cache_hits.clone()))?;
        registry.register(Box::new(cache_misses.clone()))?;
        registry.register(Box::new(failures.clone()))?;

        Ok(Self {
            registry,
            bytes_written,
            bytes_read,
            cache_hits,
            cache_misses,
            failures,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Renders the registry in the prometheus text format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

impl MetricsCollector for PrometheusMetrics {
    fn bytes_written(&self, amount: u64) {
        self.bytes_written.inc_by(amount);
    }

    fn bytes_read(&self, amount: u64) {
        self.bytes_read.inc_by(amount);
    }

    fn cache_hit(&self) {
        self.cache_hits.inc();
    }

    fn cache_miss(&self) {
        self.cache_misses.inc();
    }

    fn operation_failed(&self, operation: Operation) {
        self.failures
            .with_label_values(&[&operation.to_string()])
            .inc();
    }
}

/// Cheaply cloneable handle to a collector.
#[derive(Clone)]
pub struct SharedMetrics(Arc<dyn MetricsCollector>);

impl SharedMetrics {
    pub fn new(collector: Arc<dyn MetricsCollector>) -> Self {
        Self(collector)
    }

    pub fn bytes_written(&self, amount: u64) {
        self.0.bytes_written(amount);
    }

    pub fn bytes_read(&self, amount: u64) {
        self.0.bytes_read(amount);
    }

    pub fn cache_hit(&self) {
        self.0.cache_hit();
    }

    pub fn cache_miss(&self) {
        self.0.cache_miss();
    }

    pub fn operation_failed(&self, operation: Operation) {
        self.0.operation_failed(operation);
    }
}

impl Default for SharedMetrics {
    fn default() -> Self {
        Self(Arc::new(NoOpMetrics))
    }
}

impl std::fmt::Debug for SharedMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedMetrics")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prometheus_counts() {
        let metrics = PrometheusMetrics::new().unwrap();
        let shared = SharedMetrics::new(Arc::new(metrics.clone()));
        shared.bytes_written(5);
        shared.cache_hit();
        shared.cache_hit();
        shared.operation_failed(Operation::Read);

        assert_eq!(metrics.bytes_written.get(), 5);
        assert_eq!(metrics.cache_hits.get(), 2);
        let text = metrics.encode().unwrap();
        assert!(text.contains("filedock_operation_failures_total{operation=\"read\"} 1"));
    }
}
