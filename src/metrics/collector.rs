// src/metrics/collector.rs
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;
use std::time::Duration;
use anyhow::Result;

pub struct MetricsRegistry {
    registry: Registry,
    collector: Arc<MetricsCollector>,
}

impl MetricsRegistry {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let collector = Arc::new(MetricsCollector::new(&registry)?);

        Ok(Self {
            registry,
            collector,
        })
    }

    pub fn collector(&self) -> Arc<MetricsCollector> {
        self.collector.clone()
    }

    pub fn gather(&self) -> Result<Vec<u8>> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(buffer)
    }
}

pub struct MetricsCollector {
    // Client-facing metrics
    pub requests_total: IntCounterVec,
    pub response_bytes_total: IntCounter,
    pub exchange_duration_seconds: HistogramVec,
    pub active_connections: IntGauge,

    // Backend pool metrics
    pub backend_dials_total: IntCounter,
    pub backend_dial_failures_total: IntCounter,
    pub backend_reused_total: IntCounter,
    pub backend_released_total: IntCounter,
    pub backend_discarded_total: IntCounterVec,
    pub pool_idle: IntGauge,
}

impl MetricsCollector {
    pub fn new(registry: &Registry) -> Result<Self> {
        let requests_total = IntCounterVec::new(
            Opts::new("proxy_requests_total", "Proxied requests by response status"),
            &["method", "status_code"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let response_bytes_total = IntCounter::new(
            "proxy_response_bytes_total",
            "Sum of Content-Length over all proxied responses",
        )?;
        registry.register(Box::new(response_bytes_total.clone()))?;

        let exchange_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "proxy_exchange_duration_seconds",
                "Backend round-trip duration in seconds",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(exchange_duration_seconds.clone()))?;

        let active_connections =
            IntGauge::new("proxy_client_connections_active", "Open client connections")?;
        registry.register(Box::new(active_connections.clone()))?;

        let backend_dials_total =
            IntCounter::new("proxy_backend_dials_total", "New upstream connections dialed")?;
        registry.register(Box::new(backend_dials_total.clone()))?;

        let backend_dial_failures_total = IntCounter::new(
            "proxy_backend_dial_failures_total",
            "Failed attempts to dial the upstream",
        )?;
        registry.register(Box::new(backend_dial_failures_total.clone()))?;

        let backend_reused_total = IntCounter::new(
            "proxy_backend_reused_total",
            "Acquires served from the idle pool",
        )?;
        registry.register(Box::new(backend_reused_total.clone()))?;

        let backend_released_total = IntCounter::new(
            "proxy_backend_released_total",
            "Backends returned to the idle pool",
        )?;
        registry.register(Box::new(backend_released_total.clone()))?;

        let backend_discarded_total = IntCounterVec::new(
            Opts::new(
                "proxy_backend_discarded_total",
                "Backends closed instead of pooled",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(backend_discarded_total.clone()))?;

        let pool_idle = IntGauge::new("proxy_pool_idle", "Idle backends in the pool")?;
        registry.register(Box::new(pool_idle.clone()))?;

        Ok(Self {
            requests_total,
            response_bytes_total,
            exchange_duration_seconds,
            active_connections,
            backend_dials_total,
            backend_dial_failures_total,
            backend_reused_total,
            backend_released_total,
            backend_discarded_total,
            pool_idle,
        })
    }

    pub fn record_request(&self, method: &str, status_code: u16, content_length: u64) {
        let status = status_code.to_string();
        self.requests_total
            .with_label_values(&[method, &status])
            .inc();
        self.response_bytes_total.inc_by(content_length);
    }

    pub fn record_exchange(&self, success: bool, duration: Duration) {
        let outcome = if success { "success" } else { "failure" };
        self.exchange_duration_seconds
            .with_label_values(&[outcome])
            .observe(duration.as_secs_f64());
    }

    pub fn record_dial(&self, success: bool) {
        if success {
            self.backend_dials_total.inc();
        } else {
            self.backend_dial_failures_total.inc();
        }
    }

    pub fn record_discard(&self, reason: &str) {
        self.backend_discarded_total
            .with_label_values(&[reason])
            .inc();
    }

    pub fn increment_active_connections(&self) {
        self.active_connections.inc();
    }

    pub fn decrement_active_connections(&self) {
        self.active_connections.dec();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gather_exposes_recorded_values() {
        let registry = MetricsRegistry::new().unwrap();
        let metrics = registry.collector();
        metrics.record_request("GET", 200, 10);
        metrics.record_dial(true);
        metrics.record_discard("pool_full");

        let text = String::from_utf8(registry.gather().unwrap()).unwrap();
        assert!(text.contains("proxy_requests_total{method=\"GET\",status_code=\"200\"} 1"));
        assert!(text.contains("proxy_response_bytes_total 10"));
        assert!(text.contains("proxy_backend_dials_total 1"));
        assert!(text.contains("proxy_backend_discarded_total{reason=\"pool_full\"} 1"));
    }
}
