//! Prometheus metrics

use prometheus::{IntCounter, IntGauge, Opts, Registry};
use std::sync::LazyLock;

/// Global metrics registry
static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Global metrics instance
pub static METRICS: LazyLock<Metrics> = LazyLock::new(Metrics::new);

/// Metrics struct
pub struct Metrics {
    // Counters
    pub frames_sent: IntCounter,
    pub frames_received: IntCounter,
    pub decode_errors: IntCounter,
    pub auth_successes: IntCounter,
    pub auth_failures: IntCounter,
    pub quota_rejections: IntCounter,
    pub devices_added: IntCounter,

    // Gauges
    pub active_connections: IntGauge,
    pub open_channels: IntGauge,
}

fn counter(name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::with_opts(Opts::new(name, help))
        .unwrap_or_else(|e| panic!("invalid metric {}: {}", name, e));
    REGISTRY.register(Box::new(counter.clone())).ok();
    counter
}

fn gauge(name: &str, help: &str) -> IntGauge {
    let gauge = IntGauge::with_opts(Opts::new(name, help))
        .unwrap_or_else(|e| panic!("invalid metric {}: {}", name, e));
    REGISTRY.register(Box::new(gauge.clone())).ok();
    gauge
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            frames_sent: counter("mps_frames_sent_total", "Total number of frames sent"),
            frames_received: counter(
                "mps_frames_received_total",
                "Total number of frames received",
            ),
            decode_errors: counter(
                "mps_decode_errors_total",
                "Connections terminated by a malformed frame",
            ),
            auth_successes: counter(
                "mps_auth_successes_total",
                "Total successful authentications",
            ),
            auth_failures: counter("mps_auth_failures_total", "Total failed authentications"),
            quota_rejections: counter(
                "mps_quota_rejections_total",
                "Devices rejected by the per-domain device quota",
            ),
            devices_added: counter("mps_devices_added_total", "Devices auto-provisioned"),
            active_connections: gauge("mps_active_connections", "Number of active connections"),
            open_channels: gauge("mps_open_channels", "Number of live virtual channels"),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Render all registered metrics in the Prometheus text format
pub fn gather_text() -> Vec<u8> {
    use prometheus::Encoder;

    // Make sure the engine metrics exist before the first scrape
    LazyLock::force(&METRICS);

    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
    }
    buffer
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_contains_engine_metrics() {
        METRICS.frames_received.inc();
        let text = String::from_utf8(gather_text()).unwrap();
        assert!(text.contains("mps_frames_received_total"));
        assert!(text.contains("mps_open_channels"));
    }
}
