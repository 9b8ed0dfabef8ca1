//! Prometheus metrics for the host.
//!
//! All metrics follow the naming convention `bithost_<area>_<metric>`. The
//! names are a compatibility surface for dashboards; do not rename them.
//!
//! Values are sampled from the bus, registry and state stores when the
//! exposition endpoint is scraped. Levels are gauges. The two `_total`
//! metrics are counters advanced to the sampled running total, so they never
//! go backwards.

use crate::TelemetryError;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use serde::Serialize;

/// One sample of every host metric. Also served as JSON by `/metrics`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSample {
    pub bits_loaded: u64,
    pub modules_failed: u64,
    pub runners_active: u64,
    pub bus_subscriptions: u64,
    pub bus_inflight_deliveries: u64,
    pub bus_messages_published_total: u64,
    pub bus_handler_failures_total: u64,
    pub state_stores: u64,
    pub state_watchers: u64,
}

/// The host's Prometheus registry and its metrics.
pub struct HostMetrics {
    registry: Registry,
    bits_loaded: IntGauge,
    modules_failed: IntGauge,
    runners_active: IntGauge,
    bus_subscriptions: IntGauge,
    bus_inflight_deliveries: IntGauge,
    bus_messages_published_total: IntCounter,
    bus_handler_failures_total: IntCounter,
    state_stores: IntGauge,
    state_watchers: IntGauge,
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Result<IntGauge, TelemetryError> {
    let gauge =
        IntGauge::new(name, help).map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
    registry
        .register(Box::new(gauge.clone()))
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
    Ok(gauge)
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter, TelemetryError> {
    let counter =
        IntCounter::new(name, help).map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
    registry
        .register(Box::new(counter.clone()))
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
    Ok(counter)
}

impl HostMetrics {
    /// Create a private registry with every host metric registered.
    pub fn new() -> Result<Self, TelemetryError> {
        let registry = Registry::new();

        Ok(Self {
            bits_loaded: gauge(&registry, "bithost_bits_loaded", "Bits registered with the host")?,
            modules_failed: gauge(
                &registry,
                "bithost_modules_failed",
                "Modules skipped because they failed to load",
            )?,
            runners_active: gauge(
                &registry,
                "bithost_runners_active",
                "Periodic tasks currently scheduled",
            )?,
            bus_subscriptions: gauge(
                &registry,
                "bithost_bus_subscriptions",
                "Active message bus subscriptions",
            )?,
            bus_inflight_deliveries: gauge(
                &registry,
                "bithost_bus_inflight_deliveries",
                "Handler invocations currently running",
            )?,
            bus_messages_published_total: counter(
                &registry,
                "bithost_bus_messages_published_total",
                "Messages published since startup",
            )?,
            bus_handler_failures_total: counter(
                &registry,
                "bithost_bus_handler_failures_total",
                "Handler errors and panics since startup",
            )?,
            state_stores: gauge(&registry, "bithost_state_stores", "Bits exposing a state store")?,
            state_watchers: gauge(
                &registry,
                "bithost_state_watchers",
                "Active state watchers across all stores",
            )?,
            registry,
        })
    }

    /// Bring every metric up to `sample`.
    pub fn record(&self, sample: &MetricsSample) {
        set(&self.bits_loaded, sample.bits_loaded);
        set(&self.modules_failed, sample.modules_failed);
        set(&self.runners_active, sample.runners_active);
        set(&self.bus_subscriptions, sample.bus_subscriptions);
        set(&self.bus_inflight_deliveries, sample.bus_inflight_deliveries);
        advance(
            &self.bus_messages_published_total,
            sample.bus_messages_published_total,
        );
        advance(
            &self.bus_handler_failures_total,
            sample.bus_handler_failures_total,
        );
        set(&self.state_stores, sample.state_stores);
        set(&self.state_watchers, sample.state_watchers);
    }

    /// Render the registry in the Prometheus text exposition format.
    pub fn encode_text(&self) -> Result<String, TelemetryError> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| TelemetryError::MetricsInit(e.to_string()))
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

fn set(gauge: &IntGauge, value: u64) {
    gauge.set(i64::try_from(value).unwrap_or(i64::MAX));
}

/// Move a counter forward to `total`. A lower total is ignored.
fn advance(counter: &IntCounter, total: u64) {
    counter.inc_by(total.saturating_sub(counter.get()));
}

/// Content type of [`HostMetrics::encode_text`] output.
pub const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";
