//! # Host Container
//!
//! Holds every host-wide instance and wires them together.
//!
//! ## Assembly Order
//!
//! ```text
//! Phase 1: Shared infrastructure (fault log, bus, scheduler, metrics)
//! Phase 2: Module discovery (each package in its own load context)
//! Phase 3: Registration (routes, entrypoints), then freeze
//! Phase 4: Entrypoint services
//! ```
//!
//! After assembly the container is shared behind an `Arc` and only its
//! degraded-bit table changes.

use crate::container::config::HostConfig;
use crate::loader::{LoadFailure, ModuleLoader, UnitCatalog};
use crate::registry::{
    ModuleRegistry, ModuleSummary, RegisteredBit, RegistryBuilder, RejectedRoute, RouteCollision,
};
use crate::scheduler::{TaskInfo, TaskScheduler};
use bit_bus::{BusDiagnostics, FaultLog, HandlerFault, MessageBus};
use bit_contracts::{BitInfo, ServiceCollection};
use bit_state::StateDiagnostics;
use bit_telemetry::{HostMetrics, MetricsSample, TelemetryError};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

/// One bit as shown by `/diagnostics`.
#[derive(Debug, Clone, Serialize)]
pub struct BitDiagnostics {
    pub module: String,
    #[serde(flatten)]
    pub info: BitInfo,
    /// Why `start()` failed, if it did.
    pub degraded: Option<String>,
    pub state: Option<StateDiagnostics>,
}

/// A service contributed by an entrypoint.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceInfo {
    pub type_name: String,
    pub provider: String,
}

/// Everything `/diagnostics` reports.
#[derive(Debug, Clone, Serialize)]
pub struct HostDiagnostics {
    pub started_at: DateTime<Utc>,
    pub uptime_secs: i64,
    pub shutting_down: bool,
    pub modules: Vec<ModuleSummary>,
    pub bits: Vec<BitDiagnostics>,
    pub load_failures: Vec<LoadFailure>,
    pub disabled_modules: Vec<String>,
    pub route_collisions: Vec<RouteCollision>,
    pub rejected_routes: Vec<RejectedRoute>,
    pub entrypoint_failures: Vec<String>,
    pub services: Vec<ServiceInfo>,
    pub tasks: Vec<TaskInfo>,
    pub bus: BusDiagnostics,
    pub recent_faults: Vec<HandlerFault>,
    pub metrics: MetricsSample,
}

/// Central container holding the host's shared instances.
pub struct HostContainer {
    /// Host configuration (immutable after assembly).
    pub config: HostConfig,
    /// Bus shared by every module.
    pub bus: MessageBus,
    /// Handler faults reported by the bus.
    pub faults: Arc<FaultLog>,
    pub scheduler: TaskScheduler,
    pub registry: ModuleRegistry,
    /// Services registered by module entrypoints.
    pub services: ServiceCollection,
    pub metrics: HostMetrics,
    /// Cancelled once shutdown begins. Long-lived responses hold child tokens.
    pub shutdown: CancellationToken,
    pub started_at: DateTime<Utc>,
    load_failures: Vec<LoadFailure>,
    disabled_modules: Vec<String>,
    entrypoint_failures: RwLock<Vec<String>>,
    degraded: RwLock<BTreeMap<String, String>>,
}

impl HostContainer {
    /// Assemble the host: create shared infrastructure, load every module
    /// under the configured root and freeze the registry.
    #[instrument(name = "host_assembly", skip_all)]
    pub fn assemble(config: HostConfig, catalog: &UnitCatalog) -> Result<Self, TelemetryError> {
        info!(
            modules_dir = %config.modules.root_dir.display(),
            linked_units = catalog.len(),
            "Assembling host"
        );

        // Phase 1: shared infrastructure
        let faults = Arc::new(FaultLog::new());
        let bus = MessageBus::with_reporter(faults.clone());
        let scheduler = TaskScheduler::new();
        let metrics = HostMetrics::new()?;

        // Phase 2: discovery
        let outcome = ModuleLoader::new(
            catalog,
            &config.modules,
            bus.clone(),
            scheduler.clone(),
        )
        .discover(&config.modules.root_dir);

        // Phase 3: registration. A module whose bits all lost their routes
        // keeps no periodic tasks.
        let mut builder = RegistryBuilder::new();
        for descriptor in outcome.modules {
            let module = descriptor.id.clone();
            let offered = descriptor.components.len();
            let tasks = descriptor.tasks.clone();
            let errors = builder.register(descriptor);
            if !errors.is_empty() {
                warn!(module = %module, skipped = errors.len(), "Some bits were not registered");
            }
            if offered > 0 && errors.len() == offered {
                let withdrawn = tasks.cancel_all();
                if withdrawn > 0 {
                    warn!(module = %module, tasks = withdrawn, "No bit registered, periodic tasks withdrawn");
                }
            }
        }
        let registry = builder.freeze();

        // Phase 4: entrypoint services
        let mut services = ServiceCollection::new();
        let mut entrypoint_failures = Vec::new();
        for (module, entrypoint) in registry.entrypoints() {
            let result = catch_unwind(AssertUnwindSafe(|| entrypoint.register_services(&mut services)));
            if let Err(panic) = result {
                let message = format!(
                    "{module}/{}: register_services panicked: {}",
                    entrypoint.name(),
                    crate::loader::panic_message(&*panic)
                );
                error!(module = %module, entrypoint = %entrypoint.name(), "Entrypoint failed to register services");
                entrypoint_failures.push(message);
            }
        }

        info!(
            bits = registry.len(),
            failed_modules = outcome.failures.len(),
            services = services.len(),
            "Host assembled"
        );

        Ok(Self {
            config,
            bus,
            faults,
            scheduler,
            registry,
            services,
            metrics,
            shutdown: CancellationToken::new(),
            started_at: Utc::now(),
            load_failures: outcome.failures,
            disabled_modules: outcome.disabled,
            entrypoint_failures: RwLock::new(entrypoint_failures),
            degraded: RwLock::new(BTreeMap::new()),
        })
    }

    pub fn load_failures(&self) -> &[LoadFailure] {
        &self.load_failures
    }

    pub fn disabled_modules(&self) -> &[String] {
        &self.disabled_modules
    }

    /// Flag a bit whose `start()` failed. It stays routable.
    pub fn mark_degraded(&self, route: &str, reason: impl Into<String>) {
        self.degraded
            .write()
            .insert(route.to_lowercase(), reason.into());
    }

    pub fn degraded_reason(&self, route: &str) -> Option<String> {
        self.degraded.read().get(&route.to_lowercase()).cloned()
    }

    pub fn record_entrypoint_failure(&self, message: String) {
        self.entrypoint_failures.write().push(message);
    }

    /// Bits that own a state store.
    pub fn stateful_bits(&self) -> impl Iterator<Item = &RegisteredBit> {
        self.registry
            .get_all()
            .iter()
            .filter(|entry| entry.bit.state().is_some())
    }

    /// Sample every metric from its source.
    pub fn metrics_sample(&self) -> MetricsSample {
        let bus = self.bus.diagnostics();
        let (state_stores, state_watchers) = self
            .registry
            .get_all()
            .iter()
            .filter_map(|entry| entry.bit.state())
            .fold((0u64, 0u64), |(stores, watchers), source| {
                (stores + 1, watchers + source.watcher_count() as u64)
            });

        MetricsSample {
            bits_loaded: self.registry.len() as u64,
            modules_failed: self.load_failures.len() as u64,
            runners_active: self.scheduler.active_count() as u64,
            bus_subscriptions: bus.subscriptions as u64,
            bus_inflight_deliveries: bus.in_flight_deliveries as u64,
            bus_messages_published_total: bus.messages_published,
            bus_handler_failures_total: bus.handler_failures,
            state_stores,
            state_watchers,
        }
    }

    /// Sample metrics into the Prometheus registry and encode them.
    pub fn prometheus_text(&self) -> Result<String, TelemetryError> {
        self.metrics.record(&self.metrics_sample());
        self.metrics.encode_text()
    }

    pub fn diagnostics(&self) -> HostDiagnostics {
        let degraded = self.degraded.read().clone();
        let bits = self
            .registry
            .get_all()
            .iter()
            .map(|entry| BitDiagnostics {
                module: entry.module_id.clone(),
                info: entry.info(),
                degraded: degraded.get(&entry.route.to_lowercase()).cloned(),
                state: entry.bit.state().map(|source| source.diagnostics()),
            })
            .collect();

        let now = Utc::now();
        HostDiagnostics {
            started_at: self.started_at,
            uptime_secs: (now - self.started_at).num_seconds(),
            shutting_down: self.shutdown.is_cancelled(),
            modules: self.registry.modules().to_vec(),
            bits,
            load_failures: self.load_failures.clone(),
            disabled_modules: self.disabled_modules.clone(),
            route_collisions: self.registry.collisions().to_vec(),
            rejected_routes: self.registry.rejected().to_vec(),
            entrypoint_failures: self.entrypoint_failures.read().clone(),
            services: self
                .services
                .describe()
                .into_iter()
                .map(|(type_name, provider)| ServiceInfo {
                    type_name,
                    provider,
                })
                .collect(),
            tasks: self.scheduler.tasks(),
            bus: self.bus.diagnostics(),
            recent_faults: self.faults.recent(),
            metrics: self.metrics_sample(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bit_contracts::{async_trait, Bit, BitError, BitRequest, BitResponse, LinkedUnit};
    use bit_state::{StateSource, StateStore};
    use std::any::Any;
    use std::fs;
    use tempfile::TempDir;

    struct Counter {
        state: StateStore<u32>,
    }

    #[async_trait]
    impl Bit for Counter {
        fn route(&self) -> &str {
            "/counter"
        }

        fn name(&self) -> &str {
            "counter"
        }

        async fn handle(&self, _request: BitRequest) -> Result<BitResponse, BitError> {
            BitResponse::json(&self.state.get_snapshot())
        }

        fn state(&self) -> Option<Arc<dyn StateSource>> {
            Some(Arc::new(self.state.clone()))
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn catalog() -> UnitCatalog {
        UnitCatalog::new().with(LinkedUnit::new("counter", "1.0.0").component(|_| {
            Ok(Arc::new(Counter {
                state: StateStore::new("counter", 0),
            }))
        }))
    }

    fn config(root: &TempDir) -> HostConfig {
        let mut config = HostConfig::default();
        config.modules.root_dir = root.path().to_path_buf();
        config
    }

    #[tokio::test]
    async fn test_assemble_and_sample_metrics() {
        let root = TempDir::new().unwrap();
        let pkg = root.path().join("counter");
        fs::create_dir(&pkg).unwrap();
        fs::write(pkg.join("counter.unit"), r#"{ "unit": "counter", "version": "1.0.0" }"#).unwrap();
        let broken = root.path().join("broken");
        fs::create_dir(&broken).unwrap();
        fs::write(broken.join("broken.unit"), r#"{ "unit": "missing", "version": "1.0.0" }"#).unwrap();

        let host = HostContainer::assemble(config(&root), &catalog()).unwrap();
        let sample = host.metrics_sample();
        assert_eq!(sample.bits_loaded, 1);
        assert_eq!(sample.modules_failed, 1);
        assert_eq!(sample.state_stores, 1);
        assert_eq!(host.stateful_bits().count(), 1);

        let text = host.prometheus_text().unwrap();
        assert!(text.contains("bithost_bits_loaded 1"));
        assert!(text.contains("bithost_modules_failed 1"));
    }

    #[tokio::test]
    async fn test_diagnostics_reports_degraded_bits() {
        let root = TempDir::new().unwrap();
        let pkg = root.path().join("counter");
        fs::create_dir(&pkg).unwrap();
        fs::write(pkg.join("counter.unit"), r#"{ "unit": "counter", "version": "1.0.0" }"#).unwrap();

        let host = HostContainer::assemble(config(&root), &catalog()).unwrap();
        host.mark_degraded("/Counter", "database offline");

        let diagnostics = host.diagnostics();
        assert_eq!(diagnostics.bits.len(), 1);
        assert_eq!(diagnostics.bits[0].degraded.as_deref(), Some("database offline"));
        assert_eq!(diagnostics.bits[0].state.as_ref().map(|s| s.version), Some(0));
        assert!(!diagnostics.shutting_down);

        let json = serde_json::to_value(&diagnostics).unwrap();
        assert_eq!(json["bits"][0]["route"], "/counter");
    }
}
