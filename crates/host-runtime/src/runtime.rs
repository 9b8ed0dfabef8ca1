//! # Host Runtime
//!
//! Lifecycle driver around the [`HostContainer`].
//!
//! ## Sequence
//!
//! 1. `new` - keep configuration and the linked unit catalog
//! 2. `load` - discover modules, register bits, freeze the registry
//! 3. `start` - call every bit's `start()`; failures mark the bit degraded
//! 4. `bind` / `serve` - run the HTTP router until shutdown
//! 5. `shutdown` - stop the scheduler, call `stop()`, close state stores

use crate::container::{HostConfig, HostContainer};
use crate::http;
use crate::loader::{panic_message, UnitCatalog};
use axum::Router;
use futures::FutureExt;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

/// Runtime lifecycle errors.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Failed to initialize telemetry: {0}")]
    Telemetry(#[from] bit_telemetry::TelemetryError),

    #[error("Modules are already loaded")]
    AlreadyLoaded,

    #[error("Modules have not been loaded yet")]
    NotLoaded,

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("HTTP server failed: {0}")]
    Serve(#[source] std::io::Error),
}

/// Result of [`HostRuntime::start`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartReport {
    pub started: usize,
    /// Routes of bits whose `start()` failed.
    pub degraded: Vec<String>,
}

/// The host process.
pub struct HostRuntime {
    config: HostConfig,
    catalog: UnitCatalog,
    container: Option<Arc<HostContainer>>,
    stopped: AtomicBool,
}

impl HostRuntime {
    pub fn new(config: HostConfig, catalog: UnitCatalog) -> Self {
        Self {
            config,
            catalog,
            container: None,
            stopped: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Discover and register every module. Runs once.
    pub fn load(&mut self) -> Result<Arc<HostContainer>, RuntimeError> {
        if self.container.is_some() {
            return Err(RuntimeError::AlreadyLoaded);
        }
        let container = Arc::new(HostContainer::assemble(self.config.clone(), &self.catalog)?);
        self.container = Some(Arc::clone(&container));
        Ok(container)
    }

    pub fn container(&self) -> Result<&Arc<HostContainer>, RuntimeError> {
        self.container.as_ref().ok_or(RuntimeError::NotLoaded)
    }

    /// Call `start()` on every bit in registration order. A bit that fails
    /// or panics stays routable and is reported as degraded.
    pub async fn start(&self) -> Result<StartReport, RuntimeError> {
        let container = self.container()?;
        let mut report = StartReport::default();

        for entry in container.registry.get_all() {
            let outcome = AssertUnwindSafe(entry.bit.start()).catch_unwind().await;
            let failure = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(panic) => Some(format!("panicked: {}", panic_message(&*panic))),
            };

            match failure {
                None => report.started += 1,
                Some(reason) => {
                    error!(module = %entry.module_id, route = %entry.route, error = %reason, "Bit failed to start, marking degraded");
                    container.mark_degraded(&entry.route, reason);
                    report.degraded.push(entry.route.clone());
                }
            }
        }

        info!(
            started = report.started,
            degraded = report.degraded.len(),
            "Bits started"
        );
        Ok(report)
    }

    /// The complete HTTP router.
    pub fn router(&self) -> Result<Router, RuntimeError> {
        Ok(http::build_router(Arc::clone(self.container()?)))
    }

    /// Bind the configured address. This is the one fatal startup error.
    pub async fn bind(&self) -> Result<TcpListener, RuntimeError> {
        let addr = self.config.socket_addr();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| RuntimeError::Bind { addr, source })?;
        let local = listener.local_addr().unwrap_or(addr);
        info!(addr = %local, "HTTP server listening");
        Ok(listener)
    }

    /// Serve until [`shutdown`](Self::shutdown) is called. Open state
    /// streams end when shutdown begins, so in-flight connections drain.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), RuntimeError> {
        let router = self.router()?;
        let shutdown = self.container()?.shutdown.clone();

        axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(RuntimeError::Serve)?;

        info!("HTTP server stopped");
        Ok(())
    }

    /// Stop everything. Safe to call more than once; later calls do nothing.
    pub async fn shutdown(&self) -> Result<(), RuntimeError> {
        let container = self.container()?;
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Initiating graceful shutdown...");

        container.shutdown.cancel();
        container.scheduler.shutdown().await;

        for entry in container.registry.get_all() {
            match AssertUnwindSafe(entry.bit.stop()).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(route = %entry.route, error = %e, "Bit failed to stop cleanly");
                }
                Err(panic) => {
                    warn!(route = %entry.route, error = %panic_message(&*panic), "Bit panicked while stopping");
                }
            }
        }

        for entry in container.stateful_bits() {
            if let Some(source) = entry.bit.state() {
                source.close();
            }
        }

        info!("Shutdown complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bit_contracts::{async_trait, Bit, BitError, BitRequest, BitResponse, LinkedUnit};
    use std::any::Any;
    use std::fs;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    static STOPS: AtomicUsize = AtomicUsize::new(0);

    struct Flaky {
        route: &'static str,
        fail: bool,
    }

    #[async_trait]
    impl Bit for Flaky {
        fn route(&self) -> &str {
            self.route
        }

        fn name(&self) -> &str {
            "flaky"
        }

        async fn handle(&self, _request: BitRequest) -> Result<BitResponse, BitError> {
            Ok(BitResponse::text("ok"))
        }

        async fn start(&self) -> Result<(), BitError> {
            if self.fail {
                Err(BitError::Internal("backend unavailable".into()))
            } else {
                Ok(())
            }
        }

        async fn stop(&self) -> Result<(), BitError> {
            STOPS.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn runtime(root: &TempDir) -> HostRuntime {
        for dir in ["steady", "flaky"] {
            let pkg = root.path().join(dir);
            fs::create_dir(&pkg).unwrap();
            fs::write(
                pkg.join(format!("{dir}.unit")),
                format!(r#"{{ "unit": "{dir}", "version": "1.0.0" }}"#),
            )
            .unwrap();
        }

        let catalog = UnitCatalog::new()
            .with(LinkedUnit::new("steady", "1.0.0").component(|_| {
                Ok(Arc::new(Flaky {
                    route: "/steady",
                    fail: false,
                }))
            }))
            .with(LinkedUnit::new("flaky", "1.0.0").component(|_| {
                Ok(Arc::new(Flaky {
                    route: "/flaky",
                    fail: true,
                }))
            }));

        let mut config = HostConfig::default();
        config.modules.root_dir = root.path().to_path_buf();
        HostRuntime::new(config, catalog)
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let root = TempDir::new().unwrap();
        let mut runtime = runtime(&root);

        assert!(matches!(runtime.start().await, Err(RuntimeError::NotLoaded)));
        let container = runtime.load().unwrap();
        assert!(matches!(runtime.load(), Err(RuntimeError::AlreadyLoaded)));

        let report = runtime.start().await.unwrap();
        assert_eq!(report.started, 1);
        assert_eq!(report.degraded, vec!["/flaky".to_string()]);
        assert_eq!(
            container.degraded_reason("/flaky").as_deref(),
            Some("Internal error: backend unavailable")
        );

        runtime.shutdown().await.unwrap();
        runtime.shutdown().await.unwrap();
        assert_eq!(STOPS.load(Ordering::SeqCst), 2);
        assert!(container.shutdown.is_cancelled());
        assert!(container.scheduler.is_shut_down());
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let root = TempDir::new().unwrap();
        let mut runtime = runtime(&root);
        runtime.load().unwrap();

        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();
        runtime.config.server.bind_addr = addr.ip();
        runtime.config.server.port = addr.port();

        assert!(matches!(runtime.bind().await, Err(RuntimeError::Bind { .. })));
    }
}
