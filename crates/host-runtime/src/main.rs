//! # Bithost
//!
//! Loads the module packages under the modules directory, starts their bits
//! and serves them over HTTP until Ctrl+C.
//!
//! ## Startup Sequence
//!
//! 1. Load configuration (defaults, then environment, then flags)
//! 2. Initialize logging
//! 3. Discover and register modules
//! 4. Start bits
//! 5. Bind the HTTP listener (the only fatal failure)
//! 6. Serve until Ctrl+C, then shut down gracefully

use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use host_runtime::{HostConfig, HostRuntime, UnitCatalog};

/// Bithost: host runtime for packaged bits
#[derive(Parser, Debug)]
#[command(name = "bithost")]
#[command(about = "Load module packages and serve their bits over HTTP")]
struct Args {
    /// HTTP port (overrides BITHOST_PORT)
    #[arg(short, long)]
    port: Option<u16>,

    /// Address to bind (overrides BITHOST_BIND)
    #[arg(short, long)]
    bind: Option<IpAddr>,

    /// Directory containing one subdirectory per module (overrides BITHOST_MODULES_DIR)
    #[arg(short, long)]
    modules_dir: Option<PathBuf>,

    /// Module id to skip; repeatable
    #[arg(long = "disable", value_name = "MODULE")]
    disabled: Vec<String>,

    /// Log filter, e.g. "info" or "host_runtime=debug"
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON log lines
    #[arg(long)]
    json_logs: bool,
}

impl Args {
    fn apply(self, config: &mut HostConfig) {
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(bind) = self.bind {
            config.server.bind_addr = bind;
        }
        if let Some(dir) = self.modules_dir {
            config.modules.root_dir = dir;
        }
        config
            .modules
            .disabled
            .extend(self.disabled.iter().map(|id| id.to_lowercase()));
        if let Some(level) = self.log_level {
            config.telemetry.log_level = level;
        }
        if self.json_logs {
            config.telemetry.json_logs = true;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = HostConfig::from_env().context("Invalid environment configuration")?;
    args.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    // Initialize logging
    bit_telemetry::init_logging(&config.telemetry).context("Failed to initialize logging")?;

    info!("===========================================");
    info!("  Bithost v{}", env!("CARGO_PKG_VERSION"));
    info!("===========================================");

    // Discover modules and start bits
    let catalog: UnitCatalog = bit_samples::units().into_iter().collect();
    let mut runtime = HostRuntime::new(config, catalog);
    let container = runtime.load()?;
    runtime.start().await?;

    info!(
        bits = container.registry.len(),
        failed_modules = container.load_failures().len(),
        "Modules ready"
    );

    // Bind is the one fatal startup failure
    let listener = runtime.bind().await?;

    info!("Bithost is running. Press Ctrl+C to stop.");
    let serve = runtime.serve(listener);
    tokio::pin!(serve);

    tokio::select! {
        result = &mut serve => {
            result?;
            return Ok(());
        }
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!(error = %e, "Failed to listen for Ctrl+C, shutting down");
            }
        }
    }

    // Graceful shutdown
    runtime.shutdown().await?;
    serve.await?;

    Ok(())
}
