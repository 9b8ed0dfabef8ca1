//! # Bit Telemetry
//!
//! Logging and metrics for the bit host.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use bit_telemetry::{init_logging, HostMetrics, TelemetryConfig};
//!
//! let config = TelemetryConfig::from_env();
//! init_logging(&config)?;
//!
//! let metrics = HostMetrics::new()?;
//! metrics.record(&sample);
//! let body = metrics.encode_text()?;
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `BITHOST_SERVICE_NAME` | `bithost` | Service name in logs |
//! | `BITHOST_LOG_LEVEL` / `RUST_LOG` | `info` | Log filter |
//! | `BITHOST_CONSOLE_OUTPUT` | `true` | Write logs at all |
//! | `BITHOST_JSON_LOGS` | `false` | JSON log lines |

#![cfg_attr(test, allow(clippy::unwrap_used))]

mod config;
mod logging;
mod metrics;

pub use config::TelemetryConfig;
pub use logging::{build_filter, init_logging};
pub use metrics::{HostMetrics, MetricsSample, PROMETHEUS_CONTENT_TYPE};

use thiserror::Error;

/// Telemetry initialization errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Failed to initialize logging: {0}")]
    LoggingInit(String),

    #[error("Failed to initialize Prometheus metrics: {0}")]
    MetricsInit(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Convenience macro for creating a span tagged with the owning module.
///
/// # Example
///
/// ```rust,ignore
/// let _span = bit_telemetry::module_span!("load", module = "alpha").entered();
/// ```
#[macro_export]
macro_rules! module_span {
    ($name:expr, $($field:tt)*) => {
        tracing::info_span!($name, $($field)*)
    };
}
