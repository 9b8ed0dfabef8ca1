//! # Host Configuration
//!
//! Unified configuration for the HTTP server, module discovery and telemetry.
//!
//! Defaults are overridden by environment variables, which are in turn
//! overridden by command-line flags in the binary.

use bit_telemetry::TelemetryConfig;
use std::collections::BTreeSet;
use std::env;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use thiserror::Error;

/// Names every module resolves to the host's own copy instead of its own.
pub const DEFAULT_SHARED_UNITS: &[&str] = &[
    "bit-contracts",
    "bit-bus",
    "bit-state",
    "serde",
    "serde_json",
    "tokio",
    "tracing",
];

/// Complete host configuration.
#[derive(Debug, Clone, Default)]
pub struct HostConfig {
    /// HTTP server configuration.
    pub server: ServerConfig,
    /// Module discovery configuration.
    pub modules: ModulesConfig,
    /// Logging configuration.
    pub telemetry: TelemetryConfig,
}

/// HTTP server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind.
    pub bind_addr: IpAddr,
    /// Port to bind. 0 picks a free port.
    pub port: u16,
    /// Largest request body handed to a bit.
    pub max_body_bytes: usize,
    /// Allow cross-origin requests from any origin.
    pub cors_permissive: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 5080,
            max_body_bytes: 1024 * 1024,
            cors_permissive: false,
        }
    }
}

/// Module discovery configuration.
#[derive(Debug, Clone)]
pub struct ModulesConfig {
    /// Directory whose immediate subdirectories are module packages.
    pub root_dir: PathBuf,
    /// Unit names resolved to the host-wide instance.
    pub shared_allow_list: BTreeSet<String>,
    /// Module ids to skip, lowercase.
    pub disabled: BTreeSet<String>,
}

impl Default for ModulesConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("./modules"),
            shared_allow_list: DEFAULT_SHARED_UNITS.iter().map(|s| s.to_string()).collect(),
            disabled: BTreeSet::new(),
        }
    }
}

impl ModulesConfig {
    /// Whether `module_id` was disabled by configuration.
    pub fn is_disabled(&self, module_id: &str) -> bool {
        self.disabled.contains(&module_id.to_lowercase())
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// An environment variable held an unusable value.
    #[error("Invalid value for {var}: {value:?}")]
    InvalidEnv { var: String, value: String },

    /// The module root directory is empty.
    #[error("Module directory must not be empty")]
    EmptyModulesDir,

    /// A shared unit name is empty or contains path characters.
    #[error("Invalid shared unit name: {0:?}")]
    InvalidSharedName(String),

    /// The request body limit is zero.
    #[error("max_body_bytes must be greater than zero")]
    ZeroBodyLimit,
}

impl HostConfig {
    /// Load configuration from the environment.
    ///
    /// # Environment Variables
    ///
    /// - `BITHOST_PORT`: HTTP port (default: 5080)
    /// - `BITHOST_BIND`: Bind address (default: 127.0.0.1)
    /// - `BITHOST_CORS`: Allow any origin (default: false)
    /// - `BITHOST_MODULES_DIR`: Module root directory (default: ./modules)
    /// - `BITHOST_DISABLED_MODULES`: Comma-separated module ids to skip
    /// - `BITHOST_SHARED_UNITS`: Comma-separated extra shared unit names
    /// - plus the telemetry variables of [`TelemetryConfig::from_env`]
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an explicit variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self {
            telemetry: TelemetryConfig::from_lookup(&lookup),
            ..Self::default()
        };

        // Override server address from environment
        if let Some(port) = lookup("BITHOST_PORT") {
            config.server.port = parse_env("BITHOST_PORT", &port)?;
        }
        if let Some(bind) = lookup("BITHOST_BIND") {
            config.server.bind_addr = parse_env("BITHOST_BIND", &bind)?;
        }
        if let Some(cors) = lookup("BITHOST_CORS") {
            config.server.cors_permissive = parse_env("BITHOST_CORS", &cors)?;
        }

        // Override module discovery from environment
        if let Some(dir) = lookup("BITHOST_MODULES_DIR") {
            config.modules.root_dir = PathBuf::from(dir);
        }
        if let Some(disabled) = lookup("BITHOST_DISABLED_MODULES") {
            config.modules.disabled = split_list(&disabled)
                .map(|id| id.to_lowercase())
                .collect();
        }
        if let Some(shared) = lookup("BITHOST_SHARED_UNITS") {
            config
                .modules
                .shared_allow_list
                .extend(split_list(&shared).map(str::to_string));
        }

        config.validate()?;
        Ok(config)
    }

    /// Check invariants that defaults and overrides must keep.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.modules.root_dir.as_os_str().is_empty() {
            return Err(ConfigError::EmptyModulesDir);
        }
        if let Some(bad) = self
            .modules
            .shared_allow_list
            .iter()
            .find(|name| !is_valid_unit_name(name))
        {
            return Err(ConfigError::InvalidSharedName(bad.clone()));
        }
        if self.server.max_body_bytes == 0 {
            return Err(ConfigError::ZeroBodyLimit);
        }
        Ok(())
    }

    /// Socket address the HTTP server binds.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.server.bind_addr, self.server.port)
    }
}

/// Unit names are plain identifiers: no separators, no parent references.
pub fn is_valid_unit_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\'])
        && !name.chars().any(char::is_whitespace)
}

fn parse_env<T: std::str::FromStr>(var: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        var: var.to_string(),
        value: value.to_string(),
    })
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}
