//! # Host Container
//!
//! Configuration plus the container that owns every host-wide instance.
//!
//! - Modules receive shared instances through their `BitContext`, never
//!   through statics
//! - All module-to-module communication goes through the message bus

pub mod config;
pub mod host;

pub use config::{ConfigError, HostConfig, ModulesConfig, ServerConfig};
pub use host::{BitDiagnostics, HostContainer, HostDiagnostics, ServiceInfo};
