//! # Bithost Runtime Library
//!
//! Loads independently packaged modules, registers their bits and serves
//! them over HTTP. The `bithost` binary in `main.rs` is a thin wrapper.
//!
//! ## Architectural Patterns
//!
//! - **Isolation**: every module package resolves its dependencies in its
//!   own load context; one broken package never stops the others
//! - **Bus-only coupling**: bits communicate through the shared message bus
//! - **Injected services**: bus, scheduler and module identity arrive via
//!   `BitContext`, never through statics

#![allow(clippy::type_complexity)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod container;
pub mod http;
pub mod loader;
pub mod registry;
pub mod runtime;
pub mod scheduler;

pub use container::{HostConfig, HostContainer};
pub use loader::{ModuleLoader, UnitCatalog};
pub use registry::{ModuleRegistry, RegistryBuilder, RegistryError};
pub use runtime::{HostRuntime, RuntimeError, StartReport};
pub use scheduler::{ModuleTasks, TaskScheduler};
