//! # Bit Contracts
//!
//! Everything a module crate needs to be hosted: the [`Bit`] trait, the
//! [`Configurable`] capability, [`Entrypoint`] hooks, the injected
//! [`BitContext`] and the [`LinkedUnit`] registration manifest.
//!
//! ## Design Principles
//!
//! - **Explicit registration**: a module lists its factories in `unit()`;
//!   nothing is discovered by reflection.
//! - **Injected services**: factories get the bus and scheduler through
//!   [`BitContext`].
//! - **Bus-only coupling**: bits talk to each other by publishing messages,
//!   never by calling one another.

#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod bit;
pub mod config;
pub mod context;
pub mod entrypoint;
pub mod errors;
pub mod http;
pub mod unit;

pub use bit::{Bit, BitInfo};
pub use config::Configurable;
pub use context::{BitContext, SchedulerHandle, TaskFn};
pub use entrypoint::{Entrypoint, ServiceCollection};
pub use errors::{BitError, SchedulerError};
pub use http::{BitRequest, BitResponse};
pub use unit::{ComponentFactory, EntrypointFactory, LinkedUnit};

pub use async_trait::async_trait;
