//! # Sample Bits
//!
//! Two modules that only know each other through the message bus.
//!
//! ```text
//!   GET /alpha ──► AlphaBit ──publish orders/OrderCreated──► MessageBus
//!                                                               │
//!   GET /beta/state ◄── inbox state ◄── BetaBit handler ◄───────┘
//! ```
//!
//! Each crate-level module exposes `unit()`, the registration manifest the
//! host binds to a package on disk.

#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod alpha;
pub mod beta;

use bit_contracts::LinkedUnit;

/// Every unit this crate links into the host.
pub fn units() -> Vec<LinkedUnit> {
    vec![alpha::unit(), beta::unit()]
}
