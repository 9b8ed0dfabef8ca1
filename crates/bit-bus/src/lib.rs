//! # Bit Bus - Typed Message Bus for Bits
//!
//! The in-process publish/subscribe dispatcher that every loaded bit shares.
//!
//! ## Rules
//!
//! - Messages are addressed by [`MessageType`], a `(category, name)` pair
//!   compared by value, so bits packaged separately can talk about the same
//!   logical message without sharing a compiled constant.
//! - Every delivery carries an immutable, shared [`Envelope`].
//! - A failing handler never affects its siblings or the publisher; the
//!   failure goes to an [`ErrorReporter`].
//!
//! ```text
//! ┌──────────────┐                    ┌──────────────┐
//! │    Bit A     │                    │    Bit B     │
//! │              │    publish()       │              │
//! │              │ ──────┐            │              │
//! └──────────────┘       │            └──────────────┘
//!                        ▼                    ↑
//!                  ┌──────────────┐          │
//!                  │  MessageBus  │          │
//!                  │              │ ─────────┘
//!                  └──────────────┘  subscribe()
//! ```

// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod bus;
pub mod errors;
pub mod message;
pub mod reporter;

pub use bus::{BusDiagnostics, MessageBus, PublishReport, SubscriptionId};
pub use errors::{BoxError, BusError};
pub use message::{Envelope, MessageType, Metadata};
pub use reporter::{ErrorReporter, FaultLog, HandlerFault, LoggingReporter};

/// Subscriber name used when a handler is registered without one.
pub const ANONYMOUS_SUBSCRIBER: &str = "anonymous";

/// Source recorded on envelopes published without explicit metadata.
pub const HOST_SOURCE: &str = "host";

/// Number of recent handler faults kept by [`FaultLog`].
pub const DEFAULT_FAULT_HISTORY: usize = 64;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_fault_history() {
        assert_eq!(DEFAULT_FAULT_HISTORY, 64);
    }
}
