//! # Bit State - Snapshot Store with Live Watchers
//!
//! Each bit that declares state owns one [`StateStore<T>`]. The store keeps
//! the single live value, hands out immutable [`Snapshot`]s, and pushes new
//! snapshots to watchers.
//!
//! ## Freshness over backlog
//!
//! A watcher is a single-slot mailbox. A new update overwrites a snapshot the
//! watcher has not read yet instead of queueing behind it, so slow consumers
//! never build a backlog and always catch up to the latest version. The
//! consequence is that a watcher is not guaranteed to see every version,
//! only the newest one available when it reads. Versions a watcher sees are
//! strictly increasing.
//!
//! ```text
//!   update() ──► [ writer lock: mutate → clone → version+1 ]
//!                              │
//!                              ▼  (after unlock)
//!            ┌───────────┬───────────┬───────────┐
//!            │ mailbox 1 │ mailbox 2 │ mailbox N │   overwrite, never block
//!            └─────┬─────┴─────┬─────┴─────┬─────┘
//!                  ▼           ▼           ▼
//!              watch()     watch()     watch()
//! ```

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod errors;
pub mod snapshot;
pub mod source;
pub mod store;
mod watcher;

pub use errors::StateError;
pub use snapshot::Snapshot;
pub use source::StateSource;
pub use store::{clone_cloner, json_cloner, Cloner, StateDiagnostics, StateStore};
pub use watcher::WatchStream;

pub use tokio_util::sync::CancellationToken;
