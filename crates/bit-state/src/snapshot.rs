//! Immutable point-in-time views of a store's value.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Serialize, Serializer};
use std::fmt;
use std::sync::Arc;

enum SnapshotValue<T> {
    Frozen(Arc<T>),
    /// Clone failed; readers see the live value through the writer lock.
    Live(Arc<Mutex<T>>),
}

/// A store's value at one version.
///
/// Normally a structural copy taken inside the update that produced it. When
/// the cloning strategy fails the snapshot instead refers to the live value
/// (see [`Snapshot::is_live`]); reads then go through the writer lock, so they
/// are never torn, but they may reflect a later version.
pub struct Snapshot<T> {
    version: u64,
    taken_at: DateTime<Utc>,
    value: SnapshotValue<T>,
}

impl<T> Snapshot<T> {
    pub(crate) fn frozen(version: u64, value: T) -> Self {
        Self {
            version,
            taken_at: Utc::now(),
            value: SnapshotValue::Frozen(Arc::new(value)),
        }
    }

    pub(crate) fn live(version: u64, live: Arc<Mutex<T>>) -> Self {
        Self {
            version,
            taken_at: Utc::now(),
            value: SnapshotValue::Live(live),
        }
    }

    /// Store version this snapshot was taken at. The initial value is 0.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    #[must_use]
    pub fn taken_at(&self) -> DateTime<Utc> {
        self.taken_at
    }

    /// True when this snapshot aliases the live value.
    #[must_use]
    pub fn is_live(&self) -> bool {
        matches!(self.value, SnapshotValue::Live(_))
    }

    /// Run `f` against the snapshot value.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        match &self.value {
            SnapshotValue::Frozen(value) => f(value),
            SnapshotValue::Live(live) => f(&live.lock()),
        }
    }
}

impl<T: Clone> Snapshot<T> {
    /// Owned copy of the snapshot value.
    #[must_use]
    pub fn to_value(&self) -> T {
        self.with(T::clone)
    }
}

impl<T> Clone for Snapshot<T> {
    fn clone(&self) -> Self {
        let value = match &self.value {
            SnapshotValue::Frozen(v) => SnapshotValue::Frozen(Arc::clone(v)),
            SnapshotValue::Live(v) => SnapshotValue::Live(Arc::clone(v)),
        };
        Self {
            version: self.version,
            taken_at: self.taken_at,
            value,
        }
    }
}

impl<T: Serialize> Serialize for Snapshot<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.with(|value| value.serialize(serializer))
    }
}

impl<T: fmt::Debug> fmt::Debug for Snapshot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.with(|value| {
            f.debug_struct("Snapshot")
                .field("version", &self.version)
                .field("live", &self.is_live())
                .field("value", value)
                .finish()
        })
    }
}
