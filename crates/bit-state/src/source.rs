//! Type-erased access to a store for the HTTP layer.

use crate::errors::StateError;
use crate::store::{StateDiagnostics, StateStore};
use futures::stream::{BoxStream, StreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// A state store seen as JSON, independent of its value type.
pub trait StateSource: Send + Sync {
    fn key(&self) -> &str;

    /// Current snapshot with its version.
    fn snapshot_json(&self) -> Result<(u64, serde_json::Value), StateError>;

    /// Watch stream of `(version, value)` pairs. Snapshots that fail to
    /// serialize are logged and skipped.
    fn watch_json(&self, cancel: CancellationToken) -> BoxStream<'static, (u64, serde_json::Value)>;

    fn watcher_count(&self) -> usize;

    fn diagnostics(&self) -> StateDiagnostics;

    fn close(&self);
}

impl<T> StateSource for StateStore<T>
where
    T: Serialize + Send + Sync + 'static,
{
    fn key(&self) -> &str {
        StateStore::key(self)
    }

    fn snapshot_json(&self) -> Result<(u64, serde_json::Value), StateError> {
        let snapshot = self.get_snapshot();
        let value = serde_json::to_value(&snapshot)?;
        Ok((snapshot.version(), value))
    }

    fn watch_json(&self, cancel: CancellationToken) -> BoxStream<'static, (u64, serde_json::Value)> {
        let key = self.key().to_string();
        self.watch(cancel)
            .filter_map(move |snapshot| {
                let version = snapshot.version();
                let item = match serde_json::to_value(&snapshot) {
                    Ok(value) => Some((version, value)),
                    Err(e) => {
                        warn!(state = %key, version, error = %e, "Dropping unserializable snapshot");
                        None
                    }
                };
                futures::future::ready(item)
            })
            .boxed()
    }

    fn watcher_count(&self) -> usize {
        StateStore::watcher_count(self)
    }

    fn diagnostics(&self) -> StateDiagnostics {
        StateStore::diagnostics(self)
    }

    fn close(&self) {
        StateStore::close(self);
    }
}
