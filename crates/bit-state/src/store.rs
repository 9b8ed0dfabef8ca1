//! # State Store
//!
//! One live value, a version counter, and a set of watchers.
//!
//! ## Locking
//!
//! - `update` holds the writer lock while it mutates, clones, and bumps the
//!   version. Concurrent updates are serialized, so every snapshot equals the
//!   result of exactly one completed update.
//! - `get_snapshot` only takes the short lock guarding the current snapshot
//!   pointer; it never waits for a mutator to finish.
//! - Watchers are notified after the writer lock is released. Each watcher
//!   costs one non-blocking slot overwrite.
//!
//! A mutator must not call `update` on its own store.

use crate::errors::StateError;
use crate::snapshot::Snapshot;
use crate::watcher::{Mailbox, Registration, WatchStream};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Strategy used to take a structural copy of the live value.
pub type Cloner<T> = Arc<dyn Fn(&T) -> Result<T, StateError> + Send + Sync>;

/// Copy via [`Clone`]. Never fails.
pub fn clone_cloner<T: Clone>() -> Cloner<T> {
    Arc::new(|value: &T| Ok(value.clone()))
}

/// Copy via a JSON round trip. Fails for values JSON cannot represent,
/// e.g. maps with non-string keys.
pub fn json_cloner<T: Serialize + DeserializeOwned>() -> Cloner<T> {
    Arc::new(|value: &T| {
        let json = serde_json::to_value(value).map_err(|e| StateError::Clone(e.to_string()))?;
        serde_json::from_value(json).map_err(|e| StateError::Clone(e.to_string()))
    })
}

/// Read-only view of a store for diagnostics endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct StateDiagnostics {
    pub key: String,
    pub version: u64,
    pub watchers: usize,
    pub clone_failures: u64,
    /// Current snapshot aliases the live value.
    pub live_fallback: bool,
    /// Notifications overwritten before a watcher read them.
    pub superseded_notifications: u64,
    pub last_updated: DateTime<Utc>,
    pub closed: bool,
}

struct StoreInner<T> {
    key: String,
    live: Arc<Mutex<T>>,
    current: RwLock<Snapshot<T>>,
    cloner: Cloner<T>,
    watchers: Mutex<HashMap<u64, Arc<Mailbox<T>>>>,
    next_watcher: AtomicU64,
    clone_failures: AtomicU64,
    superseded_released: AtomicU64,
    closed: AtomicBool,
}

/// Owner of one bit's mutable state. Cloning yields another handle to the
/// same store.
pub struct StateStore<T> {
    inner: Arc<StoreInner<T>>,
}

impl<T> Clone for StateStore<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + Sync + 'static> StateStore<T> {
    /// Store using [`Clone`] for snapshots.
    pub fn new(key: impl Into<String>, initial: T) -> Self
    where
        T: Clone,
    {
        Self::with_cloner(key, initial, clone_cloner())
    }

    /// Store using a custom cloning strategy.
    pub fn with_cloner(key: impl Into<String>, initial: T, cloner: Cloner<T>) -> Self {
        let key = key.into();
        let live = Arc::new(Mutex::new(initial));
        let clone_failures = AtomicU64::new(0);

        let first = {
            let guard = live.lock();
            capture(&key, &cloner, &live, &*guard, 0, &clone_failures)
        };

        Self {
            inner: Arc::new(StoreInner {
                key,
                live,
                current: RwLock::new(first),
                cloner,
                watchers: Mutex::new(HashMap::new()),
                next_watcher: AtomicU64::new(1),
                clone_failures,
                superseded_released: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// Apply `mutator` to the live value and publish the resulting snapshot.
    ///
    /// If the cloning strategy fails the update still completes; the new
    /// snapshot refers to the live value and a warning is logged.
    pub fn update<F>(&self, mutator: F) -> Snapshot<T>
    where
        F: FnOnce(&mut T),
    {
        let inner = &self.inner;
        let snapshot = {
            let mut live = inner.live.lock();
            mutator(&mut *live);
            let version = inner.current.read().version() + 1;
            let snapshot = capture(
                &inner.key,
                &inner.cloner,
                &inner.live,
                &*live,
                version,
                &inner.clone_failures,
            );
            *inner.current.write() = snapshot.clone();
            snapshot
        };

        inner.fan_out(&snapshot);
        snapshot
    }

    /// Most recent snapshot.
    #[must_use]
    pub fn get_snapshot(&self) -> Snapshot<T> {
        self.inner.current.read().clone()
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.inner.current.read().version()
    }

    /// Start watching. The first item is the current snapshot; afterwards the
    /// newest snapshot available each time the consumer polls.
    pub fn watch(&self, cancel: CancellationToken) -> WatchStream<T> {
        let id = self.inner.next_watcher.fetch_add(1, Ordering::Relaxed);
        let mailbox = Arc::new(Mailbox::new(cancel.clone()));

        self.inner.watchers.lock().insert(id, Arc::clone(&mailbox));
        if self.inner.closed.load(Ordering::Acquire) {
            mailbox.close();
        }
        mailbox.offer(self.get_snapshot());

        debug!(state = %self.inner.key, watcher = id, "Watcher attached");

        let weak: Weak<StoreInner<T>> = Arc::downgrade(&self.inner);
        let registration = Registration::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.release(id);
            }
        });

        WatchStream::new(mailbox, cancel, registration)
    }

    /// Active watchers. Cancelled watchers are dropped from the count
    /// immediately, even before their stream is polled again.
    #[must_use]
    pub fn watcher_count(&self) -> usize {
        self.inner.prune_cancelled();
        self.inner.watchers.lock().len()
    }

    /// End every watch stream. Later updates still apply but reach no one.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        for mailbox in self.inner.watchers.lock().values() {
            mailbox.close();
        }
        debug!(state = %self.inner.key, "State store closed");
    }

    #[must_use]
    pub fn diagnostics(&self) -> StateDiagnostics {
        let current = self.get_snapshot();
        let watchers = self.watcher_count();
        let superseded_active: u64 = self
            .inner
            .watchers
            .lock()
            .values()
            .map(|m| m.superseded())
            .sum();

        StateDiagnostics {
            key: self.inner.key.clone(),
            version: current.version(),
            watchers,
            clone_failures: self.inner.clone_failures.load(Ordering::Relaxed),
            live_fallback: current.is_live(),
            superseded_notifications: superseded_active
                + self.inner.superseded_released.load(Ordering::Relaxed),
            last_updated: current.taken_at(),
            closed: self.inner.closed.load(Ordering::Acquire),
        }
    }
}

impl<T> StoreInner<T> {
    fn fan_out(&self, snapshot: &Snapshot<T>) {
        self.prune_cancelled();
        let mailboxes: Vec<Arc<Mailbox<T>>> = self.watchers.lock().values().cloned().collect();
        for mailbox in mailboxes {
            mailbox.offer(snapshot.clone());
        }
    }

    fn prune_cancelled(&self) {
        let mut watchers = self.watchers.lock();
        let cancelled: Vec<u64> = watchers
            .iter()
            .filter(|(_, m)| m.is_cancelled())
            .map(|(id, _)| *id)
            .collect();
        for id in cancelled {
            if let Some(mailbox) = watchers.remove(&id) {
                self.retire(id, &mailbox);
            }
        }
    }

    fn release(&self, id: u64) {
        let removed = self.watchers.lock().remove(&id);
        if let Some(mailbox) = removed {
            self.retire(id, &mailbox);
        }
    }

    fn retire(&self, id: u64, mailbox: &Mailbox<T>) {
        self.superseded_released
            .fetch_add(mailbox.superseded(), Ordering::Relaxed);
        debug!(state = %self.key, watcher = id, "Watcher detached");
    }
}

fn capture<T>(
    key: &str,
    cloner: &Cloner<T>,
    live: &Arc<Mutex<T>>,
    value: &T,
    version: u64,
    failures: &AtomicU64,
) -> Snapshot<T> {
    match cloner(value) {
        Ok(copy) => Snapshot::frozen(version, copy),
        Err(e) => {
            failures.fetch_add(1, Ordering::Relaxed);
            warn!(
                state = %key,
                version,
                error = %e,
                "Snapshot clone failed, handing out live state"
            );
            Snapshot::live(version, Arc::clone(live))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde::Deserialize;
    use std::thread;
    use std::time::Duration;
    use tokio::time::timeout;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Pair {
        a: u64,
        b: u64,
    }

    async fn next<T: Send + Sync + 'static>(stream: &mut WatchStream<T>) -> Option<Snapshot<T>> {
        timeout(Duration::from_secs(2), stream.next())
            .await
            .expect("watch stream stalled")
    }

    #[test]
    fn test_update_bumps_version_and_snapshot() {
        let store = StateStore::new("counter", 0u32);
        assert_eq!(store.version(), 0);

        let snapshot = store.update(|v| *v += 5);
        assert_eq!(snapshot.version(), 1);
        assert_eq!(store.get_snapshot().to_value(), 5);

        store.update(|v| *v += 1);
        assert_eq!(store.version(), 2);
        // Earlier snapshot is unaffected by later updates.
        assert_eq!(snapshot.to_value(), 5);
    }

    #[tokio::test]
    async fn test_late_watcher_sees_only_latest() {
        let store = StateStore::new("orders", Vec::<u32>::new());
        store.update(|v| v.push(1));
        store.update(|v| v.push(2));
        store.update(|v| v.push(3));

        let mut stream = store.watch(CancellationToken::new());
        let first = next(&mut stream).await.unwrap();

        assert_eq!(first.version(), 3);
        assert_eq!(first.to_value(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_slow_watcher_skips_to_newest() {
        let store = StateStore::new("counter", 0u64);
        let mut stream = store.watch(CancellationToken::new());
        assert_eq!(next(&mut stream).await.unwrap().version(), 0);

        for _ in 0..5 {
            store.update(|v| *v += 1);
        }

        let latest = next(&mut stream).await.unwrap();
        assert_eq!(latest.version(), 5);
        assert_eq!(latest.to_value(), 5);
        assert_eq!(store.diagnostics().superseded_notifications, 4);
    }

    #[tokio::test]
    async fn test_cancel_releases_watcher_immediately() {
        let store = StateStore::new("counter", 0u64);
        let token = CancellationToken::new();
        let mut stream = store.watch(token.clone());
        assert_eq!(store.watcher_count(), 1);

        token.cancel();
        assert_eq!(store.watcher_count(), 0);
        assert!(next(&mut stream).await.is_none());
    }

    #[tokio::test]
    async fn test_dropping_stream_releases_watcher() {
        let store = StateStore::new("counter", 0u64);
        let stream = store.watch(CancellationToken::new());
        let _other = store.watch(CancellationToken::new());
        assert_eq!(store.watcher_count(), 2);

        drop(stream);
        assert_eq!(store.watcher_count(), 1);
    }

    #[tokio::test]
    async fn test_close_ends_streams() {
        let store = StateStore::new("counter", 0u64);
        let mut stream = store.watch(CancellationToken::new());
        assert!(next(&mut stream).await.is_some());

        store.close();
        assert!(next(&mut stream).await.is_none());

        let mut late = store.watch(CancellationToken::new());
        assert_eq!(next(&mut late).await.unwrap().version(), 0);
        assert!(next(&mut late).await.is_none());
    }

    #[tokio::test]
    async fn test_watcher_wakes_on_update() {
        let store = StateStore::new("counter", 0u64);
        let mut stream = store.watch(CancellationToken::new());
        next(&mut stream).await.unwrap();

        let writer = store.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.update(|v| *v = 42);
        });

        let snapshot = next(&mut stream).await.unwrap();
        assert_eq!(snapshot.to_value(), 42);
        handle.await.unwrap();
    }

    #[test]
    fn test_concurrent_updates_never_mix() {
        let store = StateStore::new("pair", Pair::default());
        let writers: Vec<_> = (0..8u64)
            .map(|n| {
                let store = store.clone();
                thread::spawn(move || {
                    for i in 0..200u64 {
                        let tag = n * 1_000 + i;
                        store.update(|pair| {
                            pair.a = tag;
                            pair.b = tag;
                        });
                    }
                })
            })
            .collect();

        let reader = {
            let store = store.clone();
            thread::spawn(move || {
                for _ in 0..2_000 {
                    let pair = store.get_snapshot().to_value();
                    assert_eq!(pair.a, pair.b);
                }
            })
        };

        for writer in writers {
            writer.join().unwrap();
        }
        reader.join().unwrap();

        assert_eq!(store.version(), 1_600);
        let last = store.get_snapshot().to_value();
        assert_eq!(last.a, last.b);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_watcher_versions_strictly_increase() {
        let store = StateStore::new("counter", 0u64);
        let mut stream = store.watch(CancellationToken::new());

        let writers: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                tokio::task::spawn_blocking(move || {
                    for _ in 0..250 {
                        store.update(|v| *v += 1);
                    }
                })
            })
            .collect();

        let mut seen = Vec::new();
        while let Some(snapshot) = next(&mut stream).await {
            seen.push(snapshot.version());
            if snapshot.version() == 1_000 {
                break;
            }
        }
        for writer in writers {
            writer.await.unwrap();
        }

        assert!(seen.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(seen.last().copied(), Some(1_000));
    }

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct Grid {
        cells: HashMap<(u32, u32), u32>,
    }

    #[test]
    fn test_clone_failure_falls_back_to_live_value() {
        let store = StateStore::with_cloner("grid", Grid::default(), json_cloner());
        // Empty map serializes fine.
        assert!(!store.get_snapshot().is_live());

        let snapshot = store.update(|grid| {
            grid.cells.insert((1, 2), 3);
        });

        assert_eq!(snapshot.version(), 1);
        assert!(snapshot.is_live());
        assert_eq!(snapshot.with(|g| g.cells.get(&(1, 2)).copied()), Some(3));

        let diag = store.diagnostics();
        assert_eq!(diag.clone_failures, 1);
        assert!(diag.live_fallback);
    }

    #[test]
    fn test_json_cloner_copies_structurally() {
        let store = StateStore::with_cloner("pair", Pair { a: 1, b: 1 }, json_cloner());
        let snapshot = store.update(|p| p.a = 2);
        assert!(!snapshot.is_live());
        assert_eq!(snapshot.to_value(), Pair { a: 2, b: 1 });
    }
}
