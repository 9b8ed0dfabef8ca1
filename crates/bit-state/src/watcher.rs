//! Single-slot watcher mailboxes and the stream handed to callers.

use crate::snapshot::Snapshot;
use futures::stream::{BoxStream, Stream, StreamExt};
use parking_lot::Mutex;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

struct Slot<T> {
    pending: Option<Snapshot<T>>,
    delivered: Option<u64>,
}

/// Holds at most one undelivered snapshot, always the newest offered.
pub(crate) struct Mailbox<T> {
    slot: Mutex<Slot<T>>,
    notify: Notify,
    closed: AtomicBool,
    cancel: CancellationToken,
    superseded: AtomicU64,
}

impl<T> Mailbox<T> {
    pub(crate) fn new(cancel: CancellationToken) -> Self {
        Self {
            slot: Mutex::new(Slot {
                pending: None,
                delivered: None,
            }),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            cancel,
            superseded: AtomicU64::new(0),
        }
    }

    /// Place `snapshot` in the slot unless the watcher already has something
    /// at least as new. Never blocks on the consumer.
    pub(crate) fn offer(&self, snapshot: Snapshot<T>) -> bool {
        let mut slot = self.slot.lock();
        let newest = slot
            .pending
            .as_ref()
            .map(Snapshot::version)
            .or(slot.delivered);
        if newest.is_some_and(|v| snapshot.version() <= v) {
            return false;
        }
        if slot.pending.replace(snapshot).is_some() {
            self.superseded.fetch_add(1, Ordering::Relaxed);
        }
        drop(slot);
        self.notify.notify_one();
        true
    }

    fn take(&self) -> Option<Snapshot<T>> {
        let mut slot = self.slot.lock();
        let snapshot = slot.pending.take()?;
        slot.delivered = Some(snapshot.version());
        Some(snapshot)
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn superseded(&self) -> u64 {
        self.superseded.load(Ordering::Relaxed)
    }
}

/// Removes the watcher from its store when dropped.
pub(crate) struct Registration {
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Registration {
    pub(crate) fn new(release: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

struct WatchState<T> {
    mailbox: Arc<Mailbox<T>>,
    cancel: CancellationToken,
    _registration: Registration,
}

/// Stream of snapshots from [`StateStore::watch`](crate::StateStore::watch).
///
/// Ends when the token is cancelled or the store is closed. Dropping the
/// stream unregisters the watcher.
pub struct WatchStream<T> {
    inner: BoxStream<'static, Snapshot<T>>,
}

impl<T: Send + Sync + 'static> WatchStream<T> {
    pub(crate) fn new(
        mailbox: Arc<Mailbox<T>>,
        cancel: CancellationToken,
        registration: Registration,
    ) -> Self {
        let state = WatchState {
            mailbox,
            cancel,
            _registration: registration,
        };

        let inner = futures::stream::unfold(state, |state| async move {
            loop {
                if state.cancel.is_cancelled() {
                    return None;
                }
                if let Some(snapshot) = state.mailbox.take() {
                    return Some((snapshot, state));
                }
                if state.mailbox.is_closed() {
                    return None;
                }
                tokio::select! {
                    () = state.mailbox.notify.notified() => {}
                    () = state.cancel.cancelled() => {}
                }
            }
        })
        .boxed();

        Self { inner }
    }
}

impl<T> Stream for WatchStream<T> {
    type Item = Snapshot<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().inner.poll_next_unpin(cx)
    }
}
