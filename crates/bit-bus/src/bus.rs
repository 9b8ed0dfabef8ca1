//! # Message Bus
//!
//! Synchronous fan-out dispatcher with an async variant.
//!
//! ## Delivery guarantees
//!
//! - `publish` runs every current handler for the message type before it
//!   returns. A single-threaded publisher's messages reach each handler in
//!   publish order; no order is promised across subscribers or publishers.
//! - `publish_async` hands the same dispatch to the runtime's blocking pool.
//!   Two async publishes may be delivered in either order.
//! - After `unsubscribe` returns, the handler is never invoked again. Called
//!   from outside any handler, it also waits for an invocation already
//!   running on another thread. Called from inside a handler it does not
//!   wait, so handlers may unsubscribe themselves, or each other across
//!   threads, without deadlocking.
//! - Handler errors and panics are caught per handler and sent to the
//!   [`ErrorReporter`]; they never reach the publisher.

use crate::errors::{BoxError, BusError};
use crate::message::{Envelope, MessageType, Metadata};
use crate::reporter::{ErrorReporter, HandlerFault, LoggingReporter};
use crate::ANONYMOUS_SUBSCRIBER;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

type Handler = dyn Fn(&Envelope) -> Result<(), BoxError> + Send + Sync;

/// Opaque handle returned by `subscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Outcome of a single publish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PublishReport {
    /// Handlers that completed successfully.
    pub delivered: usize,
    /// Handlers that returned an error or panicked.
    pub failed: usize,
}

/// Read-only view of bus activity.
#[derive(Debug, Clone, Serialize)]
pub struct BusDiagnostics {
    pub subscriptions: usize,
    pub message_types: usize,
    pub in_flight_deliveries: usize,
    pub pending_async_publishes: usize,
    pub messages_published: u64,
    pub deliveries: u64,
    pub handler_failures: u64,
    pub last_publish_at: Option<DateTime<Utc>>,
}

struct Subscriber {
    id: SubscriptionId,
    name: String,
    handler: Box<Handler>,
    active: AtomicBool,
    /// Held shared while the handler runs; `unsubscribe` takes it exclusively
    /// to wait out invocations on other threads.
    gate: RwLock<()>,
}

enum Delivery {
    Delivered,
    Failed,
    Skipped,
}

thread_local! {
    static DISPATCHING: RefCell<Vec<SubscriptionId>> = const { RefCell::new(Vec::new()) };
}

/// Marks a subscription as running on the current thread.
struct DispatchScope;

impl DispatchScope {
    fn enter(id: SubscriptionId) -> Self {
        DISPATCHING.with(|stack| stack.borrow_mut().push(id));
        Self
    }

    /// True while any handler runs on the current thread.
    fn is_active() -> bool {
        DISPATCHING.with(|stack| !stack.borrow().is_empty())
    }
}

impl Drop for DispatchScope {
    fn drop(&mut self) {
        DISPATCHING.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

struct BusInner {
    topics: DashMap<MessageType, Vec<Arc<Subscriber>>>,
    index: DashMap<SubscriptionId, MessageType>,
    next_id: AtomicU64,
    reporter: Arc<dyn ErrorReporter>,
    in_flight: AtomicUsize,
    pending_async: AtomicUsize,
    published: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    last_publish: Mutex<Option<DateTime<Utc>>>,
}

/// In-process message bus. Cloning yields another handle to the same bus.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl MessageBus {
    /// Bus that only logs handler failures.
    #[must_use]
    pub fn new() -> Self {
        Self::with_reporter(Arc::new(LoggingReporter))
    }

    /// Bus that forwards handler failures to `reporter`.
    #[must_use]
    pub fn with_reporter(reporter: Arc<dyn ErrorReporter>) -> Self {
        Self {
            inner: Arc::new(BusInner {
                topics: DashMap::new(),
                index: DashMap::new(),
                next_id: AtomicU64::new(1),
                reporter,
                in_flight: AtomicUsize::new(0),
                pending_async: AtomicUsize::new(0),
                published: AtomicU64::new(0),
                delivered: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                last_publish: Mutex::new(None),
            }),
        }
    }

    /// Register an anonymous handler for `message_type`.
    pub fn subscribe<F>(&self, message_type: MessageType, handler: F) -> SubscriptionId
    where
        F: Fn(&Envelope) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.subscribe_as(message_type, ANONYMOUS_SUBSCRIBER, handler)
    }

    /// Register a handler for `message_type` under a subscriber name that is
    /// reported alongside any failure.
    pub fn subscribe_as<F>(
        &self,
        message_type: MessageType,
        subscriber: impl Into<String>,
        handler: F,
    ) -> SubscriptionId
    where
        F: Fn(&Envelope) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let entry = Arc::new(Subscriber {
            id,
            name: subscriber.into(),
            handler: Box::new(handler),
            active: AtomicBool::new(true),
            gate: RwLock::new(()),
        });

        debug!(
            subscription_id = %id,
            subscriber = %entry.name,
            message_type = %message_type,
            "Subscription created"
        );

        self.inner.index.insert(id, message_type.clone());
        self.inner.topics.entry(message_type).or_default().push(entry);
        id
    }

    /// Remove a handler. Once this returns the handler receives nothing more.
    pub fn unsubscribe(&self, id: SubscriptionId) -> Result<(), BusError> {
        let Some((_, message_type)) = self.inner.index.remove(&id) else {
            return Err(BusError::UnknownSubscription(id.0));
        };

        let removed = {
            let mut removed = None;
            if let Some(mut subscribers) = self.inner.topics.get_mut(&message_type) {
                if let Some(pos) = subscribers.iter().position(|s| s.id == id) {
                    removed = Some(subscribers.remove(pos));
                }
            }
            removed
        };
        self.inner
            .topics
            .remove_if(&message_type, |_, subscribers| subscribers.is_empty());

        let Some(entry) = removed else {
            return Err(BusError::UnknownSubscription(id.0));
        };

        entry.active.store(false, Ordering::Release);
        if !DispatchScope::is_active() {
            // Blocks until invocations on other threads have finished.
            drop(entry.gate.write());
        }

        debug!(subscription_id = %id, message_type = %message_type, "Subscription removed");
        Ok(())
    }

    /// Deliver a message to every current subscriber of `message_type`
    /// before returning. Missing metadata is filled with a fresh host stamp.
    pub fn publish(
        &self,
        message_type: MessageType,
        payload: serde_json::Value,
        metadata: Option<Metadata>,
    ) -> PublishReport {
        let envelope = Envelope::new(message_type, payload, metadata.unwrap_or_default());
        self.inner.dispatch(&envelope)
    }

    /// Serialize `value` and publish it.
    pub fn publish_value<T: Serialize>(
        &self,
        message_type: MessageType,
        value: &T,
        metadata: Option<Metadata>,
    ) -> Result<PublishReport, BusError> {
        let payload = serde_json::to_value(value).map_err(BusError::Encode)?;
        Ok(self.publish(message_type, payload, metadata))
    }

    /// Publish without blocking the caller. Delivery runs on the tokio
    /// blocking pool; the returned handle resolves to the delivery report.
    pub fn publish_async(
        &self,
        message_type: MessageType,
        payload: serde_json::Value,
        metadata: Option<Metadata>,
    ) -> Result<JoinHandle<PublishReport>, BusError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| BusError::NoRuntime)?;
        let envelope = Envelope::new(message_type, payload, metadata.unwrap_or_default());
        let inner = Arc::clone(&self.inner);

        inner.pending_async.fetch_add(1, Ordering::Relaxed);
        Ok(runtime.spawn_blocking(move || {
            let report = inner.dispatch(&envelope);
            inner.pending_async.fetch_sub(1, Ordering::Relaxed);
            report
        }))
    }

    /// Number of active subscriptions for one message type.
    #[must_use]
    pub fn subscriber_count(&self, message_type: &MessageType) -> usize {
        self.inner
            .topics
            .get(message_type)
            .map(|subscribers| subscribers.len())
            .unwrap_or(0)
    }

    /// Total active subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.inner.index.len()
    }

    #[must_use]
    pub fn diagnostics(&self) -> BusDiagnostics {
        let inner = &self.inner;
        BusDiagnostics {
            subscriptions: inner.index.len(),
            message_types: inner.topics.len(),
            in_flight_deliveries: inner.in_flight.load(Ordering::Relaxed),
            pending_async_publishes: inner.pending_async.load(Ordering::Relaxed),
            messages_published: inner.published.load(Ordering::Relaxed),
            deliveries: inner.delivered.load(Ordering::Relaxed),
            handler_failures: inner.failed.load(Ordering::Relaxed),
            last_publish_at: *inner.last_publish.lock(),
        }
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageBus")
            .field("subscriptions", &self.inner.index.len())
            .finish()
    }
}

impl BusInner {
    fn dispatch(&self, envelope: &Envelope) -> PublishReport {
        self.published.fetch_add(1, Ordering::Relaxed);

        // Snapshot the list so handlers may (un)subscribe while we iterate.
        let subscribers = self
            .topics
            .get(envelope.message_type())
            .map(|entry| entry.value().clone())
            .unwrap_or_default();

        let mut report = PublishReport::default();
        for subscriber in &subscribers {
            match self.deliver(subscriber, envelope) {
                Delivery::Delivered => report.delivered += 1,
                Delivery::Failed => report.failed += 1,
                Delivery::Skipped => {}
            }
        }

        trace!(
            message_type = %envelope.message_type(),
            message_id = %envelope.metadata().message_id,
            delivered = report.delivered,
            failed = report.failed,
            "Message published"
        );

        *self.last_publish.lock() = Some(Utc::now());
        report
    }

    fn deliver(&self, subscriber: &Subscriber, envelope: &Envelope) -> Delivery {
        let _gate = subscriber.gate.read_recursive();
        if !subscriber.active.load(Ordering::Acquire) {
            return Delivery::Skipped;
        }

        self.in_flight.fetch_add(1, Ordering::Relaxed);
        let outcome = {
            let _scope = DispatchScope::enter(subscriber.id);
            catch_unwind(AssertUnwindSafe(|| (subscriber.handler)(envelope)))
        };
        self.in_flight.fetch_sub(1, Ordering::Relaxed);

        let (error, panicked) = match outcome {
            Ok(Ok(())) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                return Delivery::Delivered;
            }
            Ok(Err(e)) => (e.to_string(), false),
            Err(panic) => (panic_message(panic.as_ref()), true),
        };

        self.failed.fetch_add(1, Ordering::Relaxed);
        self.reporter.report(&HandlerFault {
            subscription_id: subscriber.id.0,
            subscriber: subscriber.name.clone(),
            message_type: envelope.message_type().to_string(),
            message_id: envelope.metadata().message_id,
            error,
            panicked,
            occurred_at: Utc::now(),
        });
        Delivery::Failed
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "(non-string panic)".to_string()
    }
}
