//! # Process-wide publish/subscribe event bus.
//!
//! [`EventBus`] decouples the components that produce kernel and notebook
//! events from the N independent consumers that care about them (WebSocket
//! routers, loggers, metrics collectors).
//!
//! ## Architecture
//! ```text
//! publish(event)
//!     │
//!     ├──► inline handler 1 ──► filter + enqueue (runs in publisher context)
//!     ├──► inline handler 2
//!     └──► [queue] ──► worker task ──► async handler (runs on its own task)
//! ```
//!
//! ## Rules
//! - **Subscription order**: handlers of one kind are invoked in the order they subscribed.
//! - **No replay**: a handler subscribed after a publish never sees that event.
//! - **Isolation**: a handler that errors or panics is logged; delivery continues.
//! - **Non-blocking**: async handlers are fed through an unbounded per-subscriber
//!   FIFO, so a slow handler only delays itself.
//! - **Scoped lifetime**: every subscription is an RAII [`Subscription`] guard;
//!   dropping it unsubscribes.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use futures::FutureExt;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;

use crate::events::{Event, EventKind};

/// Error returned by a bus handler.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct HandlerError(String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Identifier of one registration on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type InlineHandler = Arc<dyn Fn(&Event) -> Result<(), HandlerError> + Send + Sync>;

#[derive(Clone)]
enum Handler {
    Inline(InlineHandler),
    Worker {
        name: &'static str,
        tx: mpsc::UnboundedSender<Event>,
    },
}

#[derive(Clone)]
struct Registration {
    id: SubscriptionId,
    handler: Handler,
}

/// Counters describing bus usage.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BusStats {
    pub events_published: u64,
    pub handler_failures: u64,
}

struct Inner {
    handlers: Mutex<FxHashMap<EventKind, Vec<Registration>>>,
    next_id: AtomicU64,
    events_published: AtomicU64,
    handler_failures: AtomicU64,
}

impl Inner {
    fn remove(&self, kind: EventKind, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(list) = handlers.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|r| r.id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            handlers.remove(&kind);
        }
        removed
    }
}

/// In-memory publish/subscribe registry keyed by [`EventKind`].
///
/// Cheap to clone; all clones share the same registrations.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.total_subscribers())
            .field("stats", &self.stats())
            .finish()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                handlers: Mutex::new(FxHashMap::default()),
                next_id: AtomicU64::new(1),
                events_published: AtomicU64::new(0),
                handler_failures: AtomicU64::new(0),
            }),
        }
    }

    /// Publish an event to every handler currently subscribed to its kind.
    ///
    /// Returns the number of handlers the event was handed to. Handlers are
    /// snapshotted first, so a handler may publish or (un)subscribe
    /// re-entrantly.
    pub fn publish(&self, event: Event) -> usize {
        let kind = event.kind();
        let snapshot: Vec<Registration> = {
            let handlers = self
                .inner
                .handlers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            handlers.get(&kind).cloned().unwrap_or_default()
        };
        self.inner.events_published.fetch_add(1, Ordering::Relaxed);

        let mut delivered = 0;
        for registration in &snapshot {
            match &registration.handler {
                Handler::Inline(handler) => {
                    match std::panic::catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                        Ok(Ok(())) => delivered += 1,
                        Ok(Err(e)) => {
                            self.inner.handler_failures.fetch_add(1, Ordering::Relaxed);
                            tracing::warn!("Handler for {} failed: {}", kind, e);
                        }
                        Err(panic) => {
                            self.inner.handler_failures.fetch_add(1, Ordering::Relaxed);
                            tracing::error!("Handler for {} panicked: {}", kind, panic_message(&*panic));
                        }
                    }
                }
                Handler::Worker { name, tx } => {
                    if tx.send(event.clone()).is_ok() {
                        delivered += 1;
                    } else {
                        tracing::debug!("Worker '{}' for {} has stopped", name, kind);
                    }
                }
            }
        }

        tracing::trace!("Published {} to {} handlers", kind, delivered);
        delivered
    }

    /// Subscribe an inline handler.
    ///
    /// The handler runs in the publisher's context and must not block; the
    /// intended shape is "filter, reshape, enqueue".
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&Event) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.register(kind, Handler::Inline(Arc::new(handler)))
    }

    /// Subscribe an asynchronous handler running on a dedicated worker task.
    ///
    /// Events are queued per subscriber and processed one at a time in
    /// publish order. Must be called from within a Tokio runtime.
    pub fn subscribe_async<F, Fut>(&self, kind: EventKind, name: &'static str, handler: F) -> Subscription
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
        let inner = Arc::downgrade(&self.inner);

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let result = AssertUnwindSafe(handler(event)).catch_unwind().await;
                let failed = match result {
                    Ok(Ok(())) => false,
                    Ok(Err(e)) => {
                        tracing::warn!("Async handler '{}' for {} failed: {}", name, kind, e);
                        true
                    }
                    Err(panic) => {
                        tracing::error!(
                            "Async handler '{}' for {} panicked: {}",
                            name,
                            kind,
                            panic_message(&*panic)
                        );
                        true
                    }
                };
                if failed {
                    if let Some(inner) = inner.upgrade() {
                        inner.handler_failures.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            tracing::debug!("Async handler '{}' for {} stopped", name, kind);
        });

        self.register(kind, Handler::Worker { name, tx })
    }

    fn register(&self, kind: EventKind, handler: Handler) -> Subscription {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind)
            .or_default()
            .push(Registration { id, handler });

        tracing::trace!("Subscribed {:?} to {}", id, kind);
        Subscription {
            bus: Some(Arc::downgrade(&self.inner)),
            kind,
            id,
        }
    }

    /// Remove a subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, mut subscription: Subscription) -> bool {
        subscription.cancel()
    }

    /// Number of handlers subscribed to `kind`.
    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.inner
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .map_or(0, Vec::len)
    }

    /// Number of handlers across all kinds.
    pub fn total_subscribers(&self) -> usize {
        self.inner
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(Vec::len)
            .sum()
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            events_published: self.inner.events_published.load(Ordering::Relaxed),
            handler_failures: self.inner.handler_failures.load(Ordering::Relaxed),
        }
    }
}

/// Registration guard; unsubscribes when dropped.
#[must_use = "dropping a Subscription unsubscribes its handler"]
pub struct Subscription {
    bus: Option<Weak<Inner>>,
    kind: EventKind,
    id: SubscriptionId,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    fn cancel(&mut self) -> bool {
        let Some(bus) = self.bus.take() else {
            return false;
        };
        match bus.upgrade() {
            Some(inner) => inner.remove(self.kind, self.id),
            None => false,
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
