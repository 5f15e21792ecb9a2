//! Listener Sets
//!
//! Explicit pub/sub collections used by every component that fans events out
//! to interested parties (socket messages, status changes, health updates,
//! chat updates).
//!
//! Handlers are invoked synchronously, in registration order, on the task
//! that emits the event. The handler table is snapshotted before dispatch so
//! a handler may subscribe or unsubscribe without deadlocking.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct ListenerTable<E: ?Sized> {
    next_id: u64,
    handlers: Vec<(u64, Handler<E>)>,
}

/// A set of event handlers for events of type `E`
pub struct ListenerSet<E: ?Sized> {
    table: Arc<Mutex<ListenerTable<E>>>,
}

impl<E: ?Sized + 'static> ListenerSet<E> {
    /// Create an empty listener set
    #[must_use]
    pub fn new() -> Self {
        Self {
            table: Arc::new(Mutex::new(ListenerTable {
                next_id: 1,
                handlers: Vec::new(),
            })),
        }
    }

    /// Register a handler
    ///
    /// The handler stays registered until the returned [`Subscription`] is
    /// consumed with [`Subscription::unsubscribe`].
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = {
            let mut table = self.table.lock();
            let id = table.next_id;
            table.next_id += 1;
            table.handlers.push((id, Arc::new(handler)));
            id
        };

        let weak: Weak<Mutex<ListenerTable<E>>> = Arc::downgrade(&self.table);
        Subscription::new(move || {
            if let Some(table) = weak.upgrade() {
                table.lock().handlers.retain(|(hid, _)| *hid != id);
            }
        })
    }

    /// Deliver an event to every registered handler
    pub fn emit(&self, event: &E) {
        let handlers: Vec<Handler<E>> = self
            .table
            .lock()
            .handlers
            .iter()
            .map(|(_, h)| Arc::clone(h))
            .collect();

        for handler in handlers {
            handler(event);
        }
    }

    /// Number of registered handlers
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.lock().handlers.len()
    }

    /// Whether no handlers are registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E: ?Sized + 'static> Default for ListenerSet<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: ?Sized> fmt::Debug for ListenerSet<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerSet")
            .field("handlers", &self.table.lock().handlers.len())
            .finish()
    }
}

/// Token returned by every `subscribe`/`on_*` call
///
/// Dropping the token leaves the handler registered; call
/// [`Subscription::unsubscribe`] to remove it.
#[must_use = "keep the subscription to be able to unsubscribe later"]
pub struct Subscription {
    disposer: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Create a subscription from a disposer closure
    pub fn new<F>(disposer: F) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        Self {
            disposer: Some(Box::new(disposer)),
        }
    }

    /// Remove the handler this subscription refers to
    pub fn unsubscribe(mut self) {
        if let Some(dispose) = self.disposer.take() {
            dispose();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.disposer.is_some())
            .finish()
    }
}
