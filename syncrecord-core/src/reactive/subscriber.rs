//! Subscriber bookkeeping.
//!
//! Every callback registered with a reactive value gets a unique
//! [`SubscriberId`] and lives in a [`SubscriberList`] until its
//! [`Subscription`] is dropped or explicitly unsubscribed.
//!
//! Notification snapshots the list first and runs callbacks without holding
//! the list lock, so a callback may subscribe, unsubscribe or destroy the
//! value it observes. An entry removed while a notification is in flight is
//! not called again. A panicking callback is logged and skipped; the
//! remaining subscribers are still notified.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::error;

/// Unique identifier for a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl SubscriberId {
    /// Generate a new unique subscriber ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// An ordered set of callbacks.
pub(crate) struct SubscriberList<F: ?Sized> {
    entries: Mutex<Vec<(SubscriberId, Arc<F>)>>,
}

impl<F: ?Sized> Default for SubscriberList<F> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }
}

impl<F: ?Sized> SubscriberList<F> {
    pub(crate) fn add(&self, id: SubscriberId, callback: Arc<F>) {
        self.entries.lock().push((id, callback));
    }

    pub(crate) fn remove(&self, id: SubscriberId) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|(existing, _)| *existing != id);
        entries.len() != before
    }

    pub(crate) fn get(&self, id: SubscriberId) -> Option<Arc<F>> {
        self.entries
            .lock()
            .iter()
            .find(|(existing, _)| *existing == id)
            .map(|(_, callback)| callback.clone())
    }

    pub(crate) fn contains(&self, id: SubscriberId) -> bool {
        self.entries.lock().iter().any(|(existing, _)| *existing == id)
    }

    pub(crate) fn clear(&self) {
        self.entries.lock().clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Invoke `call` for every subscriber registered at the time of the call
    /// that is still registered when its turn comes.
    pub(crate) fn notify_each(&self, mut call: impl FnMut(&F)) {
        let snapshot: Vec<(SubscriberId, Arc<F>)> = self.entries.lock().clone();
        for (id, callback) in snapshot {
            if !self.contains(id) {
                continue;
            }
            invoke_isolated(id, || call(&callback));
        }
    }
}

/// Run a user callback, logging instead of propagating a panic.
pub(crate) fn invoke_isolated(id: SubscriberId, f: impl FnOnce()) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(f)) {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        error!(subscriber = %id, %message, "subscriber panicked");
    }
}

/// Keeps a callback registered. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    id: SubscriberId,
    cancel: Option<Box<dyn FnOnce(SubscriberId) + Send + Sync>>,
}

impl Subscription {
    pub(crate) fn new<F>(id: SubscriberId, cancel: F) -> Self
    where
        F: FnOnce(SubscriberId) + Send + Sync + 'static,
    {
        Self {
            id,
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A subscription that was never registered (e.g. on a destroyed value).
    pub(crate) fn inert(id: SubscriberId) -> Self {
        Self { id, cancel: None }
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn unsubscribe(mut self) {
        self.cancel_now();
    }

    fn cancel_now(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel(self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel_now();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.cancel.is_some())
            .finish()
    }
}
