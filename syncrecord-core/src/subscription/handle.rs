//! A shared, refcounted backend view.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::backend::{Unlisten, View, ViewData};
use crate::error::{RecordError, Result};
use crate::query::{Fingerprint, Projection};
use crate::reactive::{SubscriberId, SubscriberList};
use crate::ttl::Ttl;

/// Callback receiving projected snapshots from a handle.
pub type SnapshotListener = Arc<dyn Fn(&ViewData) + Send + Sync>;

enum Status {
    /// Materialization failed; the handle is not shared.
    Pending(RecordError),
    Live {
        view: Arc<dyn View>,
        unlisten: Option<Unlisten>,
    },
    Released,
}

/// One materialized backend view, shared by every consumer of the same
/// fingerprint.
pub struct SubscriptionHandle {
    fingerprint: Fingerprint,
    ttl: Ttl,
    ref_count: AtomicUsize,
    status: Mutex<Status>,
    projection: Option<Projection>,
    listeners: SubscriberList<dyn Fn(&ViewData) + Send + Sync>,
    latest: watch::Sender<Option<ViewData>>,
}

impl SubscriptionHandle {
    fn with_status(
        fingerprint: Fingerprint,
        ttl: Ttl,
        projection: Option<Projection>,
        status: Status,
    ) -> Self {
        let (latest, _) = watch::channel(None);
        Self {
            fingerprint,
            ttl,
            ref_count: AtomicUsize::new(1),
            status: Mutex::new(status),
            projection,
            listeners: SubscriberList::default(),
            latest,
        }
    }

    pub(crate) fn live(
        fingerprint: Fingerprint,
        ttl: Ttl,
        projection: Option<Projection>,
        view: Arc<dyn View>,
    ) -> Self {
        Self::with_status(
            fingerprint,
            ttl,
            projection,
            Status::Live {
                view,
                unlisten: None,
            },
        )
    }

    pub(crate) fn pending(fingerprint: Fingerprint, ttl: Ttl, error: RecordError) -> Self {
        Self::with_status(fingerprint, ttl, None, Status::Pending(error))
    }

    /// Register the backend listener that feeds this handle.
    pub(crate) fn attach(self: &Arc<Self>) {
        let view = match &*self.status.lock() {
            Status::Live { view, .. } => view.clone(),
            _ => return,
        };

        let weak = Arc::downgrade(self);
        let unlisten = view.add_listener(Arc::new(move |data: &ViewData| {
            if let Some(handle) = weak.upgrade() {
                handle.deliver(data);
            }
        }));

        let orphaned = {
            let mut status = self.status.lock();
            if let Status::Live { unlisten: slot, .. } = &mut *status {
                *slot = Some(unlisten);
                None
            } else {
                // Released while attaching.
                Some(unlisten)
            }
        };
        if let Some(unlisten) = orphaned {
            unlisten.call();
        }
    }

    /// Key under which this handle is shared.
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// TTL the view was materialized with.
    pub fn ttl(&self) -> Ttl {
        self.ttl
    }

    /// Number of acquirers still holding the handle.
    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::SeqCst)
    }

    /// Whether a backend view is attached.
    pub fn is_live(&self) -> bool {
        matches!(*self.status.lock(), Status::Live { .. })
    }

    /// Whether materialization failed and no view exists.
    pub fn is_pending(&self) -> bool {
        matches!(*self.status.lock(), Status::Pending(_))
    }

    /// The materialization error of a pending handle.
    pub fn error(&self) -> Option<RecordError> {
        match &*self.status.lock() {
            Status::Pending(error) => Some(error.clone()),
            _ => None,
        }
    }

    /// The most recent projected snapshot, if one has arrived.
    pub fn last_data(&self) -> Option<ViewData> {
        self.latest.borrow().clone()
    }

    /// Add a listener. If a snapshot has already arrived, the listener
    /// receives it immediately.
    pub fn listen(&self, id: SubscriberId, listener: SnapshotListener) {
        if matches!(*self.status.lock(), Status::Released) {
            return;
        }
        self.listeners.add(id, listener.clone());
        if let Some(data) = self.last_data() {
            // Skip if it unlistened during registration.
            if self.listeners.get(id).is_some() {
                crate::reactive::invoke_isolated(id, || listener(&data));
            }
        }
    }

    /// Remove a listener added with [`listen`](Self::listen).
    pub fn unlisten(&self, id: SubscriberId) {
        self.listeners.remove(id);
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Resolve with the first snapshot.
    ///
    /// Fails immediately for a pending handle.
    pub async fn wait_for_data(&self) -> Result<ViewData> {
        if let Some(error) = self.error() {
            return Err(error);
        }
        let mut rx = self.latest.subscribe();
        let data = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| RecordError::Transient("subscription closed before data arrived".into()))?;
        Option::clone(&data)
            .ok_or_else(|| RecordError::Unknown("subscription produced no data".into()))
    }

    pub(crate) fn deliver(&self, raw: &ViewData) {
        if !matches!(*self.status.lock(), Status::Live { .. }) {
            return;
        }
        let data = match &self.projection {
            Some(projection) => projection.apply(raw),
            None => raw.clone(),
        };
        trace!(fingerprint = %self.fingerprint, rows = data.len(), "snapshot");
        self.latest.send_replace(Some(data.clone()));
        self.listeners.notify_each(|listener| listener(&data));
    }

    pub(crate) fn retain(&self) -> usize {
        self.ref_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Decrement the ref count; returns the remaining count.
    pub(crate) fn release_ref(&self) -> usize {
        let previous = self
            .ref_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        previous.saturating_sub(1)
    }

    /// Unregister from the backend and destroy the view. Idempotent.
    pub(crate) fn teardown(&self) {
        let previous = std::mem::replace(&mut *self.status.lock(), Status::Released);
        self.listeners.clear();
        if let Status::Live { view, unlisten } = previous {
            if let Some(unlisten) = unlisten {
                unlisten.call();
            }
            view.destroy();
            debug!(fingerprint = %self.fingerprint, "view destroyed");
        }
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match &*self.status.lock() {
            Status::Pending(_) => "pending",
            Status::Live { .. } => "live",
            Status::Released => "released",
        };
        f.debug_struct("SubscriptionHandle")
            .field("fingerprint", &self.fingerprint)
            .field("ttl", &self.ttl)
            .field("ref_count", &self.ref_count())
            .field("status", &status)
            .finish()
    }
}
