//! Reactive Query Implementation
//!
//! A [`ReactiveQuery`] keeps a typed, always-current view of a query result.
//!
//! # How It Works
//!
//! 1. On creation the query-producing function is evaluated, the resulting
//!    descriptor is compiled, and a subscription handle is acquired from the
//!    client's [`SubscriptionManager`](crate::subscription::SubscriptionManager).
//!
//! 2. Each snapshot the handle delivers is decoded into `T` and written to
//!    the state; subscribers are then notified with the new state.
//!
//! 3. Failures never escape: they are classified and either retried on a
//!    backoff timer (transient errors, state stays loading) or written to
//!    `error`.
//!
//! 4. `reload()` bumps a generation counter, so callbacks belonging to the
//!    previous load are ignored. `destroy()` sets a flag that every callback
//!    checks first.
//!
//! # Example
//!
//! ```rust,ignore
//! let open = client.model::<Task>().where_eq("status", 1)?.observe();
//!
//! let _sub = open.subscribe(|tasks, meta| {
//!     if !meta.is_loading {
//!         println!("{} open tasks", meta.count);
//!     }
//! });
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use super::state::{Phase, QueryMeta, ReactiveState, Snapshot};
use super::subscriber::{invoke_isolated, SubscriberId, SubscriberList, Subscription};
use crate::backend::ViewData;
use crate::client::RecordClient;
use crate::error::{ErrorInfo, RecordError, Result};
use crate::model::Model;
use crate::query::{Fingerprint, QueryDescriptor};
use crate::retry::{RetryDecision, RetryTimer};
use crate::subscription::SubscriptionHandle;
use crate::ttl::Ttl;

/// Produces the descriptor to load. Re-evaluated on every retry and reload.
pub type QueryFn = Arc<dyn Fn() -> Result<QueryDescriptor> + Send + Sync>;

/// Subscriber callback: the current data and its metadata.
pub type SubscriberFn<T> = dyn Fn(Option<&T>, &QueryMeta) + Send + Sync;

/// Per-query settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryOptions {
    /// TTL for the backend view; the client default when `None`.
    pub ttl: Option<Ttl>,
    /// A missing record is a `NotFound` error rather than empty data.
    pub required: bool,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ttl(mut self, ttl: Ttl) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }
}

struct Link {
    handle: Arc<SubscriptionHandle>,
    listener: SubscriberId,
}

struct Inner<T: Snapshot> {
    client: RecordClient,
    query_fn: QueryFn,
    options: QueryOptions,
    state: RwLock<ReactiveState<T>>,
    subscribers: SubscriberList<SubscriberFn<T>>,
    link: Mutex<Option<Link>>,
    retry: RetryTimer,
    generation: AtomicU64,
    destroyed: AtomicBool,
}

/// A live query whose state follows the backend.
///
/// Cloning is cheap and yields another handle to the same query.
pub struct ReactiveQuery<T: Snapshot> {
    inner: Arc<Inner<T>>,
}

impl<T: Snapshot> Clone for ReactiveQuery<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Snapshot> ReactiveQuery<T> {
    /// Start loading `query_fn` immediately.
    pub fn new<F>(client: &RecordClient, query_fn: F, options: QueryOptions) -> Self
    where
        F: Fn() -> Result<QueryDescriptor> + Send + Sync + 'static,
    {
        let inner = Arc::new(Inner {
            client: client.clone(),
            query_fn: Arc::new(query_fn),
            options,
            state: RwLock::new(ReactiveState::default()),
            subscribers: SubscriberList::default(),
            link: Mutex::new(None),
            retry: RetryTimer::default(),
            generation: AtomicU64::new(0),
            destroyed: AtomicBool::new(false),
        });
        inner.attempt(0, 0);
        Self { inner }
    }

    /// The latest snapshot, or `None` while nothing has loaded.
    pub fn data(&self) -> Option<T> {
        self.inner.state.read().data.clone()
    }

    /// True from construction or `reload()` until the first snapshot or a final error.
    pub fn is_loading(&self) -> bool {
        self.inner.state.read().is_loading
    }

    /// The error that ended the current load, once retries are exhausted.
    pub fn error(&self) -> Option<ErrorInfo> {
        self.inner.state.read().error.clone()
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> Phase {
        self.inner.state.read().phase
    }

    /// Retries used by the current load.
    pub fn retry_count(&self) -> u32 {
        self.inner.state.read().retry_count
    }

    /// A copy of the full state.
    pub fn state(&self) -> ReactiveState<T> {
        self.inner.state.read().clone()
    }

    /// The metadata passed to subscribers.
    pub fn meta(&self) -> QueryMeta {
        self.inner.state.read().meta()
    }

    /// True for `Vec` queries, false for single-record ones.
    pub fn is_collection(&self) -> bool {
        T::COLLECTION
    }

    /// Number of records held; 0 or 1 for single-record queries.
    pub fn count(&self) -> usize {
        self.inner.state.read().count()
    }

    /// At least one record is loaded.
    pub fn is_present(&self) -> bool {
        self.count() > 0
    }

    pub fn is_blank(&self) -> bool {
        !self.is_present()
    }

    /// Whether `destroy()` has been called.
    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }

    /// Whether a retry timer is waiting to fire.
    pub fn has_pending_retry(&self) -> bool {
        self.inner.retry.is_pending()
    }

    /// Fingerprint of the query currently subscribed to.
    pub fn fingerprint(&self) -> Option<Fingerprint> {
        self.inner
            .link
            .lock()
            .as_ref()
            .map(|link| link.handle.fingerprint().clone())
    }

    /// The options this query was started with.
    pub fn options(&self) -> QueryOptions {
        self.inner.options
    }

    /// Drop the current subscription and load again from scratch.
    ///
    /// State is reset to loading (data and error cleared) before this
    /// returns.
    pub fn reload(&self) {
        self.inner.reload();
    }

    /// Release everything. Idempotent; the last data stays readable.
    pub fn destroy(&self) {
        self.inner.destroy();
    }

    /// Register `callback`. It runs immediately with the current state and
    /// again after every change, until the returned [`Subscription`] is
    /// dropped.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(Option<&T>, &QueryMeta) + Send + Sync + 'static,
    {
        let id = SubscriberId::new();
        if self.is_destroyed() {
            return Subscription::inert(id);
        }

        let callback: Arc<SubscriberFn<T>> = Arc::new(callback);
        self.inner.subscribers.add(id, callback.clone());

        let (data, meta) = self.inner.snapshot();
        invoke_isolated(id, || callback(data.as_ref(), &meta));

        let weak = Arc::downgrade(&self.inner);
        Subscription::new(id, move |id| {
            if let Some(inner) = weak.upgrade() {
                inner.subscribers.remove(id);
            }
        })
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }
}

impl<M: Model> ReactiveQuery<Option<M>> {
    /// The record, once loaded and present.
    pub fn record(&self) -> Option<M> {
        self.data().flatten()
    }
}

impl<M: Model> ReactiveQuery<Vec<M>> {
    /// The records, empty while loading.
    pub fn records(&self) -> Vec<M> {
        self.data().unwrap_or_default()
    }
}

impl<T: Snapshot> fmt::Debug for ReactiveQuery<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.read();
        f.debug_struct("ReactiveQuery")
            .field("phase", &state.phase)
            .field("is_loading", &state.is_loading)
            .field("count", &state.count())
            .field("error", &state.error)
            .finish()
    }
}

impl<T: Snapshot> Inner<T> {
    fn is_current(&self, generation: u64) -> bool {
        !self.destroyed.load(Ordering::SeqCst) && self.generation.load(Ordering::SeqCst) == generation
    }

    fn snapshot(&self) -> (Option<T>, QueryMeta) {
        let state = self.state.read();
        (state.data.clone(), state.meta())
    }

    fn attempt(self: &Arc<Self>, generation: u64, attempt: u32) {
        if !self.is_current(generation) {
            return;
        }
        {
            let mut state = self.state.write();
            state.phase = Phase::Loading;
            state.is_loading = true;
            state.retry_count = attempt;
        }

        let descriptor = match (self.query_fn)() {
            Ok(descriptor) => descriptor,
            Err(error) => return self.fail(generation, attempt, error),
        };
        let compiled = match self.client.compiler().compile(&descriptor) {
            Ok(compiled) => compiled,
            Err(error) => return self.fail(generation, attempt, error),
        };

        let ttl = self.options.ttl.unwrap_or(self.client.config().default_ttl);
        let subscriptions = self.client.subscriptions();
        let handle = subscriptions.acquire(descriptor.fingerprint(), compiled, ttl);
        if let Some(error) = handle.error() {
            subscriptions.release(&handle);
            return self.fail(generation, attempt, error);
        }

        let listener = SubscriberId::new();
        let previous = self.link.lock().replace(Link {
            handle: handle.clone(),
            listener,
        });
        if let Some(previous) = previous {
            self.release_link(previous);
        }

        let not_found = self.options.required.then(|| descriptor.not_found());
        let weak = Arc::downgrade(self);
        handle.listen(
            listener,
            Arc::new(move |data: &ViewData| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_snapshot(generation, data, not_found.as_ref());
                }
            }),
        );
    }

    fn on_snapshot(&self, generation: u64, data: &ViewData, not_found: Option<&RecordError>) {
        if !self.is_current(generation) {
            return;
        }
        {
            let mut state = self.state.write();
            let retries = state.retry_count;
            match T::from_view(data) {
                Ok(snapshot) => match not_found {
                    Some(error) if snapshot.count() == 0 => {
                        state.data = None;
                        state.failed(ErrorInfo::new(error.clone(), retries));
                    }
                    _ => state.ready(Some(snapshot)),
                },
                Err(error) => {
                    warn!(error = %error, "could not decode snapshot");
                    state.failed(ErrorInfo::new(error, retries));
                }
            }
        }
        self.notify();
    }

    fn fail(self: &Arc<Self>, generation: u64, attempt: u32, error: RecordError) {
        if !self.is_current(generation) {
            return;
        }

        if let RetryDecision::Retry { delay } = self.client.config().retry.decide(&error, attempt) {
            let weak = Arc::downgrade(self);
            let scheduled = self.retry.schedule(delay, move || {
                if let Some(inner) = weak.upgrade() {
                    inner.attempt(generation, attempt + 1);
                }
            });
            if scheduled {
                debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "retrying query"
                );
                return;
            }
            warn!(error = %error, "no async runtime to retry on");
        }

        warn!(attempt, kind = %error.kind(), error = %error, "query failed");
        self.state.write().failed(ErrorInfo::new(error, attempt));
        self.notify();
    }

    fn notify(&self) {
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }
        let (data, meta) = self.snapshot();
        self.subscribers.notify_each(|callback| {
            if !self.destroyed.load(Ordering::SeqCst) {
                callback(data.as_ref(), &meta);
            }
        });
    }

    fn release_link(&self, link: Link) {
        link.handle.unlisten(link.listener);
        self.client.subscriptions().release(&link.handle);
    }

    fn detach(&self) {
        let link = self.link.lock().take();
        if let Some(link) = link {
            self.release_link(link);
        }
    }

    fn reload(self: &Arc<Self>) {
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.retry.cancel();
        self.detach();
        self.state.write().reset_loading();
        self.notify();
        self.attempt(generation, 0);
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.retry.cancel();
        self.detach();
        {
            let mut state = self.state.write();
            state.phase = Phase::Destroyed;
            state.is_loading = false;
        }
        self.subscribers.clear();
        debug!("reactive query destroyed");
    }
}

impl<T: Snapshot> Drop for Inner<T> {
    fn drop(&mut self) {
        if !self.destroyed.load(Ordering::SeqCst) {
            self.retry.cancel();
            self.detach();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::{Delivery, MemoryBackend};
    use crate::config::EngineConfig;
    use crate::error::ErrorKind;
    use crate::retry::RetryPolicy;
    use crate::schema::TableSchema;
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Task {
        id: String,
        title: String,
        status: i64,
    }

    impl Model for Task {
        const SCHEMA: &'static TableSchema =
            &TableSchema::new("tasks", &["id", "title", "status"]);
    }

    fn client(delivery: Delivery) -> (MemoryBackend, RecordClient) {
        let backend = MemoryBackend::with_delivery(delivery);
        backend.seed(
            Task::SCHEMA,
            [
                json!({"id": "t1", "title": "Frame", "status": 1}),
                json!({"id": "t2", "title": "Roof", "status": 2}),
            ],
        );
        let client = RecordClient::new(Arc::new(backend.clone()));
        (backend, client)
    }

    fn open_tasks(client: &RecordClient) -> ReactiveQuery<Vec<Task>> {
        ReactiveQuery::new(
            client,
            || QueryDescriptor::new(Task::SCHEMA).where_eq("status", 1),
            QueryOptions::new(),
        )
    }

    #[test]
    fn starts_loading_then_becomes_ready() {
        let (backend, client) = client(Delivery::Deferred);
        let query = open_tasks(&client);

        assert!(query.is_loading());
        assert!(query.data().is_none());
        assert_eq!(query.phase(), Phase::Loading);

        backend.flush();
        assert!(!query.is_loading());
        assert_eq!(query.records().len(), 1);
        assert_eq!(query.phase(), Phase::Ready);
        assert!(query.is_present());
    }

    #[test]
    fn subscribers_see_current_state_then_changes() {
        let (backend, client) = client(Delivery::Immediate);
        let query = open_tasks(&client);

        let counts = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let counts_clone = counts.clone();
        let _sub = query.subscribe(move |_, meta| counts_clone.lock().push(meta.count));

        backend.seed(Task::SCHEMA, [json!({"id": "t3", "title": "Paint", "status": 1})]);
        assert_eq!(*counts.lock(), vec![1, 2]);
    }

    #[test]
    fn dropped_subscription_stops_notifications() {
        let (backend, client) = client(Delivery::Immediate);
        let query = open_tasks(&client);

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let sub = query.subscribe(move |_, _| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });
        drop(sub);
        assert_eq!(query.subscriber_count(), 0);

        backend.seed(Task::SCHEMA, [json!({"id": "t3", "title": "Paint", "status": 1})]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn required_single_reports_not_found() {
        let (backend, client) = client(Delivery::Immediate);
        let query: ReactiveQuery<Option<Task>> = ReactiveQuery::new(
            &client,
            || {
                Ok(QueryDescriptor::new(Task::SCHEMA)
                    .where_eq("id", "t9")?
                    .one())
            },
            QueryOptions::new().required(true),
        );

        let error = query.error().expect("missing record is an error");
        assert_eq!(error.kind, ErrorKind::NotFound);
        assert!(!error.retryable);
        assert!(query.data().is_none());

        // The row showing up later clears the error.
        backend.seed(Task::SCHEMA, [json!({"id": "t9", "title": "Late", "status": 1})]);
        assert!(query.error().is_none());
        assert_eq!(query.record().map(|t| t.title), Some("Late".to_string()));
    }

    #[test]
    fn optional_single_is_none_without_error() {
        let (_backend, client) = client(Delivery::Immediate);
        let query: ReactiveQuery<Option<Task>> = ReactiveQuery::new(
            &client,
            || Ok(QueryDescriptor::new(Task::SCHEMA).where_eq("id", "t9")?.one()),
            QueryOptions::new(),
        );
        assert!(query.error().is_none());
        assert_eq!(query.data(), Some(None));
        assert!(query.is_blank());
    }

    #[test]
    fn invalid_query_is_not_retried() {
        let (_backend, client) = client(Delivery::Immediate);
        let evaluations = Arc::new(AtomicUsize::new(0));
        let evaluations_clone = evaluations.clone();
        let query: ReactiveQuery<Vec<Task>> = ReactiveQuery::new(
            &client,
            move || {
                evaluations_clone.fetch_add(1, Ordering::SeqCst);
                QueryDescriptor::new(Task::SCHEMA).where_eq("colour", "red")
            },
            QueryOptions::new(),
        );

        assert_eq!(query.error().map(|e| e.kind), Some(ErrorKind::Invalid));
        assert!(!query.is_loading());
        assert!(!query.has_pending_retry());
        assert_eq!(evaluations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_retry_until_success() {
        let (backend, client) = client(Delivery::Immediate);
        backend.fail_next_materializations(2);
        let query = open_tasks(&client);

        assert!(query.is_loading());
        assert!(query.error().is_none());
        assert!(query.has_pending_retry());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!query.is_loading());
        assert_eq!(query.records().len(), 1);
        assert_eq!(query.retry_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn reload_resets_and_resubscribes() {
        let (backend, client) = client(Delivery::Deferred);
        let query = open_tasks(&client);
        backend.flush();
        assert_eq!(query.records().len(), 1);

        query.reload();
        assert!(query.is_loading());
        assert!(query.data().is_none());
        assert_eq!(backend.stats().materialized, 2);

        backend.flush();
        assert_eq!(query.records().len(), 1);
    }

    #[test]
    fn destroy_is_idempotent_and_freezes_state() {
        let client_config = EngineConfig {
            retry: RetryPolicy::never(),
            ..EngineConfig::default()
        };
        let backend = MemoryBackend::new();
        backend.seed(Task::SCHEMA, [json!({"id": "t1", "title": "Frame", "status": 1})]);
        let client = RecordClient::with_config(Arc::new(backend.clone()), client_config);
        let query = open_tasks(&client);

        query.destroy();
        query.destroy();
        assert!(query.is_destroyed());
        assert_eq!(query.phase(), Phase::Destroyed);
        assert!(!query.is_loading());
        assert_eq!(query.records().len(), 1);
        assert_eq!(backend.stats().destroyed, 1);

        backend.seed(Task::SCHEMA, [json!({"id": "t2", "title": "Roof", "status": 1})]);
        assert_eq!(query.records().len(), 1);

        let sub = query.subscribe(|_, _| panic!("destroyed queries never call back"));
        drop(sub);
    }

    #[test]
    fn destroy_from_a_subscriber_silences_the_rest() {
        let (backend, client) = client(Delivery::Immediate);
        let query = open_tasks(&client);

        let target = query.clone();
        let _destroyer = query.subscribe(move |_, meta| {
            if meta.count == 2 {
                target.destroy();
            }
        });
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let _counter = query.subscribe(move |_, _| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        backend.seed(Task::SCHEMA, [json!({"id": "t3", "title": "Paint", "status": 1})]);
        assert!(query.is_destroyed());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn destroy_cancels_a_pending_retry() {
        let (backend, client) = client(Delivery::Immediate);
        backend.set_offline(true);
        let evaluations = Arc::new(AtomicUsize::new(0));
        let evaluations_clone = evaluations.clone();
        let query: ReactiveQuery<Vec<Task>> = ReactiveQuery::new(
            &client,
            move || {
                evaluations_clone.fetch_add(1, Ordering::SeqCst);
                Ok(QueryDescriptor::new(Task::SCHEMA))
            },
            QueryOptions::new(),
        );
        assert!(query.has_pending_retry());

        query.destroy();
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(evaluations.load(Ordering::SeqCst), 1);
        assert!(!query.has_pending_retry());
        assert!(query.error().is_none());
    }

    #[test]
    fn dropping_the_last_clone_releases_the_view() {
        let (backend, client) = client(Delivery::Immediate);
        let query = open_tasks(&client);
        let other = query.clone();
        drop(query);
        assert_eq!(backend.stats().destroyed, 0);
        drop(other);
        assert_eq!(backend.stats().destroyed, 1);
        assert!(client.subscriptions().is_empty());
    }
}
