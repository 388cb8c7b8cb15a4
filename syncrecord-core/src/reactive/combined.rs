//! Query Coordination
//!
//! A [`QueryCoordinator`] owns a set of named reactive queries. Dashboards
//! register each query once, with its own TTL and a `required` flag, and
//! then build [`CombinedQuery`] views over any subset of names.
//!
//! # How Combined Queries Work
//!
//! A combined query is a cached derived value over its members:
//!
//! 1. On first access it computes a [`CombinedSnapshot`] from the members
//!    and caches it.
//!
//! 2. When any member changes, the cache is marked dirty and the combined
//!    subscribers are notified.
//!
//! 3. The next access recomputes.
//!
//! `is_loading` is the OR over **required** members only; members
//! registered with `required: false` are preloads and report through
//! `is_preloading` instead.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::{debug, warn};

use super::query::{QueryOptions, ReactiveQuery};
use super::state::Snapshot;
use super::subscriber::{invoke_isolated, SubscriberId, SubscriberList, Subscription};
use crate::client::RecordClient;
use crate::error::{ErrorInfo, RecordError, Result};
use crate::query::QueryDescriptor;

/// Type-erased view of a registered query.
trait ErasedQuery: Send + Sync {
    fn is_loading(&self) -> bool;
    fn data_json(&self) -> Option<Value>;
    fn error(&self) -> Option<ErrorInfo>;
    fn on_change(&self, callback: Arc<dyn Fn() + Send + Sync>) -> Subscription;
    fn destroy(&self);
}

impl<T: Snapshot> ErasedQuery for ReactiveQuery<T> {
    fn is_loading(&self) -> bool {
        ReactiveQuery::is_loading(self)
    }

    fn data_json(&self) -> Option<Value> {
        let data = self.data()?;
        match serde_json::to_value(&data) {
            Ok(value) => Some(value),
            Err(error) => {
                warn!(%error, "could not serialize query data");
                None
            }
        }
    }

    fn error(&self) -> Option<ErrorInfo> {
        ReactiveQuery::error(self)
    }

    fn on_change(&self, callback: Arc<dyn Fn() + Send + Sync>) -> Subscription {
        self.subscribe(move |_, _| callback())
    }

    fn destroy(&self) {
        ReactiveQuery::destroy(self)
    }
}

#[derive(Clone)]
struct Member {
    query: Arc<dyn ErasedQuery>,
    required: bool,
}

/// Registry of named reactive queries.
#[derive(Clone)]
pub struct QueryCoordinator {
    client: RecordClient,
    members: Arc<RwLock<IndexMap<String, Member>>>,
    views: Arc<Mutex<Vec<Weak<CombinedInner>>>>,
}

impl QueryCoordinator {
    pub fn new(client: &RecordClient) -> Self {
        Self {
            client: client.clone(),
            members: Arc::new(RwLock::new(IndexMap::new())),
            views: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Start `query_fn` as a reactive query under `name`.
    ///
    /// Re-registering a name destroys the query previously registered under
    /// it. Combined queries over that name switch to the new query.
    pub fn register_query<T, F>(&self, name: &str, query_fn: F, options: QueryOptions) -> ReactiveQuery<T>
    where
        T: Snapshot,
        F: Fn() -> Result<QueryDescriptor> + Send + Sync + 'static,
    {
        let query = ReactiveQuery::<T>::new(&self.client, query_fn, options);
        let member = Member {
            query: Arc::new(query.clone()),
            required: options.required,
        };
        let replaced = self.members.write().insert(name.to_string(), member.clone());
        if let Some(replaced) = replaced {
            debug!(name, "replacing registered query");
            replaced.query.destroy();
            for view in self.live_views() {
                view.swap_member(name, Some(member.clone()));
            }
        }
        query
    }

    /// Destroy and forget the query registered under `name`. Combined
    /// queries drop it from their members.
    pub fn unregister(&self, name: &str) -> bool {
        let removed = self.members.write().shift_remove(name);
        match removed {
            Some(member) => {
                member.query.destroy();
                for view in self.live_views() {
                    view.swap_member(name, None);
                }
                true
            }
            None => false,
        }
    }

    /// Registered names, in registration order.
    pub fn names(&self) -> Vec<String> {
        self.members.read().keys().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.members.read().contains_key(name)
    }

    /// A read-only combined view over `names`, in the given order.
    pub fn create_combined_query(&self, names: &[&str]) -> Result<CombinedQuery> {
        let registered = self.members.read();
        let mut members = IndexMap::with_capacity(names.len());
        for name in names {
            let member = registered.get(*name).ok_or_else(|| {
                RecordError::invalid_query(format!("no query registered as {name:?}"))
            })?;
            members.insert(name.to_string(), member.clone());
        }
        drop(registered);

        let combined = CombinedQuery::new(members);
        let mut views = self.views.lock();
        views.retain(|view| view.strong_count() > 0);
        views.push(Arc::downgrade(&combined.inner));
        Ok(combined)
    }

    /// Destroy every registered query.
    pub fn destroy(&self) {
        let members: Vec<Member> = self.members.write().drain(..).map(|(_, m)| m).collect();
        for member in members {
            member.query.destroy();
        }
    }

    fn live_views(&self) -> Vec<Arc<CombinedInner>> {
        let mut views = self.views.lock();
        views.retain(|view| view.strong_count() > 0);
        views.iter().filter_map(Weak::upgrade).collect()
    }
}

/// Merged state of a combined query.
#[derive(Debug, Clone, PartialEq)]
pub struct CombinedSnapshot {
    /// Any required member still loading.
    pub is_loading: bool,
    /// Any optional member still loading.
    pub is_preloading: bool,
    pub data: IndexMap<String, Option<Value>>,
    pub errors: IndexMap<String, ErrorInfo>,
}

type CombinedFn = dyn Fn(&CombinedSnapshot) + Send + Sync;

struct CombinedInner {
    members: RwLock<IndexMap<String, Member>>,
    cached: Mutex<Option<CombinedSnapshot>>,
    subscribers: SubscriberList<CombinedFn>,
    member_subscriptions: Mutex<IndexMap<String, Subscription>>,
    destroyed: AtomicBool,
}

impl CombinedInner {
    fn compute(&self) -> CombinedSnapshot {
        let members = self.members.read().clone();
        let mut snapshot = CombinedSnapshot {
            is_loading: false,
            is_preloading: false,
            data: IndexMap::with_capacity(members.len()),
            errors: IndexMap::new(),
        };
        for (name, member) in members {
            let loading = member.query.is_loading();
            if member.required {
                snapshot.is_loading |= loading;
            } else {
                snapshot.is_preloading |= loading;
            }
            snapshot.data.insert(name.clone(), member.query.data_json());
            if let Some(error) = member.query.error() {
                snapshot.errors.insert(name, error);
            }
        }
        snapshot
    }

    fn snapshot(&self) -> CombinedSnapshot {
        let mut cached = self.cached.lock();
        if let Some(snapshot) = cached.as_ref() {
            return snapshot.clone();
        }
        let snapshot = self.compute();
        *cached = Some(snapshot.clone());
        snapshot
    }

    fn member_changed(&self) {
        *self.cached.lock() = None;
        if self.destroyed.load(Ordering::SeqCst) || self.subscribers.len() == 0 {
            return;
        }
        let snapshot = self.snapshot();
        self.subscribers.notify_each(|callback| callback(&snapshot));
    }

    fn follow(self: &Arc<Self>, member: &Member) -> Subscription {
        let weak: Weak<CombinedInner> = Arc::downgrade(self);
        member.query.on_change(Arc::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.member_changed();
            }
        }))
    }

    /// Point `name` at `member`, or drop it when `member` is `None`. Names
    /// this view does not cover are ignored.
    fn swap_member(self: &Arc<Self>, name: &str, member: Option<Member>) {
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }
        {
            let mut members = self.members.write();
            if !members.contains_key(name) {
                return;
            }
            match &member {
                Some(member) => {
                    members.insert(name.to_string(), member.clone());
                }
                None => {
                    members.shift_remove(name);
                }
            }
        }

        let previous = match member {
            Some(member) => {
                let subscription = self.follow(&member);
                self.member_subscriptions
                    .lock()
                    .insert(name.to_string(), subscription)
            }
            None => self.member_subscriptions.lock().shift_remove(name),
        };
        drop(previous);
        self.member_changed();
    }
}

/// Read-only merged view over several registered queries.
#[derive(Clone)]
pub struct CombinedQuery {
    inner: Arc<CombinedInner>,
}

impl CombinedQuery {
    fn new(members: IndexMap<String, Member>) -> Self {
        let inner = Arc::new(CombinedInner {
            members: RwLock::new(members.clone()),
            cached: Mutex::new(None),
            subscribers: SubscriberList::default(),
            member_subscriptions: Mutex::new(IndexMap::new()),
            destroyed: AtomicBool::new(false),
        });

        let subscriptions: IndexMap<String, Subscription> = members
            .iter()
            .map(|(name, member)| (name.clone(), inner.follow(member)))
            .collect();
        *inner.member_subscriptions.lock() = subscriptions;

        Self { inner }
    }

    /// Member names, in the order given at creation.
    pub fn names(&self) -> Vec<String> {
        self.inner.members.read().keys().cloned().collect()
    }

    pub fn snapshot(&self) -> CombinedSnapshot {
        self.inner.snapshot()
    }

    /// True while any required member is loading.
    pub fn is_loading(&self) -> bool {
        self.snapshot().is_loading
    }

    /// True while any optional member is loading.
    pub fn is_preloading(&self) -> bool {
        self.snapshot().is_preloading
    }

    /// `{name: data}` in member order; `None` for members without data yet.
    pub fn data(&self) -> IndexMap<String, Option<Value>> {
        self.snapshot().data
    }

    /// Final errors of the members that have one.
    pub fn errors(&self) -> IndexMap<String, ErrorInfo> {
        self.snapshot().errors
    }

    /// Called immediately with the merged state, then after every member
    /// change.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&CombinedSnapshot) + Send + Sync + 'static,
    {
        let id = SubscriberId::new();
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return Subscription::inert(id);
        }
        let callback: Arc<CombinedFn> = Arc::new(callback);
        self.inner.subscribers.add(id, callback.clone());
        let snapshot = self.snapshot();
        invoke_isolated(id, || callback(&snapshot));

        let weak = Arc::downgrade(&self.inner);
        Subscription::new(id, move |id| {
            if let Some(inner) = weak.upgrade() {
                inner.subscribers.remove(id);
            }
        })
    }

    /// Stop following the members. The members themselves stay registered.
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        let subscriptions = std::mem::take(&mut *self.inner.member_subscriptions.lock());
        drop(subscriptions);
        self.inner.subscribers.clear();
    }
}

impl std::fmt::Debug for CombinedQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CombinedQuery")
            .field("members", &self.names())
            .finish()
    }
}
