//! In-memory sync backend.
//!
//! [`MemoryBackend`] keeps tables in process memory and maintains every
//! materialized view incrementally: after each mutation it re-evaluates the
//! live views and pushes a new snapshot to listeners of every view whose
//! result changed.
//!
//! Two delivery modes are supported:
//!
//! - [`Delivery::Immediate`]: snapshots are pushed synchronously, including
//!   the initial snapshot from inside `add_listener`.
//! - [`Delivery::Deferred`]: snapshots are queued and delivered, in order,
//!   by [`MemoryBackend::flush`]. Queued pushes keep their listener, so a
//!   flush after a view was destroyed behaves like a late network delivery.
//!
//! The backend also counts materializations and supports failure injection,
//! which makes it the workhorse of the engine's own tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, trace};

use super::{BackendError, BackendQuery, SyncBackend, Unlisten, View, ViewData, ViewListener};
use crate::error::ValidationErrors;
use crate::query::{Direction, Operator};
use crate::schema::{AssociationKind, TableSchema};
use crate::ttl::Ttl;
use crate::value::{compare_json, ConditionValue, Record, Scalar};

/// How snapshots reach listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Delivery {
    #[default]
    Immediate,
    Deferred,
}

/// Counters describing backend activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    /// Successful `materialize` calls.
    pub materialized: usize,
    /// Views destroyed through `View::destroy`.
    pub destroyed: usize,
    /// Views materialized and not yet destroyed.
    pub live_views: usize,
    pub inserts: usize,
    pub updates: usize,
}

#[derive(Default)]
struct Table {
    schema: Option<&'static TableSchema>,
    rows: IndexMap<String, Record>,
}

#[derive(Default)]
struct Store {
    tables: HashMap<&'static str, Table>,
    views: Vec<Weak<MemoryView>>,
    pending: VecDeque<(ViewListener, ViewData)>,
    failing_materializations: u32,
    offline: bool,
    stats: MemoryStats,
}

struct Shared {
    store: Mutex<Store>,
    delivery: Delivery,
    next_view_id: AtomicU64,
}

/// An in-process sync backend.
#[derive(Clone)]
pub struct MemoryBackend {
    shared: Arc<Shared>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// An empty backend that delivers pushes immediately.
    pub fn new() -> Self {
        Self::with_delivery(Delivery::Immediate)
    }

    pub fn with_delivery(delivery: Delivery) -> Self {
        Self {
            shared: Arc::new(Shared {
                store: Mutex::new(Store::default()),
                delivery,
                next_view_id: AtomicU64::new(1),
            }),
        }
    }

    /// Insert rows directly, bypassing mutation validation and counters.
    pub fn seed(&self, table: &'static TableSchema, rows: impl IntoIterator<Item = Value>) {
        let deliveries = {
            let mut store = self.shared.store.lock();
            let entry = store.table_mut(table);
            for row in rows {
                if let Value::Object(record) = row {
                    if let Some(key) = record.get(table.primary_key).and_then(row_key) {
                        entry.rows.insert(key, record);
                    }
                }
            }
            store.refresh_views()
        };
        self.deliver(deliveries);
    }

    /// Delete a row, as if removed by another client.
    pub fn remove(&self, table: &'static TableSchema, id: &str) -> bool {
        let (removed, deliveries) = {
            let mut store = self.shared.store.lock();
            let removed = store.table_mut(table).rows.shift_remove(id).is_some();
            (removed, store.refresh_views())
        };
        self.deliver(deliveries);
        removed
    }

    /// Rows currently stored for `table`.
    pub fn rows(&self, table: &'static TableSchema) -> Vec<Record> {
        let store = self.shared.store.lock();
        store
            .tables
            .get(table.name)
            .map(|t| t.rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Make the next `n` materializations fail with `Unavailable`.
    pub fn fail_next_materializations(&self, n: u32) {
        self.shared.store.lock().failing_materializations = n;
    }

    /// While offline every query, materialization and mutation fails with
    /// `Unavailable`.
    pub fn set_offline(&self, offline: bool) {
        self.shared.store.lock().offline = offline;
    }

    /// View and mutation counters since creation.
    pub fn stats(&self) -> MemoryStats {
        let store = self.shared.store.lock();
        let mut stats = store.stats;
        stats.live_views = store
            .views
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|v| !v.destroyed.load(Ordering::SeqCst))
            .count();
        stats
    }

    /// Number of queued snapshots in deferred mode.
    pub fn pending_pushes(&self) -> usize {
        self.shared.store.lock().pending.len()
    }

    /// Deliver every queued snapshot, in order. Returns how many were sent.
    pub fn flush(&self) -> usize {
        let mut sent = 0;
        loop {
            // Deliveries may enqueue more pushes; take one at a time.
            let next = self.shared.store.lock().pending.pop_front();
            match next {
                Some((listener, data)) => {
                    listener(&data);
                    sent += 1;
                }
                None => return sent,
            }
        }
    }

    fn deliver(&self, deliveries: Vec<(ViewListener, ViewData)>) {
        if deliveries.is_empty() {
            return;
        }
        match self.shared.delivery {
            Delivery::Immediate => {
                for (listener, data) in deliveries {
                    listener(&data);
                }
            }
            Delivery::Deferred => {
                self.shared.store.lock().pending.extend(deliveries);
            }
        }
    }

    fn check_online(&self) -> Result<(), BackendError> {
        if self.shared.store.lock().offline {
            Err(BackendError::Unavailable("memory backend is offline".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SyncBackend for MemoryBackend {
    fn query(&self, table: &'static TableSchema) -> Result<Box<dyn BackendQuery>, BackendError> {
        self.check_online()?;
        Ok(Box::new(MemoryQuery {
            backend: self.clone(),
            spec: ViewSpec::new(table),
        }))
    }

    async fn insert(&self, table: &'static TableSchema, record: Record) -> Result<(), BackendError> {
        self.check_online()?;
        let deliveries = {
            let mut store = self.shared.store.lock();
            let key = record
                .get(table.primary_key)
                .and_then(row_key)
                .ok_or_else(|| {
                    BackendError::Rejected(
                        ValidationErrors::new().with(table.primary_key, "can't be blank"),
                    )
                })?;
            let entry = store.table_mut(table);
            if entry.rows.contains_key(&key) {
                return Err(BackendError::Rejected(
                    ValidationErrors::new().with(table.primary_key, "has already been taken"),
                ));
            }
            entry.rows.insert(key, record);
            store.stats.inserts += 1;
            store.refresh_views()
        };
        self.deliver(deliveries);
        Ok(())
    }

    async fn update(&self, table: &'static TableSchema, record: Record) -> Result<(), BackendError> {
        self.check_online()?;
        let deliveries = {
            let mut store = self.shared.store.lock();
            let key = record
                .get(table.primary_key)
                .and_then(row_key)
                .ok_or_else(|| {
                    BackendError::Rejected(
                        ValidationErrors::new().with(table.primary_key, "can't be blank"),
                    )
                })?;
            let existing = store
                .table_mut(table)
                .rows
                .get_mut(&key)
                .ok_or_else(|| BackendError::NotFound {
                    table: table.name,
                    id: key.clone(),
                })?;
            for (field, value) in record {
                existing.insert(field, value);
            }
            store.stats.updates += 1;
            store.refresh_views()
        };
        self.deliver(deliveries);
        Ok(())
    }
}

fn row_key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl Store {
    fn table_mut(&mut self, schema: &'static TableSchema) -> &mut Table {
        let table = self.tables.entry(schema.name).or_default();
        table.schema.get_or_insert(schema);
        table
    }

    /// Re-evaluate live views; returns the pushes for views that changed.
    fn refresh_views(&mut self) -> Vec<(ViewListener, ViewData)> {
        self.views.retain(|weak| {
            weak.upgrade()
                .map(|v| !v.destroyed.load(Ordering::SeqCst))
                .unwrap_or(false)
        });

        let mut deliveries = Vec::new();
        for view in self.views.iter().filter_map(Weak::upgrade) {
            let data = view.spec.evaluate(self);
            let mut last = view.last.lock();
            if *last == data {
                continue;
            }
            *last = data.clone();
            drop(last);

            trace!(view = view.id, rows = data.len(), "view changed");
            for listener in view.listeners.lock().iter().map(|(_, l)| l.clone()) {
                deliveries.push((listener, data.clone()));
            }
        }
        deliveries
    }
}

#[derive(Clone)]
struct ViewSpec {
    table: &'static TableSchema,
    filters: Vec<(String, Operator, ConditionValue)>,
    related: Vec<String>,
    order: Vec<(String, Direction)>,
    limit: Option<u64>,
    offset: Option<u64>,
    one: bool,
}

impl ViewSpec {
    fn new(table: &'static TableSchema) -> Self {
        Self {
            table,
            filters: Vec::new(),
            related: Vec::new(),
            order: Vec::new(),
            limit: None,
            offset: None,
            one: false,
        }
    }

    fn evaluate(&self, store: &Store) -> ViewData {
        let Some(table) = store.tables.get(self.table.name) else {
            return ViewData::empty(self.one);
        };

        let mut rows: Vec<&Record> = table
            .rows
            .values()
            .filter(|row| {
                self.filters
                    .iter()
                    .all(|(field, op, value)| matches(row, field, *op, value))
            })
            .collect();

        if !self.order.is_empty() {
            rows.sort_by(|a, b| {
                self.order
                    .iter()
                    .map(|(field, direction)| {
                        let ord = compare_json(
                            a.get(field).unwrap_or(&Value::Null),
                            b.get(field).unwrap_or(&Value::Null),
                        );
                        match direction {
                            Direction::Asc => ord,
                            Direction::Desc => ord.reverse(),
                        }
                    })
                    .find(|ord| ord.is_ne())
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        }

        let skip = self.offset.unwrap_or(0) as usize;
        let take = if self.one {
            1
        } else {
            self.limit.map(|n| n as usize).unwrap_or(usize::MAX)
        };

        let records: Vec<Record> = rows
            .into_iter()
            .skip(skip)
            .take(take)
            .map(|row| self.with_related(row.clone(), store))
            .collect();

        if self.one {
            ViewData::One(records.into_iter().next())
        } else {
            ViewData::Many(records)
        }
    }

    fn with_related(&self, mut record: Record, store: &Store) -> Record {
        for name in &self.related {
            let Some(association) = self.table.association(name) else {
                continue;
            };
            let target = store.tables.get(association.target);
            let target_pk = target
                .and_then(|t| t.schema)
                .map(|s| s.primary_key)
                .unwrap_or("id");
            let target_rows = target.map(|t| t.rows.values()).into_iter().flatten();

            let value = match association.kind {
                AssociationKind::BelongsTo => {
                    let fk = record.get(association.foreign_key).cloned().unwrap_or(Value::Null);
                    target_rows
                        .filter(|_| !fk.is_null())
                        .find(|row| row.get(target_pk) == Some(&fk))
                        .map(|row| Value::Object(row.clone()))
                        .unwrap_or(Value::Null)
                }
                AssociationKind::HasMany => {
                    let pk = record.get(self.table.primary_key).cloned().unwrap_or(Value::Null);
                    Value::Array(
                        target_rows
                            .filter(|row| !pk.is_null() && row.get(association.foreign_key) == Some(&pk))
                            .map(|row| Value::Object(row.clone()))
                            .collect(),
                    )
                }
            };
            record.insert(association.name.to_string(), value);
        }
        record
    }
}

fn matches(row: &Record, field: &str, op: Operator, value: &ConditionValue) -> bool {
    let actual = row.get(field).unwrap_or(&Value::Null);
    let compare = |scalar: &Scalar| compare_json(actual, &scalar.to_json());
    let same_kind = |scalar: &Scalar| {
        matches!(
            (actual, scalar),
            (Value::Bool(_), Scalar::Bool(_))
                | (Value::Number(_), Scalar::Int(_) | Scalar::Float(_))
                | (Value::String(_), Scalar::Text(_))
        )
    };
    let equals = |scalar: &Scalar| same_kind(scalar) && compare(scalar).is_eq();

    match (op, value) {
        (Operator::IsNull, _) => actual.is_null(),
        (Operator::IsNotNull, _) => !actual.is_null(),
        (Operator::In, ConditionValue::Many(items)) => items.iter().any(equals),
        (Operator::NotIn, ConditionValue::Many(items)) => {
            !actual.is_null() && !items.iter().any(equals)
        }
        (Operator::Eq, ConditionValue::One(s)) => equals(s),
        (Operator::Ne, ConditionValue::One(s)) => !actual.is_null() && !equals(s),
        (Operator::Lt, ConditionValue::One(s)) => same_kind(s) && compare(s).is_lt(),
        (Operator::Lte, ConditionValue::One(s)) => same_kind(s) && compare(s).is_le(),
        (Operator::Gt, ConditionValue::One(s)) => same_kind(s) && compare(s).is_gt(),
        (Operator::Gte, ConditionValue::One(s)) => same_kind(s) && compare(s).is_ge(),
        (Operator::Like, ConditionValue::One(Scalar::Text(pattern))) => actual
            .as_str()
            .map(|s| like(s, pattern))
            .unwrap_or(false),
        (Operator::ILike, ConditionValue::One(Scalar::Text(pattern))) => actual
            .as_str()
            .map(|s| like(&s.to_lowercase(), &pattern.to_lowercase()))
            .unwrap_or(false),
        _ => false,
    }
}

/// SQL `LIKE` matching: `%` matches any run of characters, `_` exactly one.
fn like(text: &str, pattern: &str) -> bool {
    let text: Vec<char> = text.chars().collect();
    let pattern: Vec<char> = pattern.chars().collect();

    // Classic wildcard DP over (text position, pattern position).
    let mut reachable = vec![false; text.len() + 1];
    reachable[0] = true;
    for p in &pattern {
        let mut next = vec![false; text.len() + 1];
        match p {
            '%' => {
                let mut any = false;
                for i in 0..=text.len() {
                    any |= reachable[i];
                    next[i] = any;
                }
            }
            _ => {
                for i in 0..text.len() {
                    if reachable[i] && (*p == '_' || *p == text[i]) {
                        next[i + 1] = true;
                    }
                }
            }
        }
        reachable = next;
    }
    reachable[text.len()]
}

struct MemoryQuery {
    backend: MemoryBackend,
    spec: ViewSpec,
}

impl BackendQuery for MemoryQuery {
    fn where_(
        mut self: Box<Self>,
        field: &str,
        op: Operator,
        value: &ConditionValue,
    ) -> Box<dyn BackendQuery> {
        self.spec.filters.push((field.to_string(), op, value.clone()));
        self
    }

    fn related(mut self: Box<Self>, association: &str) -> Box<dyn BackendQuery> {
        self.spec.related.push(association.to_string());
        self
    }

    fn order_by(mut self: Box<Self>, field: &str, direction: Direction) -> Box<dyn BackendQuery> {
        self.spec.order.push((field.to_string(), direction));
        self
    }

    fn limit(mut self: Box<Self>, n: u64) -> Box<dyn BackendQuery> {
        self.spec.limit = Some(n);
        self
    }

    fn offset(mut self: Box<Self>, n: u64) -> Box<dyn BackendQuery> {
        self.spec.offset = Some(n);
        self
    }

    fn one(mut self: Box<Self>) -> Box<dyn BackendQuery> {
        self.spec.one = true;
        self
    }

    fn materialize(self: Box<Self>, ttl: Ttl) -> Result<Arc<dyn View>, BackendError> {
        let shared = &self.backend.shared;
        let mut store = shared.store.lock();
        if store.offline {
            return Err(BackendError::Unavailable("memory backend is offline".into()));
        }
        if store.failing_materializations > 0 {
            store.failing_materializations -= 1;
            return Err(BackendError::Unavailable("injected materialization failure".into()));
        }

        let initial = self.spec.evaluate(&store);
        let view = Arc::new(MemoryView {
            id: shared.next_view_id.fetch_add(1, Ordering::Relaxed),
            backend: self.backend.clone(),
            spec: self.spec,
            ttl,
            last: Mutex::new(initial),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(1),
            destroyed: AtomicBool::new(false),
        });
        store.views.push(Arc::downgrade(&view));
        store.stats.materialized += 1;
        debug!(view = view.id, table = view.spec.table.name, %ttl, "materialized view");
        Ok(view)
    }
}

struct MemoryView {
    id: u64,
    backend: MemoryBackend,
    spec: ViewSpec,
    ttl: Ttl,
    last: Mutex<ViewData>,
    listeners: Mutex<Vec<(u64, ViewListener)>>,
    next_listener: AtomicU64,
    destroyed: AtomicBool,
}

impl View for MemoryView {
    fn data(&self) -> ViewData {
        self.last.lock().clone()
    }

    fn add_listener(&self, listener: ViewListener) -> Unlisten {
        if self.destroyed.load(Ordering::SeqCst) {
            return Unlisten::noop();
        }
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().push((id, listener.clone()));

        let initial = self.data();
        self.backend.deliver(vec![(listener, initial)]);

        let view_id = self.id;
        let backend = self.backend.clone();
        Unlisten::new(move || {
            let store = backend.shared.store.lock();
            let view = store
                .views
                .iter()
                .filter_map(Weak::upgrade)
                .find(|v| v.id == view_id);
            drop(store);
            if let Some(view) = view {
                view.listeners.lock().retain(|(lid, _)| *lid != id);
            }
        })
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.listeners.lock().clear();
        self.backend.shared.store.lock().stats.destroyed += 1;
        debug!(view = self.id, ttl = %self.ttl, "destroyed view");
    }
}
