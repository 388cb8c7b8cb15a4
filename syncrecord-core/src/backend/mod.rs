//! Sync Backend Contract
//!
//! The engine does not store or replicate data itself. It drives an external
//! sync backend through the narrow interface in this module:
//!
//! - [`SyncBackend::query`] starts a chainable [`BackendQuery`] for a table.
//! - [`BackendQuery::materialize`] turns the query into a live [`View`].
//! - A [`View`] exposes its current snapshot and pushes every new snapshot
//!   to its listeners until it is destroyed.
//! - [`SyncBackend::insert`] / [`SyncBackend::update`] are fire-and-await
//!   mutations.
//!
//! Implementations must deliver snapshots for one view in order. They may
//! deliver the initial snapshot synchronously from inside `add_listener` or
//! later from another task; the engine handles both.
//!
//! [`memory::MemoryBackend`] is an in-process implementation used for tests
//! and demos.

pub mod memory;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::ValidationErrors;
use crate::query::{Direction, Operator};
use crate::schema::TableSchema;
use crate::ttl::Ttl;
use crate::value::{ConditionValue, Record};

/// Errors reported by a backend.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("backend timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("no {table} row with id={id}")]
    NotFound { table: &'static str, id: String },

    #[error("mutation rejected: {0}")]
    Rejected(ValidationErrors),

    #[error("backend error: {0}")]
    Other(String),
}

/// A snapshot of a view's result.
#[derive(Debug, Clone, PartialEq)]
pub enum ViewData {
    /// Result of a collection query.
    Many(Vec<Record>),
    /// Result of a `one()` query; `None` when no row matches.
    One(Option<Record>),
}

impl ViewData {
    /// An empty snapshot of the right shape.
    pub fn empty(single: bool) -> Self {
        if single {
            ViewData::One(None)
        } else {
            ViewData::Many(Vec::new())
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ViewData::Many(rows) => rows.len(),
            ViewData::One(row) => usize::from(row.is_some()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Callback invoked with every snapshot a view pushes.
pub type ViewListener = Arc<dyn Fn(&ViewData) + Send + Sync>;

/// Removes a listener from a view when called.
pub struct Unlisten(Box<dyn FnOnce() + Send>);

impl Unlisten {
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self(Box::new(f))
    }

    /// A no-op unlisten for views that never had a listener.
    pub fn noop() -> Self {
        Self::new(|| {})
    }

    pub fn call(self) {
        (self.0)()
    }
}

impl fmt::Debug for Unlisten {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Unlisten")
    }
}

/// A live, backend-maintained query result.
pub trait View: Send + Sync {
    /// The current snapshot.
    fn data(&self) -> ViewData;

    /// Register a listener for pushed snapshots.
    fn add_listener(&self, listener: ViewListener) -> Unlisten;

    /// Release the view. The backend may keep its data cached for the TTL
    /// the view was materialized with.
    fn destroy(&self);
}

/// A chainable backend query.
///
/// Each method consumes the builder and returns the extended one, mirroring
/// the backend's own fluent API.
pub trait BackendQuery: Send {
    fn where_(
        self: Box<Self>,
        field: &str,
        op: Operator,
        value: &ConditionValue,
    ) -> Box<dyn BackendQuery>;

    fn related(self: Box<Self>, association: &str) -> Box<dyn BackendQuery>;

    fn order_by(self: Box<Self>, field: &str, direction: Direction) -> Box<dyn BackendQuery>;

    fn limit(self: Box<Self>, n: u64) -> Box<dyn BackendQuery>;

    fn offset(self: Box<Self>, n: u64) -> Box<dyn BackendQuery>;

    fn one(self: Box<Self>) -> Box<dyn BackendQuery>;

    /// Materialize the query into a live view retained for `ttl`.
    fn materialize(self: Box<Self>, ttl: Ttl) -> Result<Arc<dyn View>, BackendError>;
}

/// The sync backend's client API.
#[async_trait]
pub trait SyncBackend: Send + Sync {
    /// Start a query against `table`.
    fn query(&self, table: &'static TableSchema) -> Result<Box<dyn BackendQuery>, BackendError>;

    async fn insert(&self, table: &'static TableSchema, record: Record) -> Result<(), BackendError>;

    /// Update the row identified by the record's primary key. Fields absent
    /// from `record` are left unchanged.
    async fn update(&self, table: &'static TableSchema, record: Record) -> Result<(), BackendError>;
}
