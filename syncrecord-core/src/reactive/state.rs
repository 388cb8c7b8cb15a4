//! Observable query state.

use serde::Serialize;

use crate::backend::ViewData;
use crate::error::{ErrorInfo, Result};
use crate::model::{decode, Model};

/// Lifecycle of a reactive query.
///
/// ```text
/// Initializing -> Loading -> Ready
///                        \-> Error
/// Ready | Error -> Loading      (reload)
/// any -> Destroyed              (terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Initializing,
    Loading,
    Ready,
    Error,
    Destroyed,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        self == Phase::Destroyed
    }
}

/// The typed result a reactive query exposes.
///
/// Implemented for `Vec<M>` (collection queries) and `Option<M>`
/// (single-record queries, `None` when no row matches).
pub trait Snapshot: Serialize + Clone + Send + Sync + 'static {
    const COLLECTION: bool;

    fn from_view(data: &ViewData) -> Result<Self>;

    /// Number of records held.
    fn count(&self) -> usize;
}

impl<M: Model> Snapshot for Vec<M> {
    const COLLECTION: bool = true;

    fn from_view(data: &ViewData) -> Result<Self> {
        match data {
            ViewData::Many(rows) => rows.iter().map(decode).collect(),
            ViewData::One(row) => row.iter().map(decode).collect(),
        }
    }

    fn count(&self) -> usize {
        self.len()
    }
}

impl<M: Model> Snapshot for Option<M> {
    const COLLECTION: bool = false;

    fn from_view(data: &ViewData) -> Result<Self> {
        let row = match data {
            ViewData::One(row) => row.as_ref(),
            ViewData::Many(rows) => rows.first(),
        };
        row.map(decode).transpose()
    }

    fn count(&self) -> usize {
        usize::from(self.is_some())
    }
}

/// Everything a subscriber learns besides the data itself.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryMeta {
    pub is_loading: bool,
    pub error: Option<ErrorInfo>,
    pub count: usize,
    pub phase: Phase,
}

/// State held by one reactive query.
#[derive(Debug, Clone)]
pub struct ReactiveState<T> {
    /// `None` until the first snapshot arrives.
    pub data: Option<T>,
    pub is_loading: bool,
    pub error: Option<ErrorInfo>,
    pub phase: Phase,
    /// Retries used by the current load.
    pub retry_count: u32,
}

impl<T> Default for ReactiveState<T> {
    fn default() -> Self {
        Self {
            data: None,
            is_loading: true,
            error: None,
            phase: Phase::Initializing,
            retry_count: 0,
        }
    }
}

impl<T: Snapshot> ReactiveState<T> {
    pub fn is_collection(&self) -> bool {
        T::COLLECTION
    }

    pub fn count(&self) -> usize {
        self.data.as_ref().map(Snapshot::count).unwrap_or(0)
    }

    pub fn meta(&self) -> QueryMeta {
        QueryMeta {
            is_loading: self.is_loading,
            error: self.error.clone(),
            count: self.count(),
            phase: self.phase,
        }
    }

    /// Back to a fresh load: data and error cleared.
    pub(crate) fn reset_loading(&mut self) {
        self.data = None;
        self.is_loading = true;
        self.error = None;
        self.phase = Phase::Loading;
        self.retry_count = 0;
    }

    pub(crate) fn ready(&mut self, data: Option<T>) {
        self.data = data;
        self.is_loading = false;
        self.error = None;
        self.phase = Phase::Ready;
    }

    pub(crate) fn failed(&mut self, error: ErrorInfo) {
        self.is_loading = false;
        self.error = Some(error);
        self.phase = Phase::Error;
    }
}
