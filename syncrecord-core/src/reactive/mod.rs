//! Reactive Queries
//!
//! This module exposes query results as observable state that follows the
//! sync backend.
//!
//! # Concepts
//!
//! ## Reactive queries
//!
//! A [`ReactiveQuery`] holds `data`, `is_loading` and `error` for one query.
//! The accessors are synchronous reads; changes arrive as backend pushes and
//! are announced to subscribers. Runtime failures never escape as `Err`:
//! they are retried or written to `error`.
//!
//! ## Subscriptions
//!
//! Reactivity is explicit. `subscribe(callback)` returns a [`Subscription`];
//! the callback runs immediately and after every change until the
//! subscription is dropped. Any UI layer (or none) can sit on top.
//!
//! ## Combined queries
//!
//! A [`QueryCoordinator`] registers named queries with their own TTLs and
//! builds [`CombinedQuery`] views that merge several of them into one
//! loading flag and one `{name: data}` map.

mod combined;
mod query;
mod state;
mod subscriber;

pub use combined::{CombinedQuery, CombinedSnapshot, QueryCoordinator};
pub use query::{QueryFn, QueryOptions, ReactiveQuery, SubscriberFn};
pub use state::{Phase, QueryMeta, ReactiveState, Snapshot};
pub use subscriber::{SubscriberId, Subscription};

pub(crate) use subscriber::{invoke_isolated, SubscriberList};
