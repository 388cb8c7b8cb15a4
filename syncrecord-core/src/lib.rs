//! Syncrecord Core
//!
//! This crate provides an ActiveRecord-shaped data layer over an external
//! incremental sync engine (the "sync backend"). Records are served and kept
//! current by the backend; this crate turns application queries into
//! backend views and exposes their results as typed, observable state.
//!
//! It implements:
//!
//! - Immutable, canonical query descriptors with stable fingerprints
//! - Compilation of descriptors into backend query-builder calls
//! - Refcounted sharing of backend views between identical queries
//! - Reactive queries with `data` / `is_loading` / `error` state
//! - Retry with exponential backoff for transient failures
//! - Combined multi-query views with per-query TTLs
//!
//! # Architecture
//!
//! - `query`: descriptors, fingerprints, the compiler and named scopes
//! - `backend`: the sync backend contract and an in-memory implementation
//! - `subscription`: fingerprint-keyed, refcounted backend views
//! - `reactive`: reactive queries, subscribers and the query coordinator
//! - `model`: the `Model` trait, model factories and relations
//! - `client`: `RecordClient`, the root that ties everything together
//!
//! # Example
//!
//! ```rust,ignore
//! use syncrecord_core::{Model, RecordClient, TableSchema};
//! use syncrecord_core::backend::memory::MemoryBackend;
//!
//! let client = RecordClient::new(Arc::new(MemoryBackend::new()));
//! let tasks = client.model::<Task>();
//!
//! // Promise style: resolve once, typed errors.
//! let task = tasks.find("T1").await?;
//!
//! // Reactive style: live state, errors land in state.
//! let open = tasks.where_eq("status", 1)?.observe();
//! let _sub = open.subscribe(|tasks, meta| {
//!     println!("{} open tasks (loading: {})", meta.count, meta.is_loading);
//! });
//! ```

pub mod backend;
pub mod client;
pub mod config;
pub mod error;
pub mod model;
pub mod query;
pub mod reactive;
pub mod retry;
pub mod schema;
pub mod subscription;
pub mod ttl;
pub mod value;

pub use client::RecordClient;
pub use config::EngineConfig;
pub use error::{ErrorInfo, ErrorKind, RecordError, Result, ValidationErrors};
pub use model::{Model, ModelFactory, Relation};
pub use query::{Direction, Operator, QueryDescriptor};
pub use reactive::{QueryOptions, ReactiveQuery, Subscription};
pub use retry::RetryPolicy;
pub use schema::{Association, TableSchema};
pub use ttl::Ttl;
pub use value::{ConditionValue, Scalar};
