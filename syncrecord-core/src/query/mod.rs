//! Query Construction
//!
//! This module turns application-level query chains into backend calls.
//!
//! # Pieces
//!
//! - [`QueryDescriptor`]: immutable, canonical description of a query.
//!   Builder methods validate their arguments against the table schema and
//!   return a new descriptor.
//! - [`Fingerprint`]: canonical identity of a descriptor. Equal meaning,
//!   equal fingerprint, whatever order the chain was written in.
//! - [`QueryCompiler`]: replays a descriptor against the backend's query
//!   builder in a fixed order.
//! - [`ScopeRegistry`]: named descriptor transforms declared per model.
//!
//! # Example
//!
//! ```rust,ignore
//! let open_tasks = QueryDescriptor::new(Task::SCHEMA)
//!     .where_eq("status", 1)?
//!     .order_by("position", Direction::Asc)?
//!     .limit(50);
//!
//! let compiled = compiler.compile(&open_tasks)?;
//! ```

mod compiler;
mod descriptor;
mod fingerprint;
mod scope;

pub use compiler::{CompiledQuery, Projection, QueryCompiler};
pub use descriptor::{Condition, Direction, Operator, OrderClause, QueryDescriptor};
pub use fingerprint::Fingerprint;
pub use scope::{Scope, ScopeFn, ScopeRegistry, SOFT_DELETE_SCOPES};
