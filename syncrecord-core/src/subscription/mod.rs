//! Subscription Management
//!
//! A [`SubscriptionHandle`] wraps one materialized backend view. The
//! [`SubscriptionManager`] keys handles by query [`Fingerprint`] so that
//! every consumer of an identical query shares a single view.
//!
//! # Lifecycle
//!
//! 1. The first `acquire` for a fingerprint materializes the view with the
//!    requested TTL and registers one backend listener. Later acquirers
//!    bump the ref count and receive the same handle, along with the latest
//!    snapshot if one has already arrived.
//!
//! 2. Snapshots pushed by the backend pass through the query's projection
//!    (if any) and fan out to every listener on the handle.
//!
//! 3. `release` decrements the ref count. The last release unregisters the
//!    backend listener and destroys the view; the backend keeps the data
//!    cached for the TTL.
//!
//! A failed materialization produces a *pending* handle carrying the error.
//! Pending handles are never shared: the next acquire tries again.
//!
//! [`Fingerprint`]: crate::query::Fingerprint

mod handle;
mod manager;

pub use handle::{SnapshotListener, SubscriptionHandle};
pub use manager::{SubscriptionManager, SubscriptionStats};
