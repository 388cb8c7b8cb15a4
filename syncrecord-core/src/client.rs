//! The client: entry point and dependency root.
//!
//! A [`RecordClient`] is built around one backend handle and owns the query
//! compiler, the subscription manager and the engine configuration. Model
//! factories, relations and reactive queries all hold a clone of it, so
//! promise-style calls and reactive queries share one set of backend views.
//!
//! ```rust,ignore
//! let client = RecordClient::new(Arc::new(backend));
//! let tasks = client.model::<Task>();
//!
//! let task = tasks.find("T1").await?;
//! let open = tasks.where_eq("status", 1)?.observe();
//! ```

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::backend::{SyncBackend, ViewData};
use crate::config::EngineConfig;
use crate::error::{RecordError, Result};
use crate::model::{Model, ModelFactory};
use crate::query::{QueryCompiler, QueryDescriptor};
use crate::reactive::{QueryCoordinator, QueryOptions, ReactiveQuery, Snapshot};
use crate::retry::RetryDecision;
use crate::subscription::SubscriptionManager;

struct ClientInner {
    backend: Arc<dyn SyncBackend>,
    compiler: QueryCompiler,
    subscriptions: SubscriptionManager,
    config: EngineConfig,
}

/// Handle to the engine. Cheap to clone.
#[derive(Clone)]
pub struct RecordClient {
    inner: Arc<ClientInner>,
}

impl RecordClient {
    /// A client with the default [`EngineConfig`].
    pub fn new(backend: Arc<dyn SyncBackend>) -> Self {
        Self::with_config(backend, EngineConfig::default())
    }

    pub fn with_config(backend: Arc<dyn SyncBackend>, config: EngineConfig) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                compiler: QueryCompiler::new(backend.clone()),
                backend,
                subscriptions: SubscriptionManager::new(),
                config,
            }),
        }
    }

    /// The factory for model `M`.
    pub fn model<M: Model>(&self) -> ModelFactory<M> {
        ModelFactory::new(self.clone())
    }

    /// A new coordinator for named, combinable queries.
    pub fn coordinator(&self) -> QueryCoordinator {
        QueryCoordinator::new(self)
    }

    /// Start a reactive query from an arbitrary query-producing function.
    pub fn observe<T, F>(&self, query_fn: F, options: QueryOptions) -> ReactiveQuery<T>
    where
        T: Snapshot,
        F: Fn() -> Result<QueryDescriptor> + Send + Sync + 'static,
    {
        ReactiveQuery::new(self, query_fn, options)
    }

    /// Resolve the first snapshot of `descriptor`, retrying transient
    /// failures per the configured policy.
    pub async fn fetch(&self, descriptor: &QueryDescriptor) -> Result<ViewData> {
        let mut attempt = 0;
        loop {
            let error = match self.fetch_once(descriptor).await {
                Ok(data) => return Ok(data),
                Err(error) => error,
            };
            match self.config().retry.decide(&error, attempt) {
                RetryDecision::Retry { delay } => {
                    debug!(
                        fingerprint = %descriptor.fingerprint(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "retrying fetch"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                RetryDecision::GiveUp => return Err(error),
            }
        }
    }

    async fn fetch_once(&self, descriptor: &QueryDescriptor) -> Result<ViewData> {
        let compiled = self.compiler().compile(descriptor)?;
        let handle = self.subscriptions().acquire(
            descriptor.fingerprint(),
            compiled,
            self.config().default_ttl,
        );

        let timeout = self.config().fetch_timeout();
        let result = match tokio::time::timeout(timeout, handle.wait_for_data()).await {
            Ok(result) => result,
            Err(_) => Err(RecordError::Transient(format!(
                "no data after {}ms",
                timeout.as_millis()
            ))),
        };
        self.subscriptions().release(&handle);
        result
    }

    pub fn backend(&self) -> &Arc<dyn SyncBackend> {
        &self.inner.backend
    }

    pub fn compiler(&self) -> &QueryCompiler {
        &self.inner.compiler
    }

    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.inner.subscriptions
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }
}

impl fmt::Debug for RecordClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordClient")
            .field("subscriptions", &self.inner.subscriptions)
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}
