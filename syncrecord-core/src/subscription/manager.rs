//! Fingerprint-keyed registry of live subscription handles.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, trace, warn};

use super::handle::SubscriptionHandle;
use crate::error::RecordError;
use crate::query::{CompiledQuery, Fingerprint};
use crate::ttl::Ttl;

/// Snapshot of the registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionStats {
    /// Live handles.
    pub active: usize,
    /// Sum of ref counts over live handles.
    pub references: usize,
}

/// Owns backend views and shares them between identical queries.
#[derive(Default)]
pub struct SubscriptionManager {
    handles: DashMap<Fingerprint, Arc<SubscriptionHandle>>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the live handle for `fingerprint`, materializing `compiled` if
    /// there is none.
    ///
    /// Never fails: a materialization error yields a pending handle that
    /// carries the error and is not registered for sharing.
    pub fn acquire(
        &self,
        fingerprint: Fingerprint,
        compiled: CompiledQuery,
        ttl: Ttl,
    ) -> Arc<SubscriptionHandle> {
        let handle = match self.handles.entry(fingerprint.clone()) {
            Entry::Occupied(entry) => {
                let handle = entry.get().clone();
                let refs = handle.retain();
                trace!(%fingerprint, refs, "sharing view");
                return handle;
            }
            Entry::Vacant(entry) => {
                let CompiledQuery {
                    query, projection, ..
                } = compiled;
                match query.materialize(ttl) {
                    Ok(view) => {
                        let handle = Arc::new(SubscriptionHandle::live(
                            fingerprint.clone(),
                            ttl,
                            projection,
                            view,
                        ));
                        entry.insert(handle.clone());
                        handle
                    }
                    Err(err) => {
                        let err = RecordError::from(err);
                        warn!(%fingerprint, error = %err, "materialization failed");
                        return Arc::new(SubscriptionHandle::pending(fingerprint, ttl, err));
                    }
                }
            }
        };

        // Shard lock released: the backend may push synchronously from here.
        debug!(%fingerprint, %ttl, "materialized view");
        handle.attach();
        handle
    }

    /// Drop one reference. The last release tears the view down.
    pub fn release(&self, handle: &Arc<SubscriptionHandle>) {
        if handle.is_pending() {
            handle.teardown();
            return;
        }

        let mut last = false;
        let removed = self.handles.remove_if(handle.fingerprint(), |_, registered| {
            if !Arc::ptr_eq(registered, handle) {
                return false;
            }
            last = registered.release_ref() == 0;
            last
        });

        if let Some((fingerprint, handle)) = removed {
            trace!(%fingerprint, "last reference released");
            handle.teardown();
        } else if !last {
            trace!(fingerprint = %handle.fingerprint(), refs = handle.ref_count(), "released reference");
        }
    }

    /// The live handle for `fingerprint`, without acquiring it.
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<Arc<SubscriptionHandle>> {
        self.handles.get(fingerprint).map(|entry| entry.value().clone())
    }

    /// Counts of live handles and their references.
    pub fn stats(&self) -> SubscriptionStats {
        self.handles
            .iter()
            .fold(SubscriptionStats::default(), |mut stats, entry| {
                stats.active += 1;
                stats.references += entry.value().ref_count();
                stats
            })
    }

    /// Fingerprints of live handles with their ref counts, sorted.
    pub fn active_fingerprints(&self) -> Vec<(Fingerprint, usize)> {
        let mut active: Vec<_> = self
            .handles
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().ref_count()))
            .collect();
        active.sort();
        active
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl std::fmt::Debug for SubscriptionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionManager")
            .field("active", &self.handles.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::{Delivery, MemoryBackend};
    use crate::backend::{SyncBackend, ViewData};
    use crate::query::{QueryCompiler, QueryDescriptor};
    use crate::reactive::SubscriberId;
    use crate::schema::TableSchema;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static TASKS: TableSchema = TableSchema::new("tasks", &["id", "title", "status", "job_id"]);

    fn setup(delivery: Delivery) -> (MemoryBackend, QueryCompiler, SubscriptionManager) {
        let backend = MemoryBackend::with_delivery(delivery);
        backend.seed(
            &TASKS,
            [
                json!({"id": "t1", "title": "Frame", "status": 1, "job_id": "J1"}),
                json!({"id": "t2", "title": "Roof", "status": 2, "job_id": "J1"}),
            ],
        );
        let shared: Arc<dyn SyncBackend> = Arc::new(backend.clone());
        (backend, QueryCompiler::new(shared), SubscriptionManager::new())
    }

    fn acquire(
        manager: &SubscriptionManager,
        compiler: &QueryCompiler,
        descriptor: &QueryDescriptor,
    ) -> Arc<SubscriptionHandle> {
        manager.acquire(
            descriptor.fingerprint(),
            compiler.compile(descriptor).unwrap(),
            Ttl::default(),
        )
    }

    #[test]
    fn identical_fingerprints_share_one_view() {
        let (backend, compiler, manager) = setup(Delivery::Immediate);
        let by_job = QueryDescriptor::new(&TASKS).where_eq("job_id", "J1").unwrap();

        let first = acquire(&manager, &compiler, &by_job);
        let second = acquire(&manager, &compiler, &by_job);

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.ref_count(), 2);
        assert_eq!(backend.stats().materialized, 1);
        assert_eq!(
            manager.stats(),
            SubscriptionStats {
                active: 1,
                references: 2
            }
        );
    }

    #[test]
    fn last_release_destroys_once() {
        let (backend, compiler, manager) = setup(Delivery::Immediate);
        let all = QueryDescriptor::new(&TASKS);

        let first = acquire(&manager, &compiler, &all);
        let second = acquire(&manager, &compiler, &all);

        manager.release(&first);
        assert_eq!(backend.stats().destroyed, 0);
        assert!(second.is_live());
        assert_eq!(second.last_data().map(|d| d.len()), Some(2));

        manager.release(&second);
        assert_eq!(backend.stats().destroyed, 1);
        assert!(manager.is_empty());

        // A stray extra release is harmless.
        manager.release(&second);
        assert_eq!(backend.stats().destroyed, 1);
    }

    #[test]
    fn failed_materialization_is_pending_and_unshared() {
        let (backend, compiler, manager) = setup(Delivery::Immediate);
        backend.fail_next_materializations(1);
        let all = QueryDescriptor::new(&TASKS);

        let failed = acquire(&manager, &compiler, &all);
        assert!(failed.is_pending());
        assert!(matches!(failed.error(), Some(RecordError::Transient(_))));
        assert!(manager.is_empty());

        let retried = acquire(&manager, &compiler, &all);
        assert!(retried.is_live());
        manager.release(&failed);
        assert_eq!(manager.stats().active, 1);
    }

    #[test]
    fn late_listeners_get_the_latest_snapshot() {
        let (_backend, compiler, manager) = setup(Delivery::Immediate);
        let handle = acquire(&manager, &compiler, &QueryDescriptor::new(&TASKS));

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        handle.listen(
            SubscriberId::new(),
            Arc::new(move |data: &ViewData| {
                seen_clone.store(data.len(), Ordering::SeqCst);
            }),
        );
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn projection_applies_to_pushed_snapshots() {
        let (_backend, compiler, manager) = setup(Delivery::Immediate);
        let statuses = QueryDescriptor::new(&TASKS)
            .select(&["job_id"])
            .unwrap()
            .distinct();
        let handle = acquire(&manager, &compiler, &statuses);

        let Some(ViewData::Many(rows)) = handle.last_data() else {
            panic!("expected rows");
        };
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("job_id"), Some(&json!("J1")));
    }

    #[tokio::test]
    async fn wait_for_data_resolves_on_first_push() {
        let (backend, compiler, manager) = setup(Delivery::Deferred);
        let handle = acquire(&manager, &compiler, &QueryDescriptor::new(&TASKS));
        assert!(handle.last_data().is_none());

        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.wait_for_data().await })
        };
        tokio::task::yield_now().await;
        backend.flush();

        let data = waiter.await.unwrap().unwrap();
        assert_eq!(data.len(), 2);
    }

    #[test]
    fn active_fingerprints_are_sorted() {
        let (_backend, compiler, manager) = setup(Delivery::Immediate);
        let b = QueryDescriptor::new(&TASKS).where_eq("status", 2).unwrap();
        let a = QueryDescriptor::new(&TASKS).where_eq("status", 1).unwrap();
        acquire(&manager, &compiler, &b);
        acquire(&manager, &compiler, &a);
        acquire(&manager, &compiler, &a);

        let active = manager.active_fingerprints();
        assert_eq!(active.len(), 2);
        assert_eq!(active[0], (a.fingerprint(), 2));
        assert_eq!(active[1], (b.fingerprint(), 1));
    }
}
