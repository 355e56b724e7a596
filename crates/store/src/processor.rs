#![forbid(unsafe_code)]

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use mirra_core::{Delta, DeltaKind, ObjectKey, Resource};
use rustc_hash::FxHashSet;
use tracing::{debug, error, info};

use crate::queue::{Batch, DeltaQueue};
use crate::store::Store;

/// Change-event subscriber. Called synchronously by the processor, after the
/// store already reflects the change.
pub trait EventHandler<K>: Send + Sync {
    fn on_add(&self, _obj: &Arc<K>) {}
    fn on_update(&self, _old: &Arc<K>, _new: &Arc<K>) {}
    fn on_delete(&self, _obj: &Arc<K>) {}
}

type AddFn<K> = Box<dyn Fn(&Arc<K>) + Send + Sync>;
type UpdateFn<K> = Box<dyn Fn(&Arc<K>, &Arc<K>) + Send + Sync>;

/// Closure-backed [`EventHandler`]; unset callbacks do nothing.
pub struct HandlerFns<K> {
    add: Option<AddFn<K>>,
    update: Option<UpdateFn<K>>,
    delete: Option<AddFn<K>>,
}

impl<K> Default for HandlerFns<K> {
    fn default() -> Self { Self { add: None, update: None, delete: None } }
}

impl<K> HandlerFns<K> {
    pub fn new() -> Self { Self::default() }

    pub fn on_add(mut self, f: impl Fn(&Arc<K>) + Send + Sync + 'static) -> Self {
        self.add = Some(Box::new(f));
        self
    }

    pub fn on_update(mut self, f: impl Fn(&Arc<K>, &Arc<K>) + Send + Sync + 'static) -> Self {
        self.update = Some(Box::new(f));
        self
    }

    pub fn on_delete(mut self, f: impl Fn(&Arc<K>) + Send + Sync + 'static) -> Self {
        self.delete = Some(Box::new(f));
        self
    }
}

impl<K> EventHandler<K> for HandlerFns<K> {
    fn on_add(&self, obj: &Arc<K>) {
        if let Some(f) = &self.add { f(obj) }
    }
    fn on_update(&self, old: &Arc<K>, new: &Arc<K>) {
        if let Some(f) = &self.update { f(old, new) }
    }
    fn on_delete(&self, obj: &Arc<K>) {
        if let Some(f) = &self.delete { f(obj) }
    }
}

/// Returned by [`Processor::subscribe`]; pass back to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

struct Registered<K> {
    id: u64,
    handler: Arc<dyn EventHandler<K>>,
}

impl<K> Clone for Registered<K> {
    fn clone(&self) -> Self { Self { id: self.id, handler: Arc::clone(&self.handler) } }
}

/// Drains a [`DeltaQueue`] into a [`Store`] and fans each applied change out to
/// subscribers in registration order.
pub struct Processor<K> {
    store: Arc<Store<K>>,
    handlers: ArcSwap<Vec<Registered<K>>>,
    next_id: AtomicU64,
}

pub(crate) fn panic_message(p: &(dyn Any + Send)) -> String {
    if let Some(s) = p.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = p.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

impl<K: Resource> Processor<K> {
    pub fn new(store: Arc<Store<K>>) -> Self {
        Self { store, handlers: ArcSwap::from_pointee(Vec::new()), next_id: AtomicU64::new(0) }
    }

    pub fn store(&self) -> &Arc<Store<K>> { &self.store }

    pub fn subscribe(&self, handler: Arc<dyn EventHandler<K>>) -> SubscriptionHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = Registered { id, handler };
        self.handlers.rcu(|cur| {
            let mut next = Vec::clone(cur);
            next.push(entry.clone());
            next
        });
        debug!(subscriber = id, "subscriber registered");
        SubscriptionHandle(id)
    }

    /// Returns false when the handle was not registered.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let before = self.handlers.load().len();
        self.handlers.rcu(|cur| cur.iter().filter(|r| r.id != handle.0).cloned().collect::<Vec<_>>());
        self.handlers.load().len() < before
    }

    pub fn subscribers(&self) -> usize { self.handlers.load().len() }

    fn dispatch(&self, kind: DeltaKind, key: &ObjectKey, call: impl Fn(&dyn EventHandler<K>)) {
        metrics::counter!("processor_deltas_total", 1u64, "kind" => kind.as_str());
        let handlers = self.handlers.load();
        for r in handlers.iter() {
            if let Err(p) = catch_unwind(AssertUnwindSafe(|| call(r.handler.as_ref()))) {
                error!(subscriber = r.id, key = %key, kind = kind.as_str(), panic = %panic_message(p.as_ref()), "subscriber panicked; continuing delivery");
                metrics::counter!("processor_handler_panics_total", 1u64);
            }
        }
    }

    /// Apply one delta to the store, then notify subscribers.
    pub fn apply(&self, delta: Delta<K>) {
        let key = delta.key();
        match delta.kind {
            DeltaKind::Deleted => {
                if self.store.delete(&key).is_some() {
                    self.dispatch(DeltaKind::Deleted, &key, |h| h.on_delete(&delta.object));
                }
            }
            DeltaKind::Added | DeltaKind::Updated | DeltaKind::Synced => {
                if delta.kind == DeltaKind::Updated && self.is_stale(&key, &delta.object) {
                    debug!(key = %key, "dropping stale update");
                    metrics::counter!("processor_stale_updates_total", 1u64);
                    return;
                }
                match self.store.update(Arc::clone(&delta.object)) {
                    Some(old) => self.dispatch(DeltaKind::Updated, &key, |h| h.on_update(&old, &delta.object)),
                    None => self.dispatch(DeltaKind::Added, &key, |h| h.on_add(&delta.object)),
                }
            }
        }
    }

    fn is_stale(&self, key: &ObjectKey, incoming: &K) -> bool {
        let Some(current) = self.store.get(key) else { return false };
        match (incoming.resource_version(), current.resource_version()) {
            (Some(new), Some(cur)) => new.is_older_than(&cur).unwrap_or(false),
            _ => false,
        }
    }

    /// Delete every cached key the latest listing did not contain.
    pub fn resync(&self, keep: &FxHashSet<ObjectKey>) -> usize {
        let mut removed = 0usize;
        for key in self.store.list_keys() {
            if keep.contains(&key) {
                continue;
            }
            if let Some(old) = self.store.delete(&key) {
                removed += 1;
                self.dispatch(DeltaKind::Deleted, &key, |h| h.on_delete(&old));
            }
        }
        info!(kept = keep.len(), removed, "resync applied");
        removed
    }

    /// Pop until the queue is closed and drained.
    pub async fn run(&self, queue: &DeltaQueue<K>) {
        let mut batches = 0u64;
        while let Some(batch) = queue.pop().await {
            batches += 1;
            match batch {
                Batch::Deltas { deltas, .. } => {
                    for d in deltas {
                        self.apply(d);
                    }
                }
                Batch::Synced { keep } => {
                    self.resync(&keep);
                    queue.mark_synced();
                }
            }
        }
        info!(batches, "delta queue closed; processor stopped");
    }
}
