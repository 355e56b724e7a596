#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use mirra_core::{Delta, DeltaKind, ObjectKey, Resource};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::{watch, Notify};
use tracing::debug;

/// Unit handed to the processor by [`DeltaQueue::pop`].
#[derive(Debug)]
pub enum Batch<K> {
    /// Every coalesced delta for one key, oldest first.
    Deltas { key: ObjectKey, deltas: Vec<Delta<K>> },
    /// A full listing completed; keys absent from `keep` no longer exist remotely.
    Synced { keep: FxHashSet<ObjectKey> },
}

enum Slot {
    Key(ObjectKey),
    Barrier(u64),
}

struct State<K> {
    items: FxHashMap<ObjectKey, Vec<Delta<K>>>,
    order: VecDeque<Slot>,
    barriers: FxHashMap<u64, FxHashSet<ObjectKey>>,
    next_barrier: u64,
    closed: bool,
}

/// Coalescing queue keyed by object key with FIFO order across keys.
pub struct DeltaQueue<K> {
    state: Mutex<State<K>>,
    notify: Notify,
    synced: watch::Sender<bool>,
}

impl<K: Resource> Default for DeltaQueue<K> {
    fn default() -> Self { Self::new() }
}

/// Fold `delta` into one key's pending list.
fn coalesce<K>(list: &mut Vec<Delta<K>>, delta: Delta<K>) {
    if delta.kind == DeltaKind::Deleted {
        list.clear();
        list.push(delta);
        return;
    }
    match list.last_mut() {
        Some(last) if last.kind != DeltaKind::Deleted => {
            last.object = delta.object;
            if last.kind != DeltaKind::Added {
                last.kind = DeltaKind::Updated;
            }
        }
        _ => list.push(delta),
    }
}

impl<K: Resource> DeltaQueue<K> {
    pub fn new() -> Self {
        let (synced, _) = watch::channel(false);
        Self {
            state: Mutex::new(State {
                items: FxHashMap::default(),
                order: VecDeque::new(),
                barriers: FxHashMap::default(),
                next_barrier: 0,
                closed: false,
            }),
            notify: Notify::new(),
            synced,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<K>> { self.state.lock().unwrap_or_else(PoisonError::into_inner) }

    fn push_locked(st: &mut State<K>, delta: Delta<K>) {
        let key = delta.key();
        // Newer information than any pending listing: the barrier must not undo it.
        for keep in st.barriers.values_mut() {
            keep.insert(key.clone());
        }
        match st.items.get_mut(&key) {
            Some(list) => coalesce(list, delta),
            None => {
                st.items.insert(key.clone(), vec![delta]);
                st.order.push_back(Slot::Key(key));
            }
        }
    }

    /// Queue one delta. No-op once closed.
    pub fn push(&self, delta: Delta<K>) {
        let mut st = self.lock();
        if st.closed {
            return;
        }
        Self::push_locked(&mut st, delta);
        metrics::gauge!("delta_queue_depth", st.order.len() as f64);
        drop(st);
        self.notify.notify_one();
    }

    /// Queue a full listing: one `Added` per object followed by a sync barrier.
    pub fn replace(&self, objects: Vec<Arc<K>>) {
        let mut st = self.lock();
        if st.closed {
            return;
        }
        let mut keep = FxHashSet::default();
        for obj in objects {
            keep.insert(obj.key());
            Self::push_locked(&mut st, Delta::added(obj));
        }
        let id = st.next_barrier;
        st.next_barrier = st.next_barrier.wrapping_add(1);
        debug!(barrier = id, listed = keep.len(), "sync barrier queued");
        st.barriers.insert(id, keep);
        st.order.push_back(Slot::Barrier(id));
        metrics::gauge!("delta_queue_depth", st.order.len() as f64);
        drop(st);
        self.notify.notify_one();
    }

    fn try_pop(&self) -> Result<Option<Batch<K>>, ()> {
        let mut st = self.lock();
        while let Some(slot) = st.order.pop_front() {
            let batch = match slot {
                Slot::Key(key) => st.items.remove(&key).map(|deltas| Batch::Deltas { key, deltas }),
                Slot::Barrier(id) => st.barriers.remove(&id).map(|keep| Batch::Synced { keep }),
            };
            if batch.is_some() {
                metrics::gauge!("delta_queue_depth", st.order.len() as f64);
                return Ok(batch);
            }
        }
        if st.closed {
            Ok(None)
        } else {
            Err(())
        }
    }

    /// Next key's delta list (or sync barrier). Waits while empty; `None` once
    /// closed and drained.
    pub async fn pop(&self) -> Option<Batch<K>> {
        loop {
            let notified = self.notify.notified();
            match self.try_pop() {
                Ok(next) => return next,
                Err(()) => notified.await,
            }
        }
    }

    /// Stop accepting pushes and wake any waiting popper.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool { self.lock().closed }

    /// Pending slots (keys plus barriers).
    pub fn len(&self) -> usize { self.lock().order.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// True once a sync barrier has been fully applied by the processor.
    pub fn has_synced(&self) -> bool { *self.synced.borrow() }

    pub fn mark_synced(&self) {
        self.synced.send_replace(true);
    }

    pub fn subscribe_synced(&self) -> watch::Receiver<bool> { self.synced.subscribe() }
}
