#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mirra_core::{Config, MirraError, MirraResult, Resource, ResourceVersion};
use mirra_store::{DeltaQueue, EventHandler, IndexFn, Processor, Store, SubscriptionHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::reflector::Reflector;
use crate::source::ListWatch;

/// A synchronized, indexed local mirror of one remote collection.
///
/// Register indexes and subscribers, then call [`Informer::run`] once; it
/// returns after `stop` fires and the pipeline has drained.
pub struct Informer<K, L> {
    store: Arc<Store<K>>,
    queue: Arc<DeltaQueue<K>>,
    processor: Arc<Processor<K>>,
    reflector: Reflector<K, L>,
    started: AtomicBool,
}

impl<K: Resource, L: ListWatch<K> + 'static> Informer<K, L> {
    pub fn new(source: L, config: Config) -> Self {
        let store = Arc::new(Store::new());
        let queue = Arc::new(DeltaQueue::new());
        let processor = Arc::new(Processor::new(Arc::clone(&store)));
        let reflector = Reflector::new(Arc::new(source), Arc::clone(&queue), config);
        Self { store, queue, processor, reflector, started: AtomicBool::new(false) }
    }

    /// Read side of the cache.
    pub fn store(&self) -> Arc<Store<K>> { Arc::clone(&self.store) }

    pub fn register_index(&self, name: &str, f: IndexFn<K>) -> MirraResult<()> { self.store.register_index(name, f) }

    pub fn subscribe(&self, handler: Arc<dyn EventHandler<K>>) -> SubscriptionHandle { self.processor.subscribe(handler) }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool { self.processor.unsubscribe(handle) }

    pub fn has_synced(&self) -> bool { self.queue.has_synced() }

    pub fn last_resource_version(&self) -> ResourceVersion { self.reflector.last_resource_version() }

    /// Wait until the first listing has been applied; false on timeout.
    pub async fn wait_for_sync(&self, timeout: Duration) -> bool {
        let mut rx = self.queue.subscribe_synced();
        let deadline = Instant::now() + timeout;
        while !*rx.borrow_and_update() {
            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => continue,
                _ => return *rx.borrow(),
            }
        }
        true
    }

    pub async fn run(&self, stop: CancellationToken) -> MirraResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(MirraError::fatal("informer already ran"));
        }
        let processor = Arc::clone(&self.processor);
        let queue = Arc::clone(&self.queue);
        let mut proc_task = tokio::spawn(async move { processor.run(&queue).await });

        // The processor returns only after the queue closes; sooner means it died.
        let early = tokio::select! {
            _ = self.reflector.run(stop) => None,
            joined = &mut proc_task => Some(joined),
        };

        self.queue.close();
        let (joined, died) = match early {
            Some(joined) => (joined, true),
            None => (proc_task.await, false),
        };
        self.store.clear();
        match joined {
            Ok(()) if !died => {
                info!("informer stopped");
                Ok(())
            }
            Ok(()) => {
                error!("processor exited before the informer was stopped");
                Err(MirraError::fatal("processor exited early"))
            }
            Err(e) => {
                error!(error = %e, "processor task failed");
                Err(MirraError::fatal(format!("processor task failed: {}", e)))
            }
        }
    }
}
