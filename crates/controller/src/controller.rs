#![forbid(unsafe_code)]

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use mirra_core::{Config, ObjectKey, Resource};
use mirra_store::EventHandler;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::queue::{Outcome, WorkQueue};
use crate::reconciler::Reconciler;

/// Pool of workers draining a [`WorkQueue`] through one [`Reconciler`].
pub struct Controller<R> {
    reconciler: Arc<R>,
    queue: Arc<WorkQueue>,
    workers: usize,
}

impl<R: Reconciler> Controller<R> {
    pub fn new(reconciler: R, config: &Config) -> Self {
        Self {
            reconciler: Arc::new(reconciler),
            queue: Arc::new(WorkQueue::new(config.retry_base, config.retry_max)),
            workers: config.workers.max(1),
        }
    }

    pub fn queue(&self) -> Arc<WorkQueue> { Arc::clone(&self.queue) }

    pub fn schedule(&self, key: ObjectKey) -> bool { self.queue.schedule(key) }

    /// Subscriber that schedules the key of every added, updated or deleted object.
    pub fn enqueue_handler(&self) -> Arc<EnqueueHandler> { Arc::new(EnqueueHandler { queue: Arc::clone(&self.queue) }) }

    /// Run workers until `stop` fires, then shut the queue and wait for
    /// in-flight passes to finish.
    pub async fn run(&self, stop: CancellationToken) {
        let mut handles = Vec::with_capacity(self.workers);
        for id in 0..self.workers {
            let queue = Arc::clone(&self.queue);
            let reconciler = Arc::clone(&self.reconciler);
            handles.push(tokio::spawn(worker(id, queue, reconciler)));
        }
        info!(workers = self.workers, "controller started");
        stop.cancelled().await;
        self.queue.shutdown();
        for h in handles {
            if let Err(e) = h.await {
                error!(error = %e, "worker task failed");
            }
        }
        info!("controller stopped");
    }
}

async fn worker<R: Reconciler>(id: usize, queue: Arc<WorkQueue>, reconciler: Arc<R>) {
    while let Some(key) = queue.pull().await {
        let outcome = match AssertUnwindSafe(reconciler.reconcile(&key)).catch_unwind().await {
            Ok(r) => Outcome::from_result(&r),
            Err(_) => {
                error!(worker = id, key = %key, "reconcile panicked; retrying");
                metrics::counter!("reconcile_total", 1u64, "result" => "panic");
                Outcome::Transient
            }
        };
        queue.done(&key, outcome);
    }
}

/// [`EventHandler`] feeding object keys into a [`WorkQueue`].
pub struct EnqueueHandler {
    queue: Arc<WorkQueue>,
}

impl<K: Resource> EventHandler<K> for EnqueueHandler {
    fn on_add(&self, obj: &Arc<K>) { self.queue.schedule(obj.key()); }
    fn on_update(&self, _old: &Arc<K>, new: &Arc<K>) { self.queue.schedule(new.key()); }
    fn on_delete(&self, obj: &Arc<K>) { self.queue.schedule(obj.key()); }
}
