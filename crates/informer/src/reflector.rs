#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex, PoisonError};

use futures::StreamExt;
use mirra_core::{Backoff, Config, Delta, MirraError, MirraResult, Resource, ResourceVersion};
use mirra_store::DeltaQueue;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::source::{ListWatch, WatchEvent};

/// Why one list+watch cycle ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CycleEnd {
    StreamClosed,
    RelistDue,
}

/// Bridges a [`ListWatch`] into a [`DeltaQueue`]: list, sync barrier, watch,
/// and relist whenever the watch ends.
pub struct Reflector<K, L> {
    source: Arc<L>,
    queue: Arc<DeltaQueue<K>>,
    config: Config,
    cursor: Mutex<ResourceVersion>,
}

impl<K: Resource, L: ListWatch<K>> Reflector<K, L> {
    pub fn new(source: Arc<L>, queue: Arc<DeltaQueue<K>>, config: Config) -> Self {
        Self { source, queue, config, cursor: Mutex::new(ResourceVersion::default()) }
    }

    /// Version of the last listing or watch event seen.
    pub fn last_resource_version(&self) -> ResourceVersion {
        self.cursor.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn advance(&self, rv: ResourceVersion) {
        *self.cursor.lock().unwrap_or_else(PoisonError::into_inner) = rv;
    }

    /// Run until `stop` fires. List and watch failures are retried forever.
    pub async fn run(&self, stop: CancellationToken) {
        let mut backoff = self.config.watch_backoff();
        info!("reflector started");
        loop {
            let outcome = tokio::select! {
                _ = stop.cancelled() => break,
                r = self.list_and_watch(&mut backoff) => r,
            };
            let delay = backoff.next_delay();
            match outcome {
                Ok(CycleEnd::StreamClosed) => debug!(delay_ms = %delay.as_millis(), "watch closed; relisting"),
                Ok(CycleEnd::RelistDue) => debug!(delay_ms = %delay.as_millis(), "periodic relist"),
                Err(MirraError::StaleVersion(msg)) => {
                    info!(reason = %msg, delay_ms = %delay.as_millis(), "watch cursor too old; relisting");
                }
                Err(e) => {
                    warn!(error = %e, attempt = backoff.attempts(), delay_ms = %delay.as_millis(), "list/watch failed; backing off");
                    metrics::counter!("reflector_errors_total", 1u64, "kind" => e.label());
                }
            }
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        info!(rv = %self.last_resource_version(), "reflector stopped");
    }

    async fn list_and_watch(&self, backoff: &mut Backoff) -> MirraResult<CycleEnd> {
        let page = self.source.list().await?;
        metrics::counter!("reflector_relists_total", 1u64);
        let rv = page.resource_version;
        info!(items = page.items.len(), rv = %rv, "listed");
        self.queue.replace(page.items.into_iter().map(Arc::new).collect());
        self.advance(rv.clone());

        let mut stream = self.source.watch(&rv).await?;
        let relist_at = self.config.relist_every.map(|d| Instant::now() + d);
        // Reset only once the watch has delivered an event or lasted a full relist period.
        let mut healthy = false;
        loop {
            let next = match relist_at {
                Some(at) => tokio::select! {
                    ev = stream.next() => ev,
                    _ = tokio::time::sleep_until(at) => {
                        backoff.reset();
                        return Ok(CycleEnd::RelistDue);
                    }
                },
                None => stream.next().await,
            };
            match next {
                None => return Ok(CycleEnd::StreamClosed),
                Some(Err(e)) => return Err(e),
                Some(Ok(ev)) => {
                    if !healthy {
                        healthy = true;
                        backoff.reset();
                    }
                    self.handle(ev);
                }
            }
        }
    }

    fn handle(&self, ev: WatchEvent<K>) {
        let (delta, rv): (Delta<K>, Option<ResourceVersion>) = match ev {
            WatchEvent::Added(o) => {
                let rv = o.resource_version();
                (Delta::added(o), rv)
            }
            WatchEvent::Modified(o) => {
                let rv = o.resource_version();
                (Delta::updated(o), rv)
            }
            WatchEvent::Deleted(o) => {
                let rv = o.resource_version();
                (Delta::deleted(o), rv)
            }
            WatchEvent::Bookmark(rv) => {
                self.advance(rv);
                return;
            }
        };
        metrics::counter!("reflector_watch_events_total", 1u64, "kind" => delta.kind.as_str());
        self.queue.push(delta);
        if let Some(rv) = rv {
            self.advance(rv);
        }
    }
}
