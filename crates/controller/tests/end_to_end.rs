#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc::{unbounded, UnboundedReceiver};
use futures::stream::{self, StreamExt};
use mirra_controller::{reconciler_fn, Action, Controller, MetricsLayer, ReconcilerBuilder, TracingLayer};
use mirra_core::{Config, MirraError, MirraResult, ObjectKey, Resource, ResourceVersion};
use mirra_informer::{Informer, ListPage, ListWatch, WatchEvent, WatchStream};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
struct Obj {
    name: &'static str,
    rv: u64,
}

impl Resource for Obj {
    fn key(&self) -> ObjectKey { ObjectKey::namespaced("ns", self.name) }
    fn resource_version(&self) -> Option<ResourceVersion> { Some(ResourceVersion(self.rv.to_string())) }
}

struct OneShot {
    items: Vec<Obj>,
    events: Mutex<Option<UnboundedReceiver<MirraResult<WatchEvent<Obj>>>>>,
}

#[async_trait]
impl ListWatch<Obj> for OneShot {
    async fn list(&self) -> MirraResult<ListPage<Obj>> {
        Ok(ListPage { resource_version: ResourceVersion::from("1"), items: self.items.clone() })
    }

    async fn watch(&self, _from: &ResourceVersion) -> MirraResult<WatchStream<Obj>> {
        match self.events.lock().unwrap().take() {
            Some(rx) => Ok(rx.boxed()),
            None => Ok(stream::pending().boxed()),
        }
    }
}

#[tokio::test(start_paused = true)]
async fn list_watch_reconcile_requeue() {
    let t0 = Instant::now();
    let (tx, rx) = unbounded();
    tx.unbounded_send(Ok(WatchEvent::Modified(Obj { name: "a", rv: 2 }))).unwrap();
    let source = OneShot { items: vec![Obj { name: "a", rv: 1 }, Obj { name: "b", rv: 1 }], events: Mutex::new(Some(rx)) };
    let informer = Arc::new(Informer::new(source, Config::default()));

    let seen: Arc<Mutex<Vec<(String, u64, Duration)>>> = Arc::default();
    let reconciler = {
        let (store, seen) = (informer.store(), Arc::clone(&seen));
        reconciler_fn(move |key: ObjectKey| {
            let (store, seen) = (Arc::clone(&store), Arc::clone(&seen));
            async move {
                let obj = store.get(&key).ok_or_else(|| MirraError::not_found(key.to_string()))?;
                seen.lock().unwrap().push((key.name.clone(), obj.rv, t0.elapsed()));
                if key.name == "a" {
                    Ok(Action::RequeueAfter(Duration::from_secs(10)))
                } else {
                    Ok(Action::Done)
                }
            }
        })
    };
    let reconciler = ReconcilerBuilder::new(reconciler).layer(MetricsLayer).layer(TracingLayer).build();
    let controller = Arc::new(Controller::new(reconciler, &Config { workers: 2, ..Config::default() }));
    informer.subscribe(controller.enqueue_handler());

    let stop = CancellationToken::new();
    let informer_task = {
        let (informer, stop) = (Arc::clone(&informer), stop.clone());
        tokio::spawn(async move { informer.run(stop).await })
    };
    let controller_task = {
        let (controller, stop) = (Arc::clone(&controller), stop.clone());
        tokio::spawn(async move { controller.run(stop).await })
    };

    tokio::time::sleep(Duration::from_secs(25)).await;
    stop.cancel();
    informer_task.await.unwrap().unwrap();
    controller_task.await.unwrap();

    let seen = seen.lock().unwrap().clone();
    let b: Vec<_> = seen.iter().filter(|(n, _, _)| n == "b").collect();
    assert_eq!(b.len(), 1, "b reconciled more than once: {seen:?}");

    let a: Vec<_> = seen.iter().filter(|(n, _, _)| n == "a").collect();
    assert!(a.iter().all(|(_, _, at)| *at < Duration::from_secs(1) || *at >= Duration::from_secs(10)), "{seen:?}");
    let requeued: Vec<Duration> = a.iter().map(|(_, _, at)| *at).filter(|at| *at >= Duration::from_secs(1)).collect();
    assert_eq!(requeued.len(), 2, "{seen:?}");
    assert!(requeued[0] >= Duration::from_secs(10) && requeued[0] < Duration::from_secs(11));
    assert!(requeued[1] >= Duration::from_secs(20) && requeued[1] < Duration::from_secs(21));
    assert!(a.iter().filter(|(_, _, at)| *at >= Duration::from_secs(1)).all(|(_, rv, _)| *rv == 2));
}
