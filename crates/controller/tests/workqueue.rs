#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mirra_controller::{reconciler_fn, Action, Controller, Outcome, WorkQueue};
use mirra_core::{Config, MirraError, ObjectKey};
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;

fn key(n: &str) -> ObjectKey { ObjectKey::namespaced("ns", n) }

fn queue() -> WorkQueue { WorkQueue::new(Duration::from_millis(5), Duration::from_millis(40)) }

async fn idle(q: &WorkQueue) -> bool { timeout(Duration::from_secs(600), q.pull()).await.is_err() }

#[tokio::test(start_paused = true)]
async fn schedule_while_processing_gives_exactly_one_more_pass() {
    let q = queue();
    q.schedule(key("a"));
    let k = q.pull().await.unwrap();
    assert!(q.schedule(key("a")));
    assert!(q.schedule(key("a")));
    assert!(q.schedule(key("a")));
    q.done(&k, Outcome::Success);

    assert_eq!(q.pull().await, Some(key("a")));
    q.done(&k, Outcome::Success);
    assert!(idle(&q).await);
    assert!(q.is_empty());
}

#[tokio::test(start_paused = true)]
async fn dirty_pass_ignores_requested_delay() {
    let q = queue();
    q.schedule(key("a"));
    let k = q.pull().await.unwrap();
    q.schedule(key("a"));
    q.done(&k, Outcome::RequeueAfter(Duration::from_secs(30)));

    let start = Instant::now();
    assert_eq!(q.pull().await, Some(key("a")));
    assert_eq!(start.elapsed(), Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn backoff_grows_caps_and_resets_after_success() {
    let q = queue();
    let k = key("a");
    q.schedule(k.clone());
    assert_eq!(q.pull().await, Some(k.clone()));

    let mut seen = Vec::new();
    for _ in 0..6 {
        q.done(&k, Outcome::Transient);
        let start = Instant::now();
        assert_eq!(q.pull().await, Some(k.clone()));
        seen.push(start.elapsed());
    }
    assert_eq!(q.failures(&k), 6);
    assert!(seen.windows(2).all(|w| w[0] <= w[1] + Duration::from_millis(1)), "non-monotonic: {seen:?}");
    assert!(seen[0] >= Duration::from_millis(5));
    assert!(seen[3] >= Duration::from_millis(40));
    assert!(seen.iter().all(|d| *d < Duration::from_millis(45)), "cap exceeded: {seen:?}");

    q.done(&k, Outcome::Success);
    assert_eq!(q.failures(&k), 0);
    q.schedule(k.clone());
    assert_eq!(q.pull().await, Some(k.clone()));
    q.done(&k, Outcome::Transient);
    let start = Instant::now();
    assert_eq!(q.pull().await, Some(k.clone()));
    assert!(start.elapsed() < Duration::from_millis(10));
}

#[tokio::test(start_paused = true)]
async fn not_found_counts_as_success() {
    let q = queue();
    let k = key("a");
    q.schedule(k.clone());
    q.pull().await;
    q.done(&k, Outcome::Transient);
    q.pull().await;
    q.done(&k, Outcome::NotFound);
    assert!(q.is_empty());
    assert_eq!(q.failures(&k), 0);
    assert!(idle(&q).await);
}

#[tokio::test(start_paused = true)]
async fn fatal_drops_the_key() {
    let q = queue();
    let k = key("a");
    q.schedule(k.clone());
    q.pull().await;
    q.done(&k, Outcome::Fatal);
    assert!(q.is_empty());
    assert!(idle(&q).await);
}

#[tokio::test(start_paused = true)]
async fn schedule_cuts_a_requeue_short_but_not_a_backoff() {
    let q = queue();
    let k = key("a");
    q.schedule(k.clone());
    q.pull().await;
    q.done(&k, Outcome::RequeueAfter(Duration::from_secs(10)));
    let start = Instant::now();
    q.schedule(k.clone());
    assert_eq!(q.pull().await, Some(k.clone()));
    assert_eq!(start.elapsed(), Duration::ZERO);

    q.done(&k, Outcome::Transient);
    let start = Instant::now();
    q.schedule(k.clone());
    assert_eq!(q.pull().await, Some(k.clone()));
    assert!(start.elapsed() >= Duration::from_millis(5));
}

#[tokio::test(start_paused = true)]
async fn requeue_fires_after_its_delay() {
    let q = queue();
    let k = key("a");
    q.schedule(k.clone());
    q.pull().await;
    q.done(&k, Outcome::RequeueAfter(Duration::from_secs(10)));
    let start = Instant::now();
    assert_eq!(q.pull().await, Some(k));
    assert!(start.elapsed() >= Duration::from_secs(10));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn a_key_is_never_reconciled_concurrently() {
    let in_flight: Arc<Mutex<HashSet<ObjectKey>>> = Arc::default();
    let overlaps = Arc::new(AtomicUsize::new(0));
    let passes = Arc::new(AtomicUsize::new(0));
    let reconciler = {
        let (in_flight, overlaps, passes) = (Arc::clone(&in_flight), Arc::clone(&overlaps), Arc::clone(&passes));
        reconciler_fn(move |k: ObjectKey| {
            let (in_flight, overlaps, passes) = (Arc::clone(&in_flight), Arc::clone(&overlaps), Arc::clone(&passes));
            async move {
                let fresh = in_flight.lock().unwrap().insert(k.clone());
                if !fresh {
                    overlaps.fetch_add(1, Ordering::SeqCst);
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
                in_flight.lock().unwrap().remove(&k);
                passes.fetch_add(1, Ordering::SeqCst);
                if k.name == "flaky" {
                    Err(MirraError::transient("flaky"))
                } else {
                    Ok(Action::Done)
                }
            }
        })
    };
    let config = Config { workers: 4, retry_base: Duration::from_millis(1), retry_max: Duration::from_millis(4), ..Config::default() };
    let controller = Arc::new(Controller::new(reconciler, &config));
    let stop = CancellationToken::new();
    let run = {
        let (controller, stop) = (Arc::clone(&controller), stop.clone());
        tokio::spawn(async move { controller.run(stop).await })
    };

    for round in 0..50 {
        for n in ["a", "b", "c", "flaky"] {
            controller.schedule(key(n));
        }
        if round % 5 == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    stop.cancel();
    run.await.unwrap();

    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    assert!(passes.load(Ordering::SeqCst) >= 4);
    assert!(!controller.schedule(key("a")));
}

#[tokio::test(start_paused = true)]
async fn panicking_reconcile_is_retried() {
    let calls = Arc::new(AtomicUsize::new(0));
    let reconciler = {
        let calls = Arc::clone(&calls);
        reconciler_fn(move |_k: ObjectKey| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    panic!("boom");
                }
                Ok(Action::Done)
            }
        })
    };
    let config = Config { workers: 1, retry_base: Duration::from_millis(5), ..Config::default() };
    let controller = Arc::new(Controller::new(reconciler, &config));
    let stop = CancellationToken::new();
    let run = {
        let (controller, stop) = (Arc::clone(&controller), stop.clone());
        tokio::spawn(async move { controller.run(stop).await })
    };
    controller.schedule(key("a"));
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(controller.queue().is_empty());
    stop.cancel();
    run.await.unwrap();
}
