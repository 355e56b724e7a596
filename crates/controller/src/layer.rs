//! Reconciler middleware, composed statically: each [`Layer`] wraps the
//! reconciler below it in a new concrete type.

#![forbid(unsafe_code)]

use std::time::Duration;

use async_trait::async_trait;
use mirra_core::{MirraError, MirraResult, ObjectKey};
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};

use crate::reconciler::{Action, Reconciler};

pub trait Layer<R> {
    type Reconciler: Reconciler;
    fn layer(&self, inner: R) -> Self::Reconciler;
}

/// Stacks layers outward: the last `.layer(..)` runs first.
pub struct ReconcilerBuilder<R> {
    inner: R,
}

impl<R: Reconciler> ReconcilerBuilder<R> {
    pub fn new(inner: R) -> Self { Self { inner } }

    pub fn layer<L: Layer<R>>(self, layer: L) -> ReconcilerBuilder<L::Reconciler> {
        ReconcilerBuilder { inner: layer.layer(self.inner) }
    }

    pub fn build(self) -> R { self.inner }
}

fn result_label(r: &MirraResult<Action>) -> &'static str {
    match r {
        Ok(Action::Done) => "ok",
        Ok(Action::RequeueAfter(_)) => "requeue",
        Err(e) => e.label(),
    }
}

/// Runs each pass inside a `reconcile` span keyed by the object.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLayer;

pub struct Traced<R> {
    inner: R,
}

impl<R: Reconciler> Layer<R> for TracingLayer {
    type Reconciler = Traced<R>;
    fn layer(&self, inner: R) -> Traced<R> { Traced { inner } }
}

#[async_trait]
impl<R: Reconciler> Reconciler for Traced<R> {
    async fn reconcile(&self, key: &ObjectKey) -> MirraResult<Action> {
        let span = info_span!("reconcile", key = %key);
        async {
            let start = Instant::now();
            let r = self.inner.reconcile(key).await;
            let took_ms = start.elapsed().as_millis();
            match &r {
                Ok(action) => debug!(?action, took_ms = %took_ms, "reconciled"),
                Err(e) => warn!(error = %e, took_ms = %took_ms, "reconcile failed"),
            }
            r
        }
        .instrument(span)
        .await
    }
}

/// Records `reconcile_total{result}` and `reconcile_duration_ms`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsLayer;

pub struct Metered<R> {
    inner: R,
}

impl<R: Reconciler> Layer<R> for MetricsLayer {
    type Reconciler = Metered<R>;
    fn layer(&self, inner: R) -> Metered<R> { Metered { inner } }
}

#[async_trait]
impl<R: Reconciler> Reconciler for Metered<R> {
    async fn reconcile(&self, key: &ObjectKey) -> MirraResult<Action> {
        let start = Instant::now();
        let r = self.inner.reconcile(key).await;
        metrics::histogram!("reconcile_duration_ms", start.elapsed().as_secs_f64() * 1000.0);
        metrics::counter!("reconcile_total", 1u64, "result" => result_label(&r));
        r
    }
}

/// Fails a pass with `Transient` when it runs longer than `limit`.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutLayer {
    limit: Duration,
}

impl TimeoutLayer {
    pub fn new(limit: Duration) -> Self { Self { limit } }
}

pub struct TimedOut<R> {
    inner: R,
    limit: Duration,
}

impl<R: Reconciler> Layer<R> for TimeoutLayer {
    type Reconciler = TimedOut<R>;
    fn layer(&self, inner: R) -> TimedOut<R> { TimedOut { inner, limit: self.limit } }
}

#[async_trait]
impl<R: Reconciler> Reconciler for TimedOut<R> {
    async fn reconcile(&self, key: &ObjectKey) -> MirraResult<Action> {
        match tokio::time::timeout(self.limit, self.inner.reconcile(key)).await {
            Ok(r) => r,
            Err(_) => Err(MirraError::transient(format!("reconcile of {} timed out after {:?}", key, self.limit))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconciler::reconciler_fn;

    #[tokio::test(start_paused = true)]
    async fn timeout_maps_to_transient() {
        let slow = reconciler_fn(|_k| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Action::Done)
        });
        let r = ReconcilerBuilder::new(slow)
            .layer(MetricsLayer)
            .layer(TimeoutLayer::new(Duration::from_secs(1)))
            .layer(TracingLayer)
            .build();
        let out = r.reconcile(&ObjectKey::namespaced("ns", "a")).await;
        assert!(matches!(out, Err(MirraError::Transient(_))));
    }

    #[tokio::test]
    async fn layers_pass_results_through() {
        let r = ReconcilerBuilder::new(reconciler_fn(|k: ObjectKey| async move {
            if k.name == "gone" {
                Err(MirraError::not_found("gone"))
            } else {
                Ok(Action::RequeueAfter(Duration::from_secs(3)))
            }
        }))
        .layer(TracingLayer)
        .layer(MetricsLayer)
        .build();
        assert_eq!(r.reconcile(&ObjectKey::cluster("x")).await, Ok(Action::RequeueAfter(Duration::from_secs(3))));
        assert_eq!(r.reconcile(&ObjectKey::cluster("gone")).await, Err(MirraError::not_found("gone")));
    }
}
