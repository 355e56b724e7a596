#![forbid(unsafe_code)]

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use mirra_core::{MirraResult, ObjectKey};

/// What to do with a key after a successful pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Done,
    RequeueAfter(Duration),
}

/// Level-triggered reconcile of one key. Implementations read the current
/// state from the store; they are never told what changed.
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    async fn reconcile(&self, key: &ObjectKey) -> MirraResult<Action>;
}

#[async_trait]
impl<R: Reconciler + ?Sized> Reconciler for std::sync::Arc<R> {
    async fn reconcile(&self, key: &ObjectKey) -> MirraResult<Action> { (**self).reconcile(key).await }
}

/// Closure-backed reconciler, see [`reconciler_fn`].
pub struct FnReconciler<F> {
    f: F,
}

/// Adapt `async |key| -> MirraResult<Action>` into a [`Reconciler`].
pub fn reconciler_fn<F, Fut>(f: F) -> FnReconciler<F>
where
    F: Fn(ObjectKey) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = MirraResult<Action>> + Send + 'static,
{
    FnReconciler { f }
}

#[async_trait]
impl<F, Fut> Reconciler for FnReconciler<F>
where
    F: Fn(ObjectKey) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = MirraResult<Action>> + Send + 'static,
{
    async fn reconcile(&self, key: &ObjectKey) -> MirraResult<Action> { (self.f)(key.clone()).await }
}
