//! Mirra controller: per-key work queue with dedup and backoff, a worker pool
//! running a level-triggered [`Reconciler`], and composable reconciler layers.

#![forbid(unsafe_code)]

mod controller;
pub mod layer;
mod queue;
mod reconciler;

pub use controller::{Controller, EnqueueHandler};
pub use layer::{Layer, MetricsLayer, ReconcilerBuilder, TimeoutLayer, TracingLayer};
pub use queue::{Outcome, WorkQueue};
pub use reconciler::{reconciler_fn, Action, FnReconciler, Reconciler};
