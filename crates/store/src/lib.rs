//! Mirra store: indexed object cache, coalescing delta queue and the processor
//! that applies one to the other while fanning changes out to subscribers.

#![forbid(unsafe_code)]

pub mod index;
mod processor;
mod queue;
mod store;

pub use index::{IndexFn, NAMESPACE_INDEX};
pub use processor::{EventHandler, HandlerFns, Processor, SubscriptionHandle};
pub use queue::{Batch, DeltaQueue};
pub use store::Store;
