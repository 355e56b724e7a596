//! Mirra informer: list/watch boundary, reflector loop and the informer that
//! wires reflector, delta queue, processor and store together.

#![forbid(unsafe_code)]

mod informer;
pub mod cluster;
mod reflector;
mod source;

pub use informer::Informer;
pub use reflector::Reflector;
pub use source::{ListPage, ListWatch, WatchEvent, WatchStream};
