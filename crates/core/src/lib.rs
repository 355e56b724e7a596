//! Mirra core types: object identity, deltas and the shared error taxonomy.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub mod backoff;
pub mod config;
mod error;

pub use backoff::Backoff;
pub use config::Config;
pub use error::{MirraError, MirraResult};

/// Identity of a cached object: optional namespace plus name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self { namespace: namespace.map(|s| s.to_string()), name: name.to_string() }
    }

    pub fn namespaced(namespace: &str, name: &str) -> Self { Self::new(Some(namespace), name) }

    pub fn cluster(name: &str) -> Self { Self::new(None, name) }

    /// Parse `ns/name` or `name`.
    pub fn parse(s: &str) -> Self {
        match s.split_once('/') {
            Some((ns, name)) => Self::namespaced(ns, name),
            None => Self::cluster(s),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) if !ns.is_empty() => write!(f, "{}/{}", ns, self.name),
            _ => f.write_str(&self.name),
        }
    }
}

/// Opaque change cursor. Only comparable within one object's history, and only
/// when both sides are numeric.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ResourceVersion(pub String);

impl ResourceVersion {
    pub fn new(s: impl Into<String>) -> Self { Self(s.into()) }

    pub fn as_str(&self) -> &str { &self.0 }

    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    /// `Some(true)` when `self` strictly precedes `other`; `None` when incomparable.
    pub fn is_older_than(&self, other: &ResourceVersion) -> Option<bool> {
        let a = self.0.parse::<u64>().ok()?;
        let b = other.0.parse::<u64>().ok()?;
        Some(a < b)
    }
}

impl fmt::Display for ResourceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl From<&str> for ResourceVersion {
    fn from(s: &str) -> Self { Self(s.to_string()) }
}

/// Anything the cache can mirror.
pub trait Resource: Clone + Send + Sync + 'static {
    fn key(&self) -> ObjectKey;
    fn resource_version(&self) -> Option<ResourceVersion>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum DeltaKind {
    Added,
    Updated,
    Deleted,
    Synced,
}

impl DeltaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeltaKind::Added => "added",
            DeltaKind::Updated => "updated",
            DeltaKind::Deleted => "deleted",
            DeltaKind::Synced => "synced",
        }
    }
}

/// One observed change to an object.
#[derive(Debug)]
pub struct Delta<K> {
    pub kind: DeltaKind,
    pub object: Arc<K>,
}

impl<K> Clone for Delta<K> {
    fn clone(&self) -> Self { Self { kind: self.kind, object: Arc::clone(&self.object) } }
}

impl<K: Resource> Delta<K> {
    pub fn new(kind: DeltaKind, object: impl Into<Arc<K>>) -> Self { Self { kind, object: object.into() } }
    pub fn added(object: impl Into<Arc<K>>) -> Self { Self::new(DeltaKind::Added, object) }
    pub fn updated(object: impl Into<Arc<K>>) -> Self { Self::new(DeltaKind::Updated, object) }
    pub fn deleted(object: impl Into<Arc<K>>) -> Self { Self::new(DeltaKind::Deleted, object) }

    pub fn key(&self) -> ObjectKey { self.object.key() }
}

/// Values produced by an index function for one object.
pub type IndexValues = SmallVec<[String; 4]>;

pub mod prelude {
    pub use super::{Backoff, Config, Delta, DeltaKind, IndexValues, MirraError, MirraResult, ObjectKey, Resource, ResourceVersion};
}
