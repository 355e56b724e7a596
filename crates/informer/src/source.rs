#![forbid(unsafe_code)]

use async_trait::async_trait;
use futures::stream::BoxStream;
use mirra_core::{MirraResult, ResourceVersion};

/// Result of a full enumeration.
#[derive(Debug, Clone)]
pub struct ListPage<K> {
    /// Collection version to start watching from.
    pub resource_version: ResourceVersion,
    pub items: Vec<K>,
}

/// One incremental change reported by a watch.
#[derive(Debug, Clone)]
pub enum WatchEvent<K> {
    Added(K),
    Modified(K),
    Deleted(K),
    /// Progress marker: only advances the cursor.
    Bookmark(ResourceVersion),
}

pub type WatchStream<K> = BoxStream<'static, MirraResult<WatchEvent<K>>>;

/// Remote collection the reflector mirrors.
///
/// `watch` streams end on close or error; `MirraError::StaleVersion` (from
/// either call or inside the stream) means the cursor is too old and a full
/// relist is required.
#[async_trait]
pub trait ListWatch<K>: Send + Sync {
    async fn list(&self) -> MirraResult<ListPage<K>>;
    async fn watch(&self, from: &ResourceVersion) -> MirraResult<WatchStream<K>>;
}
