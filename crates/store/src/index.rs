//! Index functions: pure `object -> set of index values` classifiers.

#![forbid(unsafe_code)]

use std::sync::Arc;

use mirra_core::{IndexValues, Resource};
use smallvec::smallvec;

/// A failing index function drops the object from that index only.
pub type IndexFn<K> = Arc<dyn Fn(&K) -> anyhow::Result<IndexValues> + Send + Sync>;

pub const NAMESPACE_INDEX: &str = "namespace";

/// Index by namespace; cluster-scoped objects land under the empty string.
pub fn by_namespace<K: Resource>() -> IndexFn<K> {
    Arc::new(|obj: &K| {
        let ns = obj.key().namespace.unwrap_or_default();
        Ok(smallvec![ns])
    })
}

/// Wrap a closure as an [`IndexFn`].
pub fn index_fn<K, F>(f: F) -> IndexFn<K>
where
    F: Fn(&K) -> anyhow::Result<IndexValues> + Send + Sync + 'static,
{
    Arc::new(f)
}
