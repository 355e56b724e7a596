#![forbid(unsafe_code)]

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use mirra_core::{IndexValues, MirraError, MirraResult, ObjectKey, Resource};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, warn};

use crate::index::IndexFn;
use crate::processor::panic_message;

/// index value -> keys currently producing it
type Postings = FxHashMap<String, FxHashSet<ObjectKey>>;

struct Inner<K> {
    items: FxHashMap<ObjectKey, Arc<K>>,
    indexers: FxHashMap<String, IndexFn<K>>,
    indices: FxHashMap<String, Postings>,
    /// Last index values recorded per key, per index. Drives incremental patching.
    memberships: FxHashMap<ObjectKey, FxHashMap<String, IndexValues>>,
}

/// Latest known object per key, plus secondary indexes kept in step with every write.
///
/// Readers get `Arc` clones; nothing hands out references into the maps.
pub struct Store<K> {
    inner: RwLock<Inner<K>>,
}

impl<K: Resource> Default for Store<K> {
    fn default() -> Self { Self::new() }
}

impl<K: Resource> Store<K> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                items: FxHashMap::default(),
                indexers: FxHashMap::default(),
                indices: FxHashMap::default(),
                memberships: FxHashMap::default(),
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner<K>> { self.inner.read().unwrap_or_else(PoisonError::into_inner) }

    fn write(&self) -> RwLockWriteGuard<'_, Inner<K>> { self.inner.write().unwrap_or_else(PoisonError::into_inner) }

    /// Register a named index. Must happen before the first object is stored.
    pub fn register_index(&self, name: &str, f: IndexFn<K>) -> MirraResult<()> {
        let mut g = self.write();
        if g.indexers.contains_key(name) {
            return Err(MirraError::fatal(format!("index {} registered twice", name)));
        }
        if !g.items.is_empty() {
            return Err(MirraError::fatal(format!("index {} registered after the store was populated", name)));
        }
        g.indexers.insert(name.to_string(), f);
        g.indices.insert(name.to_string(), Postings::default());
        debug!(index = %name, "index registered");
        Ok(())
    }

    pub fn add(&self, obj: Arc<K>) -> Option<Arc<K>> { self.upsert(obj) }

    pub fn update(&self, obj: Arc<K>) -> Option<Arc<K>> { self.upsert(obj) }

    fn upsert(&self, obj: Arc<K>) -> Option<Arc<K>> {
        let key = obj.key();
        let mut g = self.write();
        let Inner { items, indexers, indices, memberships } = &mut *g;
        // Evaluate every index function before any posting is touched.
        let mut computed: Vec<(String, IndexValues)> = Vec::with_capacity(indexers.len());
        for (name, f) in indexers.iter() {
            let mut values = match catch_unwind(AssertUnwindSafe(|| f(&obj))) {
                Ok(Ok(v)) => v,
                Ok(Err(e)) => {
                    warn!(index = %name, key = %key, error = %e, "index function failed; object left out of index");
                    metrics::counter!("store_index_errors_total", 1u64, "index" => name.clone());
                    IndexValues::new()
                }
                Err(p) => {
                    warn!(index = %name, key = %key, panic = %panic_message(p.as_ref()), "index function panicked; object left out of index");
                    metrics::counter!("store_index_errors_total", 1u64, "index" => name.clone());
                    IndexValues::new()
                }
            };
            values.sort_unstable();
            values.dedup();
            computed.push((name.clone(), values));
        }

        let old_sets = memberships.remove(&key).unwrap_or_default();
        let mut new_sets: FxHashMap<String, IndexValues> = FxHashMap::default();
        let empty = IndexValues::new();
        for (name, values) in computed {
            let postings = indices.entry(name.clone()).or_default();
            let old = old_sets.get(&name).unwrap_or(&empty);
            for v in old.iter().filter(|v| !values.contains(v)) {
                unlink(postings, v, &key);
            }
            for v in values.iter().filter(|v| !old.contains(v)) {
                postings.entry(v.clone()).or_default().insert(key.clone());
            }
            if !values.is_empty() {
                new_sets.insert(name, values);
            }
        }
        if !new_sets.is_empty() {
            memberships.insert(key.clone(), new_sets);
        }
        let prev = items.insert(key, obj);
        metrics::gauge!("store_objects", items.len() as f64);
        prev
    }

    /// Remove `key` from the store and from every index it participates in.
    pub fn delete(&self, key: &ObjectKey) -> Option<Arc<K>> {
        let mut g = self.write();
        let Inner { items, indices, memberships, .. } = &mut *g;
        if let Some(sets) = memberships.remove(key) {
            for (name, values) in sets.iter() {
                if let Some(postings) = indices.get_mut(name) {
                    for v in values.iter() {
                        unlink(postings, v, key);
                    }
                }
            }
        }
        let prev = items.remove(key);
        metrics::gauge!("store_objects", items.len() as f64);
        prev
    }

    pub fn get(&self, key: &ObjectKey) -> Option<Arc<K>> { self.read().items.get(key).cloned() }

    pub fn contains(&self, key: &ObjectKey) -> bool { self.read().items.contains_key(key) }

    /// Point-in-time copy of every cached object.
    pub fn list(&self) -> Vec<Arc<K>> { self.read().items.values().cloned().collect() }

    pub fn list_keys(&self) -> Vec<ObjectKey> {
        let mut keys: Vec<ObjectKey> = self.read().items.keys().cloned().collect();
        keys.sort_unstable();
        keys
    }

    pub fn len(&self) -> usize { self.read().items.len() }

    pub fn is_empty(&self) -> bool { self.read().items.is_empty() }

    /// Objects whose index function for `index` produced `value`, ordered by key.
    pub fn by_index(&self, index: &str, value: &str) -> MirraResult<Vec<Arc<K>>> {
        let g = self.read();
        let keys = sorted_postings(&g, index, value)?;
        Ok(keys.iter().filter_map(|k| g.items.get(k).cloned()).collect())
    }

    pub fn index_keys(&self, index: &str, value: &str) -> MirraResult<Vec<ObjectKey>> {
        let g = self.read();
        sorted_postings(&g, index, value)
    }

    /// Every value currently present in `index`.
    pub fn index_values(&self, index: &str) -> MirraResult<Vec<String>> {
        let g = self.read();
        let postings = g.indices.get(index).ok_or_else(|| MirraError::not_found(format!("no index named {}", index)))?;
        let mut values: Vec<String> = postings.keys().cloned().collect();
        values.sort_unstable();
        Ok(values)
    }

    /// Drop every object; index registrations survive.
    pub fn clear(&self) {
        let mut g = self.write();
        g.items.clear();
        g.memberships.clear();
        for postings in g.indices.values_mut() {
            postings.clear();
        }
        metrics::gauge!("store_objects", 0.0);
    }
}

fn unlink(postings: &mut Postings, value: &str, key: &ObjectKey) {
    if let Some(set) = postings.get_mut(value) {
        set.remove(key);
        if set.is_empty() {
            postings.remove(value);
        }
    }
}

fn sorted_postings<K>(g: &Inner<K>, index: &str, value: &str) -> MirraResult<Vec<ObjectKey>> {
    let postings = g.indices.get(index).ok_or_else(|| MirraError::not_found(format!("no index named {}", index)))?;
    let mut keys: Vec<ObjectKey> = postings.get(value).map(|s| s.iter().cloned().collect()).unwrap_or_default();
    keys.sort_unstable();
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{by_namespace, index_fn, NAMESPACE_INDEX};
    use mirra_core::ResourceVersion;
    use smallvec::smallvec;

    #[derive(Debug, Clone, PartialEq)]
    struct Pod {
        ns: String,
        name: String,
        tags: Vec<&'static str>,
    }

    impl Resource for Pod {
        fn key(&self) -> ObjectKey { ObjectKey::namespaced(&self.ns, &self.name) }
        fn resource_version(&self) -> Option<ResourceVersion> { None }
    }

    fn pod(ns: &str, name: &str, tags: &[&'static str]) -> Arc<Pod> {
        Arc::new(Pod { ns: ns.into(), name: name.into(), tags: tags.to_vec() })
    }

    fn tagged_store() -> Store<Pod> {
        let s = Store::new();
        s.register_index("tag", index_fn(|p: &Pod| Ok(p.tags.iter().map(|t| t.to_string()).collect()))).unwrap();
        s.register_index(NAMESPACE_INDEX, by_namespace()).unwrap();
        s
    }

    #[test]
    fn update_moves_index_membership() {
        let s = tagged_store();
        s.add(pod("ns", "a", &["web", "blue"]));
        assert_eq!(s.index_keys("tag", "blue").unwrap(), vec![ObjectKey::namespaced("ns", "a")]);
        let prev = s.update(pod("ns", "a", &["web", "green"]));
        assert_eq!(prev.unwrap().tags, vec!["web", "blue"]);
        assert!(s.index_keys("tag", "blue").unwrap().is_empty());
        assert_eq!(s.index_keys("tag", "green").unwrap().len(), 1);
        assert_eq!(s.index_values("tag").unwrap(), vec!["green".to_string(), "web".to_string()]);
    }

    #[test]
    fn delete_removes_from_every_index() {
        let s = tagged_store();
        s.add(pod("ns", "a", &["web"]));
        s.add(pod("other", "b", &["web"]));
        assert!(s.delete(&ObjectKey::namespaced("ns", "a")).is_some());
        assert!(s.delete(&ObjectKey::namespaced("ns", "a")).is_none());
        let web: Vec<String> = s.by_index("tag", "web").unwrap().iter().map(|p| p.name.clone()).collect();
        assert_eq!(web, vec!["b"]);
        assert!(s.by_index(NAMESPACE_INDEX, "ns").unwrap().is_empty());
        assert_eq!(s.index_values(NAMESPACE_INDEX).unwrap(), vec!["other".to_string()]);
    }

    #[test]
    fn failing_index_keeps_object_in_store() {
        let s: Store<Pod> = Store::new();
        s.register_index(
            "picky",
            index_fn(|p: &Pod| if p.tags.is_empty() { anyhow::bail!("untagged") } else { Ok(smallvec![p.tags[0].to_string()]) }),
        )
        .unwrap();
        s.add(pod("ns", "bare", &[]));
        assert!(s.get(&ObjectKey::namespaced("ns", "bare")).is_some());
        assert!(s.index_values("picky").unwrap().is_empty());
    }

    #[test]
    fn panicking_index_leaves_no_stale_postings() {
        let s: Store<Pod> = Store::new();
        s.register_index(
            "tag",
            index_fn(|p: &Pod| {
                if p.tags.contains(&"boom") {
                    panic!("cannot index {}", p.name);
                }
                Ok(p.tags.iter().map(|t| t.to_string()).collect())
            }),
        )
        .unwrap();
        s.register_index(NAMESPACE_INDEX, by_namespace()).unwrap();
        let a = ObjectKey::namespaced("ns", "a");

        s.add(pod("ns", "a", &["web"]));
        assert_eq!(s.index_keys("tag", "web").unwrap(), vec![a.clone()]);

        let prev = s.update(pod("ns", "a", &["boom"]));
        assert_eq!(prev.unwrap().tags, vec!["web"]);
        assert_eq!(s.get(&a).unwrap().tags, vec!["boom"]);
        assert!(s.index_keys("tag", "web").unwrap().is_empty());
        assert!(s.index_values("tag").unwrap().is_empty());
        assert_eq!(s.index_keys(NAMESPACE_INDEX, "ns").unwrap(), vec![a.clone()]);

        s.update(pod("ns", "a", &["web"]));
        assert_eq!(s.index_keys("tag", "web").unwrap(), vec![a.clone()]);
        s.delete(&a);
        assert!(s.is_empty());
        assert!(s.index_values("tag").unwrap().is_empty());
        assert!(s.index_values(NAMESPACE_INDEX).unwrap().is_empty());
    }

    #[test]
    fn registration_errors_are_fatal() {
        let s = tagged_store();
        assert!(matches!(s.register_index("tag", by_namespace()), Err(MirraError::Fatal(_))));
        s.add(pod("ns", "a", &[]));
        assert!(matches!(s.register_index("late", by_namespace()), Err(MirraError::Fatal(_))));
        assert!(matches!(s.by_index("missing", "x"), Err(MirraError::NotFound(_))));
    }

    #[test]
    fn list_is_a_detached_snapshot() {
        let s = tagged_store();
        s.add(pod("ns", "a", &[]));
        let snap = s.list();
        s.add(pod("ns", "b", &[]));
        s.clear();
        assert_eq!(snap.len(), 1);
        assert!(s.is_empty());
        assert!(s.index_values(NAMESPACE_INDEX).unwrap().is_empty());
    }
}
