//! Kubernetes list/watch adapter over `kube`'s dynamic API.

#![forbid(unsafe_code)]

use std::ops::Deref;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::StreamExt;
use kube::{
    api::{Api, ListParams, WatchEvent as KubeEvent, WatchParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client,
};
use mirra_core::{MirraError, MirraResult, ObjectKey, Resource, ResourceVersion};
use mirra_store::index::{index_fn, IndexFn};
use serde::Serialize;
use tracing::{debug, info};

use crate::source::{ListPage, ListWatch, WatchEvent, WatchStream};

pub const LABEL_INDEX: &str = "label";

/// A dynamically typed cluster object as stored in the cache.
#[derive(Debug, Clone)]
pub struct KubeObject(pub DynamicObject);

impl Deref for KubeObject {
    type Target = DynamicObject;
    fn deref(&self) -> &DynamicObject { &self.0 }
}

impl Resource for KubeObject {
    fn key(&self) -> ObjectKey {
        ObjectKey { namespace: self.0.metadata.namespace.clone(), name: self.0.metadata.name.clone().unwrap_or_default() }
    }

    fn resource_version(&self) -> Option<ResourceVersion> { self.0.metadata.resource_version.clone().map(ResourceVersion) }
}

/// Index objects by `key=value` for each label.
pub fn labels_index() -> IndexFn<KubeObject> {
    index_fn(|o: &KubeObject| {
        Ok(o.metadata
            .labels
            .iter()
            .flatten()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect())
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredResource {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub namespaced: bool,
}

impl DiscoveredResource {
    pub fn gvk_key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }
}

/// Discover served resources (incl. CRDs).
pub async fn discover(client: Client) -> Result<Vec<DiscoveredResource>> {
    let discovery = Discovery::new(client).run().await?;
    let mut out = Vec::new();
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            out.push(DiscoveredResource {
                group: ar.group.clone(),
                version: ar.version.clone(),
                kind: ar.kind.clone(),
                namespaced: matches!(caps.scope, Scope::Namespaced),
            });
        }
    }
    out.sort_by(|a, b| a.group.cmp(&b.group).then(a.version.cmp(&b.version)).then(a.kind.cmp(&b.kind)));
    Ok(out)
}

pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] => Ok(GroupVersionKind { group: String::new(), version: version.to_string(), kind: kind.to_string() }),
        [group, version, kind] => Ok(GroupVersionKind { group: (*group).to_string(), version: (*version).to_string(), kind: (*kind).to_string() }),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                return Ok((ar.clone(), matches!(caps.scope, Scope::Namespaced)));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

fn map_kube_err(e: kube::Error) -> MirraError {
    match e {
        kube::Error::Api(resp) if resp.code == 410 => MirraError::stale(resp.message),
        kube::Error::Api(resp) if resp.code == 404 => MirraError::not_found(resp.message),
        other => MirraError::transient(other.to_string()),
    }
}

/// [`ListWatch`] over one resource kind, optionally scoped to a namespace
/// and filtered by label/field selectors.
pub struct KubeSource {
    api: Api<DynamicObject>,
    label_selector: Option<String>,
    field_selector: Option<String>,
}

impl KubeSource {
    pub fn new(api: Api<DynamicObject>) -> Self { Self { api, label_selector: None, field_selector: None } }

    /// Resolve a GVK key ("v1/ConfigMap", "apps/v1/Deployment") via discovery.
    pub async fn for_gvk(client: Client, gvk_key: &str, namespace: Option<&str>) -> Result<Self> {
        let gvk = parse_gvk_key(gvk_key)?;
        let (ar, namespaced) = find_api_resource(client.clone(), &gvk).await?;
        let api: Api<DynamicObject> = match (namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(client, ns, &ar),
            _ => Api::all_with(client, &ar),
        };
        info!(gvk = %gvk_key, ns = ?namespace, namespaced, "kube source resolved");
        Ok(Self::new(api))
    }

    pub fn with_label_selector(mut self, selector: &str) -> Self {
        self.label_selector = Some(selector.to_string());
        self
    }

    pub fn with_field_selector(mut self, selector: &str) -> Self {
        self.field_selector = Some(selector.to_string());
        self
    }

    fn list_params(&self) -> ListParams {
        let mut lp = ListParams::default();
        if let Some(l) = &self.label_selector { lp = lp.labels(l); }
        if let Some(f) = &self.field_selector { lp = lp.fields(f); }
        lp
    }

    fn watch_params(&self) -> WatchParams {
        let mut wp = WatchParams::default();
        if let Some(l) = &self.label_selector { wp = wp.labels(l); }
        if let Some(f) = &self.field_selector { wp = wp.fields(f); }
        wp
    }
}

fn convert(ev: kube::Result<KubeEvent<DynamicObject>>) -> MirraResult<WatchEvent<KubeObject>> {
    match ev {
        Ok(KubeEvent::Added(o)) => Ok(WatchEvent::Added(KubeObject(o))),
        Ok(KubeEvent::Modified(o)) => Ok(WatchEvent::Modified(KubeObject(o))),
        Ok(KubeEvent::Deleted(o)) => Ok(WatchEvent::Deleted(KubeObject(o))),
        Ok(KubeEvent::Bookmark(b)) => Ok(WatchEvent::Bookmark(ResourceVersion(b.metadata.resource_version))),
        Ok(KubeEvent::Error(resp)) if resp.code == 410 => Err(MirraError::stale(resp.message)),
        Ok(KubeEvent::Error(resp)) => Err(MirraError::transient(resp.message)),
        Err(e) => Err(map_kube_err(e)),
    }
}

#[async_trait]
impl ListWatch<KubeObject> for KubeSource {
    async fn list(&self) -> MirraResult<ListPage<KubeObject>> {
        let list = self.api.list(&self.list_params()).await.map_err(map_kube_err)?;
        let resource_version = ResourceVersion(list.metadata.resource_version.clone().unwrap_or_default());
        debug!(items = list.items.len(), rv = %resource_version, "kube list");
        Ok(ListPage { resource_version, items: list.items.into_iter().map(KubeObject).collect() })
    }

    async fn watch(&self, from: &ResourceVersion) -> MirraResult<WatchStream<KubeObject>> {
        let stream = self.api.watch(&self.watch_params(), from.as_str()).await.map_err(map_kube_err)?;
        Ok(stream.map(convert).boxed())
    }
}
