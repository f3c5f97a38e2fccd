//! Kratix kubehub: `ObjectStore` over a live API server (discovery, CRUD, list+watch).

#![forbid(unsafe_code)]

use std::sync::Mutex;
use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use kratix_core::{LabelSelector, ObjectKey, ResourceKind};
use kratix_store::{ObjectStore, StoreError, StoreResult};
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    core::{ApiResource, DynamicObject},
    discovery::{self, Scope},
    runtime::{watcher::{self, Event}, WatchStreamExt},
    Client,
};
use metrics::{counter, histogram};
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub async fn get_kube_client() -> Result<Client> {
    Ok(Client::try_default().await?)
}

fn map_err(e: kube::Error) -> StoreError {
    match e {
        kube::Error::Api(ae) => match ae.code {
            404 => StoreError::NotFound(ae.message),
            409 if ae.reason == "AlreadyExists" => StoreError::AlreadyExists(ae.message),
            409 => StoreError::Conflict(ae.message),
            400 | 422 => StoreError::Invalid(ae.message),
            429 | 500..=599 => StoreError::Unavailable(ae.message),
            _ => StoreError::Internal(format!("{} ({}): {}", ae.reason, ae.code, ae.message)),
        },
        kube::Error::Discovery(d) => StoreError::NotFound(d.to_string()),
        other => StoreError::Unavailable(other.to_string()),
    }
}

/// Live store. API resources are resolved through discovery and cached once found.
pub struct KubeStore {
    client: Client,
    resources: Mutex<FxHashMap<ResourceKind, (ApiResource, bool)>>,
}

impl KubeStore {
    pub fn new(client: Client) -> Self { Self { client, resources: Mutex::new(FxHashMap::default()) } }

    pub async fn try_default() -> Result<Self> { Ok(Self::new(get_kube_client().await?)) }

    fn cached(&self, kind: &ResourceKind) -> Option<(ApiResource, bool)> {
        self.resources.lock().unwrap_or_else(|p| p.into_inner()).get(kind).cloned()
    }

    /// Resolve a kind to its API resource and scope. Unknown kinds are `NotFound`.
    async fn resolve(&self, kind: &ResourceKind) -> StoreResult<(ApiResource, bool)> {
        if let Some(hit) = self.cached(kind) { return Ok(hit); }
        let (ar, caps) = discovery::pinned_kind(&self.client, &kind.gvk()).await.map_err(map_err)?;
        let namespaced = matches!(caps.scope, Scope::Namespaced);
        debug!(kind = %kind, plural = %ar.plural, namespaced, "resolved api resource");
        self.resources.lock().unwrap_or_else(|p| p.into_inner()).insert(kind.clone(), (ar.clone(), namespaced));
        Ok((ar, namespaced))
    }

    async fn api_for(&self, kind: &ResourceKind, namespace: Option<&str>) -> StoreResult<Api<DynamicObject>> {
        let (ar, namespaced) = self.resolve(kind).await?;
        Ok(match (namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        })
    }

    /// Single-object access on a namespaced kind needs a namespace.
    async fn api_for_key(&self, kind: &ResourceKind, key: &ObjectKey) -> StoreResult<Api<DynamicObject>> {
        let (_, namespaced) = self.resolve(kind).await?;
        if namespaced && key.namespace.is_none() {
            return Err(StoreError::Invalid(format!("{} {}: namespace required for namespaced kind", kind, key)));
        }
        self.api_for(kind, key.namespace()).await
    }
}

fn observe(op: &'static str, t0: Instant) {
    counter!("store_op_total", 1u64, "op" => op);
    histogram!("store_op_latency_ms", t0.elapsed().as_secs_f64() * 1000.0, "op" => op);
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get(&self, kind: &ResourceKind, key: &ObjectKey) -> StoreResult<DynamicObject> {
        let t0 = Instant::now();
        let api = self.api_for_key(kind, key).await?;
        let res = api.get(&key.name).await.map_err(map_err);
        observe("get", t0);
        res
    }

    async fn list(&self, kind: &ResourceKind, namespace: Option<&str>, selector: &LabelSelector) -> StoreResult<Vec<DynamicObject>> {
        let t0 = Instant::now();
        let api = self.api_for(kind, namespace).await?;
        let mut lp = ListParams::default();
        if !selector.is_empty() {
            lp = lp.labels(&selector.to_string());
        }
        let res = api.list(&lp).await.map(|l| l.items).map_err(map_err);
        observe("list", t0);
        res
    }

    async fn create(&self, kind: &ResourceKind, obj: &DynamicObject) -> StoreResult<DynamicObject> {
        let t0 = Instant::now();
        let key = ObjectKey::of(&obj.metadata);
        let api = self.api_for_key(kind, &key).await?;
        let res = api.create(&PostParams::default(), obj).await.map_err(map_err);
        observe("create", t0);
        res
    }

    async fn update(&self, kind: &ResourceKind, obj: &DynamicObject) -> StoreResult<DynamicObject> {
        let t0 = Instant::now();
        let key = ObjectKey::of(&obj.metadata);
        if obj.metadata.resource_version.is_none() {
            return Err(StoreError::Invalid(format!("{} {}: update requires resourceVersion", kind, key)));
        }
        let api = self.api_for_key(kind, &key).await?;
        let res = api.replace(&key.name, &PostParams::default(), obj).await.map_err(map_err);
        observe("update", t0);
        res
    }

    async fn update_status(&self, kind: &ResourceKind, key: &ObjectKey, status: serde_json::Value) -> StoreResult<DynamicObject> {
        let t0 = Instant::now();
        let api = self.api_for_key(kind, key).await?;
        let patch = serde_json::json!({ "status": status });
        let res = api.patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&patch)).await.map_err(map_err);
        observe("update_status", t0);
        res
    }

    async fn delete(&self, kind: &ResourceKind, key: &ObjectKey) -> StoreResult<()> {
        let t0 = Instant::now();
        let api = self.api_for_key(kind, key).await?;
        let res = api.delete(&key.name, &DeleteParams::default()).await.map(|_| ()).map_err(map_err);
        observe("delete", t0);
        res
    }

    async fn is_served(&self, kind: &ResourceKind) -> StoreResult<bool> {
        if self.cached(kind).is_some() { return Ok(true); }
        match self.resolve(kind).await {
            Ok(_) => Ok(true),
            Err(StoreError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn watch(&self, kind: &ResourceKind, tx: mpsc::Sender<ObjectKey>) -> StoreResult<()> {
        let api = self.api_for(kind, None).await?;
        let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
        futures::pin_mut!(stream);
        info!(kind = %kind, "watcher started");
        while let Some(ev) = stream.next().await {
            let keys: Vec<ObjectKey> = match ev {
                Ok(Event::Applied(o)) | Ok(Event::Deleted(o)) => vec![ObjectKey::of(&o.metadata)],
                Ok(Event::Restarted(list)) => {
                    debug!(kind = %kind, count = list.len(), "watch restart");
                    list.iter().map(|o| ObjectKey::of(&o.metadata)).collect()
                }
                Err(e) => {
                    warn!(kind = %kind, error = %e, "watch error; backing off");
                    continue;
                }
            };
            for key in keys {
                if tx.send(key).await.is_err() {
                    debug!(kind = %kind, "watch receiver dropped");
                    return Ok(());
                }
            }
        }
        warn!(kind = %kind, "watcher stream ended");
        Ok(())
    }
}
