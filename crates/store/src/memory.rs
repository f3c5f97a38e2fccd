//! In-RAM store with API server semantics: resource versions, soft deletion
//! behind finalizers, a type directory fed by CRDs, and a change feed.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kratix_core::{from_dynamic, kinds, LabelSelector, ObjectKey, ResourceKind};
use kube::core::DynamicObject;
use metrics::counter;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{finalizers, ObjectStore, StoreError, StoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Get,
    List,
    Create,
    Update,
    UpdateStatus,
    Delete,
}

impl Op {
    fn as_str(self) -> &'static str {
        match self {
            Op::Get => "get",
            Op::List => "list",
            Op::Create => "create",
            Op::Update => "update",
            Op::UpdateStatus => "update_status",
            Op::Delete => "delete",
        }
    }
}

#[derive(Default)]
struct State {
    objects: FxHashMap<ResourceKind, BTreeMap<ObjectKey, DynamicObject>>,
    /// Kinds whose CRD exists but which are not established yet.
    pending: FxHashSet<ResourceKind>,
    rv: u64,
    calls: FxHashMap<(Op, ResourceKind), usize>,
    failures: FxHashMap<(Op, ResourceKind), StoreError>,
}

pub struct MemoryStore {
    state: Mutex<State>,
    served: ArcSwap<FxHashSet<ResourceKind>>,
    events: broadcast::Sender<(ResourceKind, ObjectKey)>,
    defer_establish: bool,
}

impl Default for MemoryStore {
    fn default() -> Self { Self::new() }
}

impl MemoryStore {
    /// CRDs are established the moment they are created.
    pub fn new() -> Self { Self::build(false) }

    /// CRDs stay unserved until [`MemoryStore::establish`] is called.
    pub fn with_deferred_establish() -> Self { Self::build(true) }

    fn build(defer_establish: bool) -> Self {
        let (events, _) = broadcast::channel(1024);
        let served: FxHashSet<ResourceKind> = kinds::builtin().into_iter().collect();
        Self { state: Mutex::new(State::default()), served: ArcSwap::from_pointee(served), events, defer_establish }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Publish a pending kind to the type directory. Returns false if it was not pending.
    pub fn establish(&self, kind: &ResourceKind) -> bool {
        let was_pending = self.lock().pending.remove(kind);
        if was_pending { self.serve(kind.clone()); }
        was_pending
    }

    fn serve(&self, kind: ResourceKind) {
        debug!(kind = %kind, "kind established");
        self.served.rcu(|cur| {
            let mut next = (**cur).clone();
            next.insert(kind.clone());
            next
        });
    }

    /// Make every `op` on `kind` fail with `err` until [`MemoryStore::clear_failures`].
    pub fn fail_on(&self, op: Op, kind: &ResourceKind, err: StoreError) {
        self.lock().failures.insert((op, kind.clone()), err);
    }

    pub fn clear_failures(&self) { self.lock().failures.clear(); }

    /// Number of `op` calls made against `kind`, failed ones included.
    pub fn calls(&self, op: Op, kind: &ResourceKind) -> usize {
        self.lock().calls.get(&(op, kind.clone())).copied().unwrap_or(0)
    }

    /// Synchronous snapshot of every stored record of a kind.
    pub fn dump(&self, kind: &ResourceKind) -> Vec<DynamicObject> {
        self.lock().objects.get(kind).map(|m| m.values().cloned().collect()).unwrap_or_default()
    }

    fn enter(&self, st: &mut State, op: Op, kind: &ResourceKind) -> StoreResult<()> {
        counter!("store_op_total", 1u64, "op" => op.as_str());
        *st.calls.entry((op, kind.clone())).or_insert(0) += 1;
        if let Some(err) = st.failures.get(&(op, kind.clone())) {
            return Err(err.clone());
        }
        if !self.served.load().contains(kind) {
            return Err(StoreError::NotFound(format!("kind {} is not served", kind)));
        }
        Ok(())
    }

    fn emit(&self, kind: &ResourceKind, key: &ObjectKey) {
        // No receivers simply means nobody watches this store yet.
        let _ = self.events.send((kind.clone(), key.clone()));
    }

    fn next_rv(st: &mut State) -> String {
        st.rv += 1;
        st.rv.to_string()
    }

    /// Served kinds declared by a CustomResourceDefinition record.
    fn kinds_of_crd(obj: &DynamicObject) -> StoreResult<Vec<ResourceKind>> {
        let crd: CustomResourceDefinition = from_dynamic(obj)?;
        Ok(crd
            .spec
            .versions
            .iter()
            .filter(|v| v.served)
            .map(|v| ResourceKind::new(crd.spec.group.clone(), v.name.clone(), crd.spec.names.kind.clone()))
            .collect())
    }

    fn keys_of(&self, kind: &ResourceKind) -> Vec<ObjectKey> {
        self.lock().objects.get(kind).map(|m| m.keys().cloned().collect()).unwrap_or_default()
    }
}

fn not_found(kind: &ResourceKind, key: &ObjectKey) -> StoreError {
    StoreError::NotFound(format!("{} {}", kind, key))
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, kind: &ResourceKind, key: &ObjectKey) -> StoreResult<DynamicObject> {
        let mut st = self.lock();
        self.enter(&mut st, Op::Get, kind)?;
        st.objects.get(kind).and_then(|m| m.get(key)).cloned().ok_or_else(|| not_found(kind, key))
    }

    async fn list(&self, kind: &ResourceKind, namespace: Option<&str>, selector: &LabelSelector) -> StoreResult<Vec<DynamicObject>> {
        let mut st = self.lock();
        self.enter(&mut st, Op::List, kind)?;
        let empty = BTreeMap::new();
        Ok(st
            .objects
            .get(kind)
            .map(|m| {
                m.iter()
                    .filter(|(k, _)| namespace.map(|ns| k.namespace() == Some(ns)).unwrap_or(true))
                    .filter(|(_, o)| selector.matches(o.metadata.labels.as_ref().unwrap_or(&empty)))
                    .map(|(_, o)| o.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn create(&self, kind: &ResourceKind, obj: &DynamicObject) -> StoreResult<DynamicObject> {
        let key = ObjectKey::of(&obj.metadata);
        if key.name.is_empty() {
            return Err(StoreError::Invalid(format!("{} create without metadata.name", kind)));
        }
        if obj.metadata.resource_version.is_some() {
            return Err(StoreError::Invalid(format!("{} {}: resourceVersion must not be set on create", kind, key)));
        }
        let new_kinds = if *kind == kinds::crd() { Self::kinds_of_crd(obj)? } else { Vec::new() };

        let stored = {
            let mut st = self.lock();
            self.enter(&mut st, Op::Create, kind)?;
            if st.objects.get(kind).map(|m| m.contains_key(&key)).unwrap_or(false) {
                return Err(StoreError::AlreadyExists(format!("{} {}", kind, key)));
            }
            let mut stored = obj.clone();
            stored.metadata.resource_version = Some(Self::next_rv(&mut st));
            stored.metadata.uid = Some(Uuid::new_v4().to_string());
            stored.metadata.creation_timestamp = Some(Time(chrono::Utc::now()));
            stored.metadata.generation = Some(1);
            stored.metadata.deletion_timestamp = None;
            st.objects.entry(kind.clone()).or_default().insert(key.clone(), stored.clone());
            if self.defer_establish {
                st.pending.extend(new_kinds.iter().cloned());
            }
            stored
        };
        if !self.defer_establish {
            for k in new_kinds {
                self.serve(k);
            }
        }
        self.emit(kind, &key);
        Ok(stored)
    }

    async fn update(&self, kind: &ResourceKind, obj: &DynamicObject) -> StoreResult<DynamicObject> {
        let key = ObjectKey::of(&obj.metadata);
        let stored = {
            let mut st = self.lock();
            self.enter(&mut st, Op::Update, kind)?;
            let current = st.objects.get(kind).and_then(|m| m.get(&key)).cloned().ok_or_else(|| not_found(kind, &key))?;
            let Some(expected) = obj.metadata.resource_version.as_deref() else {
                return Err(StoreError::Invalid(format!("{} {}: update requires resourceVersion", kind, key)));
            };
            if current.metadata.resource_version.as_deref() != Some(expected) {
                return Err(StoreError::Conflict(format!(
                    "{} {}: resourceVersion {} is stale (current {})",
                    kind,
                    key,
                    expected,
                    current.metadata.resource_version.as_deref().unwrap_or("-")
                )));
            }
            let mut next = obj.clone();
            next.metadata.uid = current.metadata.uid.clone();
            next.metadata.creation_timestamp = current.metadata.creation_timestamp.clone();
            next.metadata.deletion_timestamp = current.metadata.deletion_timestamp.clone();
            next.metadata.generation = current.metadata.generation;
            // status is only writable through update_status
            match current.data.get("status") {
                Some(s) => { next.data["status"] = s.clone(); }
                None => {
                    if let Some(m) = next.data.as_object_mut() { m.remove("status"); }
                }
            }
            next.metadata.resource_version = Some(Self::next_rv(&mut st));
            let finalized = finalizers::is_deleting(&next) && next.metadata.finalizers.as_ref().map(|f| f.is_empty()).unwrap_or(true);
            if let Some(m) = st.objects.get_mut(kind) {
                if finalized {
                    debug!(kind = %kind, key = %key, "last finalizer removed; record gone");
                    m.remove(&key);
                } else {
                    m.insert(key.clone(), next.clone());
                }
            }
            next
        };
        self.emit(kind, &key);
        Ok(stored)
    }

    async fn update_status(&self, kind: &ResourceKind, key: &ObjectKey, status: serde_json::Value) -> StoreResult<DynamicObject> {
        let stored = {
            let mut st = self.lock();
            self.enter(&mut st, Op::UpdateStatus, kind)?;
            let rv = Self::next_rv(&mut st);
            let obj = st.objects.get_mut(kind).and_then(|m| m.get_mut(key)).ok_or_else(|| not_found(kind, key))?;
            if !obj.data.is_object() {
                obj.data = serde_json::Value::Object(Default::default());
            }
            obj.data["status"] = status;
            obj.metadata.resource_version = Some(rv);
            obj.clone()
        };
        self.emit(kind, key);
        Ok(stored)
    }

    async fn delete(&self, kind: &ResourceKind, key: &ObjectKey) -> StoreResult<()> {
        {
            let mut st = self.lock();
            self.enter(&mut st, Op::Delete, kind)?;
            let has_finalizers = {
                let obj = st.objects.get(kind).and_then(|m| m.get(key)).ok_or_else(|| not_found(kind, key))?;
                obj.metadata.finalizers.as_ref().map(|f| !f.is_empty()).unwrap_or(false)
            };
            if has_finalizers {
                let rv = Self::next_rv(&mut st);
                if let Some(obj) = st.objects.get_mut(kind).and_then(|m| m.get_mut(key)) {
                    if obj.metadata.deletion_timestamp.is_some() {
                        return Ok(());
                    }
                    obj.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
                    obj.metadata.resource_version = Some(rv);
                }
            } else if let Some(m) = st.objects.get_mut(kind) {
                m.remove(key);
            }
        }
        self.emit(kind, key);
        Ok(())
    }

    async fn is_served(&self, kind: &ResourceKind) -> StoreResult<bool> {
        Ok(self.served.load().contains(kind))
    }

    async fn watch(&self, kind: &ResourceKind, tx: mpsc::Sender<ObjectKey>) -> StoreResult<()> {
        // Subscribe before listing so nothing between the two is missed.
        let mut rx = self.events.subscribe();
        for key in self.keys_of(kind) {
            if tx.send(key).await.is_err() { return Ok(()); }
        }
        loop {
            match rx.recv().await {
                Ok((k, key)) if &k == kind => {
                    if tx.send(key).await.is_err() { return Ok(()); }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(kind = %kind, skipped = n, "watch lagged; relisting");
                    for key in self.keys_of(kind) {
                        if tx.send(key).await.is_err() { return Ok(()); }
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            }
        }
    }
}
