//! Kratix store: the authoritative object store seam plus an in-RAM implementation.
//!
//! Every record is addressed by `(ResourceKind, ObjectKey)`. Updates are
//! compare-and-swap on `metadata.resourceVersion`; a stale write fails with
//! [`StoreError::Conflict`] and is never applied.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use kratix_core::{CoreError, LabelSelector, ObjectKey, ResourceKind};
use kube::core::DynamicObject;
use tokio::sync::mpsc;

mod memory;

pub use memory::{MemoryStore, Op};

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool { matches!(self, StoreError::NotFound(_)) }
    pub fn is_already_exists(&self) -> bool { matches!(self, StoreError::AlreadyExists(_)) }
    pub fn is_conflict(&self) -> bool { matches!(self, StoreError::Conflict(_)) }
}

impl From<CoreError> for StoreError {
    fn from(e: CoreError) -> Self { StoreError::Invalid(e.to_string()) }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Strongly consistent record store with optimistic concurrency.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, kind: &ResourceKind, key: &ObjectKey) -> StoreResult<DynamicObject>;

    /// List records of a kind, optionally within one namespace, filtered by labels.
    async fn list(&self, kind: &ResourceKind, namespace: Option<&str>, selector: &LabelSelector) -> StoreResult<Vec<DynamicObject>>;

    async fn create(&self, kind: &ResourceKind, obj: &DynamicObject) -> StoreResult<DynamicObject>;

    /// Conditional write: `obj.metadata.resourceVersion` must match the stored one.
    async fn update(&self, kind: &ResourceKind, obj: &DynamicObject) -> StoreResult<DynamicObject>;

    /// Replace the `status` stanza only.
    async fn update_status(&self, kind: &ResourceKind, key: &ObjectKey, status: serde_json::Value) -> StoreResult<DynamicObject>;

    /// Records holding finalizers are only marked for deletion.
    async fn delete(&self, kind: &ResourceKind, key: &ObjectKey) -> StoreResult<()>;

    /// Whether the type directory serves this kind yet.
    async fn is_served(&self, kind: &ResourceKind) -> StoreResult<bool>;

    /// Emit the key of every existing record, then of every change, until the receiver goes away.
    async fn watch(&self, kind: &ResourceKind, tx: mpsc::Sender<ObjectKey>) -> StoreResult<()>;
}

/// Outcome of an idempotent create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Created {
    New,
    Existing,
}

/// Conveniences shared by every store.
#[async_trait]
pub trait ObjectStoreExt: ObjectStore {
    async fn get_opt(&self, kind: &ResourceKind, key: &ObjectKey) -> StoreResult<Option<DynamicObject>> {
        match self.get(kind, key).await {
            Ok(o) => Ok(Some(o)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Create, treating an existing record of the same name as success.
    async fn create_if_absent(&self, kind: &ResourceKind, obj: &DynamicObject) -> StoreResult<Created> {
        match self.create(kind, obj).await {
            Ok(_) => Ok(Created::New),
            Err(e) if e.is_already_exists() => Ok(Created::Existing),
            Err(e) => Err(e),
        }
    }
}

impl<S: ObjectStore + ?Sized> ObjectStoreExt for S {}

/// Finalizer helpers over `DynamicObject` metadata.
pub mod finalizers {
    use kube::core::DynamicObject;

    pub fn contains(obj: &DynamicObject, finalizer: &str) -> bool {
        obj.metadata.finalizers.as_ref().map(|f| f.iter().any(|x| x == finalizer)).unwrap_or(false)
    }

    /// Returns false when already present.
    pub fn add(obj: &mut DynamicObject, finalizer: &str) -> bool {
        if contains(obj, finalizer) { return false; }
        obj.metadata.finalizers.get_or_insert_with(Vec::new).push(finalizer.to_string());
        true
    }

    /// Returns false when absent.
    pub fn remove(obj: &mut DynamicObject, finalizer: &str) -> bool {
        let Some(list) = obj.metadata.finalizers.as_mut() else { return false };
        let before = list.len();
        list.retain(|x| x != finalizer);
        before != list.len()
    }

    pub fn is_deleting(obj: &DynamicObject) -> bool { obj.metadata.deletion_timestamp.is_some() }
}
