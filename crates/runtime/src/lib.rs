//! Kratix runtime: the reconciliation substrate.
//!
//! Reconcilers are registered per [`ResourceKind`] at any point while the
//! process runs. Each registration gets its own watch pump and worker pool;
//! a key is never handed to two workers at once.

#![forbid(unsafe_code)]

use std::time::Duration;

use async_trait::async_trait;
use kratix_core::{CoreError, ObjectKey, ResourceKind};
use kratix_store::StoreError;

mod manager;
mod queue;

pub use manager::{Manager, ManagerConfig};
pub use queue::WorkQueue;

/// What the substrate should do with a key after a successful pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Wait for the next change.
    Done,
    /// Reconcile again after the delay, even without a change.
    RequeueAfter(Duration),
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("invalid: {0}")]
    Invalid(String),
}

impl From<CoreError> for ReconcileError {
    fn from(e: CoreError) -> Self { ReconcileError::Invalid(e.to_string()) }
}

/// Type-erased reconcile function for one kind. Errors are retried with backoff.
#[async_trait]
pub trait Reconciler: Send + Sync {
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Started,
    AlreadyRegistered,
}

/// Dispatch table of the running process.
pub trait Registrar: Send + Sync {
    /// Attach `reconciler` to `kind`. A kind already registered keeps its first reconciler.
    fn register(&self, kind: ResourceKind, name: &str, reconciler: std::sync::Arc<dyn Reconciler>) -> Registration;

    /// Stop the controller of `kind`. Returns false when none was running.
    fn deregister(&self, kind: &ResourceKind) -> bool;

    /// `(kind, controller name)` of every running controller.
    fn registered(&self) -> Vec<(ResourceKind, String)>;
}
