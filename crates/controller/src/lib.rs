//! Kratix controllers.
//!
//! [`PromiseReconciler`] turns a Promise into a served API type, its Work and
//! RBAC, then registers a [`DynamicController`] for the new kind on the running
//! substrate. Each [`DynamicController`] drives resource requests of that kind
//! through finalizer, single pipeline launch and delete cascade.

#![forbid(unsafe_code)]

mod config;
mod dynamic;
mod promise;
pub mod rbac;

pub use config::{ConfigError, ControllerConfig};
pub use dynamic::DynamicController;
pub use promise::{BootstrapReport, PromiseReconciler};
