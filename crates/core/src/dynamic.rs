//! Conversion between typed records and the store's `DynamicObject` form.

use kube::core::DynamicObject;
use serde::{de::DeserializeOwned, Serialize};

use crate::{CoreError, ResourceKind};

/// Serialize any record carrying `apiVersion`/`kind` into a `DynamicObject`.
pub fn to_dynamic<T: Serialize>(obj: &T) -> Result<DynamicObject, CoreError> {
    let v = serde_json::to_value(obj)?;
    if v.get("apiVersion").and_then(|a| a.as_str()).is_none() || v.get("kind").and_then(|k| k.as_str()).is_none() {
        return Err(CoreError::Invalid("object missing apiVersion or kind".into()));
    }
    Ok(serde_json::from_value(v)?)
}

pub fn from_dynamic<T: DeserializeOwned>(obj: &DynamicObject) -> Result<T, CoreError> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

pub fn kind_of(obj: &DynamicObject) -> Option<ResourceKind> {
    obj.types.as_ref().map(|t| ResourceKind::from_api_version(&t.api_version, &t.kind))
}
