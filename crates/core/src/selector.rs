//! Equality label selectors, used both for Work placement and for list queries.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::CoreError;

/// Flat `key=value` match set. Every pair must be present on the target (AND).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabelSelector(BTreeMap<String, String>);

impl LabelSelector {
    pub fn new() -> Self { Self::default() }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn is_empty(&self) -> bool { self.0.is_empty() }
    pub fn len(&self) -> usize { self.0.len() }
    pub fn get(&self, key: &str) -> Option<&str> { self.0.get(key).map(|s| s.as_str()) }
    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> { self.0.iter() }
    pub fn as_map(&self) -> &BTreeMap<String, String> { &self.0 }

    /// An empty selector matches every label set.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.0.iter().all(|(k, v)| labels.get(k) == Some(v))
    }

    /// Copy of `self` with every pair of `overrides` applied on top.
    pub fn merged(&self, overrides: &LabelSelector) -> LabelSelector {
        let mut out = self.clone();
        for (k, v) in overrides.iter() {
            out.0.insert(k.clone(), v.clone());
        }
        out
    }
}

impl From<BTreeMap<String, String>> for LabelSelector {
    fn from(m: BTreeMap<String, String>) -> Self { Self(m) }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for LabelSelector {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Renders `k1=v1,k2=v2` with keys sorted; empty renders as an empty string.
impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (k, v) in &self.0 {
            if !first { f.write_str(",")?; }
            write!(f, "{}={}", k, v)?;
            first = false;
        }
        Ok(())
    }
}

/// Accepts pairs separated by commas or newlines. `<none>` and blank input parse as empty.
impl FromStr for LabelSelector {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = BTreeMap::new();
        for pair in s.split([',', '\n']).map(str::trim).filter(|p| !p.is_empty() && *p != "<none>") {
            let (k, v) = pair
                .split_once('=')
                .ok_or_else(|| CoreError::Invalid(format!("selector pair without '=': {}", pair)))?;
            let k = k.trim();
            if k.is_empty() {
                return Err(CoreError::Invalid(format!("selector pair with empty key: {}", pair)));
            }
            out.insert(k.to_string(), v.trim().to_string());
        }
        Ok(Self(out))
    }
}
