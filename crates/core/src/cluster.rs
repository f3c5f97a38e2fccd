//! Registered target clusters. Only the placement side resolves these.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{naming, LabelSelector, Replicas, Work};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub bucket_path: String,
}

impl Cluster {
    pub fn selected_by(&self, selector: &LabelSelector) -> bool { selector.matches(&self.labels) }

    pub fn crds_bucket(&self) -> String { naming::crds_bucket(&self.bucket_path) }
    pub fn resources_bucket(&self) -> String { naming::resources_bucket(&self.bucket_path) }
}

/// Clusters a Work lands on: every match, or the first `n` matches in name order.
pub fn targets<'a>(work: &Work, clusters: &'a [Cluster]) -> Vec<&'a Cluster> {
    let mut matching: Vec<&Cluster> = clusters.iter().filter(|c| c.selected_by(&work.spec.cluster_selector)).collect();
    matching.sort_by(|a, b| a.name.cmp(&b.name));
    if let Replicas::Exactly(n) = work.spec.replicas {
        matching.truncate(n as usize);
    }
    matching
}
