use crate::ResourceId;
use std::{collections::BTreeMap, fmt};

/// A discovered compute unit, identified by the controller (e.g. a
/// Deployment) that owns its pods.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Workload {
    pub id: ResourceId,
    pub controller: ControllerRef,

    /// Labels on the workload's pod template.
    pub labels: BTreeMap<String, String>,

    pub service_account: String,
    pub mesh: ResourceId,
}

/// References the object that owns a workload's pods, in the cluster that
/// runs them.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ControllerRef {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub namespace: String,
    pub cluster: String,
}

// === impl Workload ===

impl Workload {
    #[inline]
    pub fn namespace(&self) -> &str {
        &self.controller.namespace
    }

    #[inline]
    pub fn cluster(&self) -> &str {
        &self.controller.cluster
    }
}

// === impl ControllerRef ===

impl fmt::Display for ControllerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} {}.{} in cluster {}",
            self.api_version, self.kind, self.name, self.namespace, self.cluster
        )
    }
}
