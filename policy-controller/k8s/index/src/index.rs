//! Holds the discovered destinations, workloads and meshes, along with every
//! `TrafficPolicy`, as they are observed by watches.
//!
//! The index itself does no policy processing. Pipeline runs take an
//! immutable [`Snapshot`] so that each run observes a consistent view while
//! watches continue to update the index.

use crate::{discovery, metrics::SizedIndex, traffic_policy};
use ahash::AHashMap as HashMap;
use mesh_policy_controller_core::{
    Destination, Mesh, ResourceId, ResourceSelector, TrafficPolicy, Workload,
};
use mesh_policy_controller_k8s_api::{self as k8s, ResourceExt, TrafficPolicyStatus};
use parking_lot::RwLock;
use std::{collections::BTreeMap, sync::Arc};

pub type SharedIndex = Arc<RwLock<Index>>;

#[derive(Debug, Default)]
pub struct Index {
    policies: HashMap<ResourceId, PolicyEntry>,
    destinations: HashMap<ResourceId, Destination>,
    workloads: HashMap<ResourceId, Workload>,
    meshes: HashMap<ResourceId, Mesh>,
}

/// A policy as it was last observed.
#[derive(Clone, Debug)]
pub struct PolicyEntry {
    pub id: ResourceId,
    pub generation: Option<i64>,

    /// The status currently recorded on the resource.
    pub status: Option<TrafficPolicyStatus>,

    /// The converted policy, or the reason the resource could not be
    /// converted.
    pub policy: Result<TrafficPolicy, Arc<anyhow::Error>>,
}

/// A consistent, immutable view of the index.
#[derive(Clone, Debug, Default)]
pub struct Snapshot {
    pub selector: ResourceSelector,

    /// Sorted by id.
    pub policies: Vec<PolicyEntry>,

    pub meshes: BTreeMap<ResourceId, Mesh>,
}

// === impl Index ===

impl Index {
    pub fn shared() -> SharedIndex {
        Arc::new(RwLock::new(Self::default()))
    }

    /// Builds a selector over the indexed destinations and workloads without
    /// copying policies.
    pub fn selector(&self) -> ResourceSelector {
        ResourceSelector::new(
            self.destinations.values().cloned(),
            self.workloads.values().cloned(),
        )
    }

    pub fn snapshot(&self) -> Snapshot {
        let mut policies = self.policies.values().cloned().collect::<Vec<_>>();
        policies.sort_by(|a, b| a.id.cmp(&b.id));
        Snapshot {
            selector: self.selector(),
            policies,
            meshes: self
                .meshes
                .iter()
                .map(|(id, mesh)| (id.clone(), mesh.clone()))
                .collect(),
        }
    }
}

impl kubert::index::IndexNamespacedResource<k8s::TrafficPolicy> for Index {
    fn apply(&mut self, policy: k8s::TrafficPolicy) {
        let Some(namespace) = policy.namespace() else {
            return;
        };
        let id = ResourceId::new(namespace, policy.name_unchecked());
        let converted = traffic_policy::try_traffic_policy(&policy).map_err(|error| {
            tracing::debug!(%id, %error, "Failed to convert TrafficPolicy");
            Arc::new(error)
        });
        let entry = PolicyEntry {
            id: id.clone(),
            generation: policy.metadata.generation,
            status: policy.status,
            policy: converted,
        };
        self.policies.insert(id, entry);
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.policies.remove(&ResourceId { namespace, name });
    }
}

impl kubert::index::IndexNamespacedResource<k8s::MeshService> for Index {
    fn apply(&mut self, svc: k8s::MeshService) {
        let namespace = svc.namespace().unwrap_or_default();
        let name = svc.name_unchecked();
        match discovery::destination(&svc) {
            Ok(destination) => {
                self.destinations.insert(destination.id.clone(), destination);
            }
            Err(error) => {
                tracing::info!(%namespace, %name, %error, "Ignoring MeshService");
                self.destinations.remove(&ResourceId { namespace, name });
            }
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.destinations.remove(&ResourceId { namespace, name });
    }
}

impl kubert::index::IndexNamespacedResource<k8s::MeshWorkload> for Index {
    fn apply(&mut self, wl: k8s::MeshWorkload) {
        let namespace = wl.namespace().unwrap_or_default();
        let name = wl.name_unchecked();
        match discovery::workload(&wl) {
            Ok(workload) => {
                self.workloads.insert(workload.id.clone(), workload);
            }
            Err(error) => {
                tracing::info!(%namespace, %name, %error, "Ignoring MeshWorkload");
                self.workloads.remove(&ResourceId { namespace, name });
            }
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.workloads.remove(&ResourceId { namespace, name });
    }
}

impl kubert::index::IndexNamespacedResource<k8s::Mesh> for Index {
    fn apply(&mut self, mesh: k8s::Mesh) {
        let namespace = mesh.namespace().unwrap_or_default();
        let name = mesh.name_unchecked();
        match discovery::mesh(&mesh) {
            Ok(mesh) => {
                self.meshes.insert(mesh.id.clone(), mesh);
            }
            Err(error) => {
                tracing::info!(%namespace, %name, %error, "Ignoring Mesh");
                self.meshes.remove(&ResourceId { namespace, name });
            }
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.meshes.remove(&ResourceId { namespace, name });
    }
}

fn count_in<V>(map: &HashMap<ResourceId, V>, namespace: &str) -> usize {
    map.keys().filter(|id| id.namespace == namespace).count()
}

impl SizedIndex<k8s::TrafficPolicy> for Index {
    fn size(&self, namespace: &str) -> usize {
        count_in(&self.policies, namespace)
    }
}

impl SizedIndex<k8s::MeshService> for Index {
    fn size(&self, namespace: &str) -> usize {
        count_in(&self.destinations, namespace)
    }
}

impl SizedIndex<k8s::MeshWorkload> for Index {
    fn size(&self, namespace: &str) -> usize {
        count_in(&self.workloads, namespace)
    }
}

impl SizedIndex<k8s::Mesh> for Index {
    fn size(&self, namespace: &str) -> usize {
        count_in(&self.meshes, namespace)
    }
}

// === impl Snapshot ===

impl Snapshot {
    /// Returns the mesh a destination belongs to, if it has been discovered.
    pub fn mesh_of(&self, destination: &Destination) -> Option<&Mesh> {
        self.meshes.get(&destination.mesh)
    }
}
