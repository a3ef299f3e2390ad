use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    num::NonZeroU16,
};

/// Identifies a namespaced object in the management cluster.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceId {
    pub namespace: String,
    pub name: String,
}

/// Identifies an object in a specific registered cluster.
///
/// Destinations are keyed by the `ClusterRef` of their backing service, which
/// is globally unique across the mesh group.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClusterRef {
    pub name: String,
    pub namespace: String,
    pub cluster: String,
}

/// A discovered, mesh-bound service. Destinations are the unit of work for
/// merging and translation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Destination {
    /// The discovery object that describes this destination.
    pub id: ResourceId,

    /// The backing service, in the cluster that owns it.
    pub service: ClusterRef,

    /// Labels on the backing service.
    pub labels: BTreeMap<String, String>,

    pub ports: Vec<ServicePort>,

    /// Named subsets: label key to the set of label values allowed for it.
    pub subsets: BTreeMap<String, BTreeSet<String>>,

    /// The globally addressable name assigned when the destination is
    /// federated across clusters.
    pub federation_dns_name: Option<String>,

    pub mesh: ResourceId,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServicePort {
    pub port: NonZeroU16,
    pub name: Option<String>,
    pub protocol: Option<String>,
}

/// A mesh control plane installation in one cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mesh {
    pub id: ResourceId,
    pub cluster: String,
    pub kind: MeshKind,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MeshKind {
    Istio {
        installation_namespace: String,
        version: Option<String>,
    },
    Linkerd,
    Other(String),
}

// === impl ResourceId ===

impl ResourceId {
    pub fn new(namespace: impl ToString, name: impl ToString) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

// === impl ClusterRef ===

impl ClusterRef {
    pub fn new(name: impl ToString, namespace: impl ToString, cluster: impl ToString) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            cluster: cluster.to_string(),
        }
    }
}

impl fmt::Display for ClusterRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.name, self.namespace, self.cluster)
    }
}

// === impl Destination ===

impl Destination {
    /// The in-cluster hostname of the backing service, in `name.namespace`
    /// form.
    pub fn local_hostname(&self) -> String {
        format!("{}.{}", self.service.name, self.service.namespace)
    }

    #[inline]
    pub fn cluster(&self) -> &str {
        &self.service.cluster
    }

    /// Returns true if `value` is one of the values declared for the subset
    /// label `key`.
    pub fn declares_subset(&self, key: &str, value: &str) -> bool {
        self.subsets
            .get(key)
            .map(|values| values.contains(value))
            .unwrap_or(false)
    }
}

// === impl MeshKind ===

impl MeshKind {
    #[inline]
    pub fn is_istio(&self) -> bool {
        matches!(self, Self::Istio { .. })
    }
}
