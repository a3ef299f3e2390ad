use crate::{ClusterRef, ControllerRef, Destination, Workload};
use futures::future;
use std::{collections::BTreeMap, error::Error as StdError, fmt, sync::Arc};

#[cfg(test)]
mod tests;

/// Selects destinations, either by explicit reference or by matching
/// attributes of their backing services.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ServiceSelector {
    Refs(Vec<ObjectRef>),
    Matcher(ServiceMatcher),
}

/// Each non-empty field narrows the match; empty fields match everything.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct ServiceMatcher {
    pub labels: BTreeMap<String, String>,
    pub namespaces: Vec<String>,
    pub clusters: Vec<String>,
}

/// Selects workloads by the identity they run as.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum IdentitySelector {
    Matcher {
        namespaces: Vec<String>,
        clusters: Vec<String>,
    },
    ServiceAccountRefs(Vec<ObjectRef>),
}

/// Selects workloads by the labels and namespace of their controller.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkloadSelector {
    pub labels: BTreeMap<String, String>,
    pub namespaces: Vec<String>,
}

/// References an object by name, namespace and cluster. The cluster is
/// optional in resources but must be set for the reference to resolve.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectRef {
    pub name: String,
    pub namespace: String,
    pub cluster: Option<String>,
}

/// Fetches the labels of a workload's controller from its cluster.
#[async_trait::async_trait]
pub trait ControllerLookup {
    async fn controller_labels(
        &self,
        controller: &ControllerRef,
    ) -> anyhow::Result<BTreeMap<String, String>>;
}

#[derive(Clone, Debug, thiserror::Error)]
pub enum SelectorError {
    #[error("must provide a cluster name for {name}.{namespace}")]
    MustProvideClusterName { name: String, namespace: String },

    #[error("destination {0} not found")]
    DestinationNotFound(ClusterRef),

    #[error("multiple destinations found for {0}")]
    MultipleDestinationsFound(ClusterRef),

    #[error("failed to look up workload controller {controller}: {source}")]
    WorkloadLookup {
        controller: ControllerRef,
        #[source]
        source: Arc<dyn StdError + Send + Sync + 'static>,
    },
}

/// Resolves selectors against an immutable set of discovered destinations
/// and workloads.
///
/// Resolution never observes concurrent updates: the index hands out a new
/// `ResourceSelector` for every pipeline run.
#[derive(Clone, Debug, Default)]
pub struct ResourceSelector {
    destinations: Arc<[Destination]>,
    workloads: Arc<[Workload]>,
}

// === impl ResourceSelector ===

impl ResourceSelector {
    pub fn new(
        destinations: impl IntoIterator<Item = Destination>,
        workloads: impl IntoIterator<Item = Workload>,
    ) -> Self {
        let mut destinations = destinations.into_iter().collect::<Vec<_>>();
        destinations.sort_by(|a, b| a.service.cmp(&b.service).then_with(|| a.id.cmp(&b.id)));
        let mut workloads = workloads.into_iter().collect::<Vec<_>>();
        workloads.sort_by(|a, b| a.id.cmp(&b.id));
        Self {
            destinations: destinations.into(),
            workloads: workloads.into(),
        }
    }

    #[inline]
    pub fn destinations(&self) -> &[Destination] {
        &self.destinations
    }

    /// Resolves a destination selector. `None` selects every destination.
    pub fn resolve_destinations(
        &self,
        selector: Option<&ServiceSelector>,
    ) -> Result<Vec<Destination>, SelectorError> {
        match selector {
            None => Ok(self.destinations.to_vec()),
            Some(ServiceSelector::Refs(refs)) => refs
                .iter()
                .map(|r| {
                    let cluster = r.require_cluster()?;
                    self.destinations
                        .iter()
                        .find(|d| {
                            d.service.name == r.name
                                && d.service.namespace == r.namespace
                                && d.service.cluster == cluster
                        })
                        .cloned()
                        .ok_or_else(|| {
                            SelectorError::DestinationNotFound(ClusterRef::new(
                                &r.name,
                                &r.namespace,
                                cluster,
                            ))
                        })
                })
                .collect(),
            Some(ServiceSelector::Matcher(matcher)) => Ok(self
                .destinations
                .iter()
                .filter(|d| matcher.matches(d))
                .cloned()
                .collect()),
        }
    }

    /// Resolves exactly one destination by the name, namespace and cluster of
    /// its backing service.
    pub fn resolve_single_destination(
        &self,
        name: &str,
        namespace: &str,
        cluster: Option<&str>,
    ) -> Result<Destination, SelectorError> {
        let cluster = cluster.ok_or_else(|| SelectorError::MustProvideClusterName {
            name: name.to_string(),
            namespace: namespace.to_string(),
        })?;

        let mut matches = self.destinations.iter().filter(|d| {
            d.service.name == name && d.service.namespace == namespace && d.cluster() == cluster
        });
        match (matches.next(), matches.next()) {
            (Some(destination), None) => Ok(destination.clone()),
            (Some(_), Some(_)) => Err(SelectorError::MultipleDestinationsFound(ClusterRef::new(
                name, namespace, cluster,
            ))),
            (None, _) => Err(SelectorError::DestinationNotFound(ClusterRef::new(
                name, namespace, cluster,
            ))),
        }
    }

    /// Resolves an identity selector. `None` selects every workload.
    pub fn resolve_workloads(
        &self,
        selector: Option<&IdentitySelector>,
    ) -> Result<Vec<Workload>, SelectorError> {
        match selector {
            None => Ok(self.workloads.to_vec()),
            Some(IdentitySelector::Matcher {
                namespaces,
                clusters,
            }) => Ok(self
                .workloads
                .iter()
                .filter(|w| {
                    (namespaces.is_empty() || namespaces.iter().any(|ns| ns == w.namespace()))
                        && (clusters.is_empty() || clusters.iter().any(|c| c == w.cluster()))
                })
                .cloned()
                .collect()),
            Some(IdentitySelector::ServiceAccountRefs(refs)) => {
                let refs = refs
                    .iter()
                    .map(|r| Ok((r, r.require_cluster()?)))
                    .collect::<Result<Vec<_>, SelectorError>>()?;
                Ok(self
                    .workloads
                    .iter()
                    .filter(|w| {
                        refs.iter().any(|(r, cluster)| {
                            w.service_account == r.name
                                && w.namespace() == r.namespace
                                && w.cluster() == *cluster
                        })
                    })
                    .cloned()
                    .collect())
            }
        }
    }

    /// Resolves a workload selector.
    ///
    /// Unlike the other resolvers, this compares against the labels of each
    /// workload's controller, which are fetched from the workload's cluster.
    /// Lookups for different workloads proceed concurrently and the first
    /// failure fails the resolution.
    pub async fn resolve_workloads_by_selector<L>(
        &self,
        selector: Option<&WorkloadSelector>,
        lookup: &L,
    ) -> Result<Vec<Workload>, SelectorError>
    where
        L: ControllerLookup + ?Sized,
    {
        let selector = match selector {
            Some(selector) if !selector.is_empty() => selector,
            _ => return Ok(self.workloads.to_vec()),
        };

        let candidates = self.workloads.iter().filter(|w| {
            selector.namespaces.is_empty()
                || selector.namespaces.iter().any(|ns| ns == w.namespace())
        });

        let checks = candidates.map(|workload| async move {
            if selector.labels.is_empty() {
                return Ok(Some(workload.clone()));
            }
            let labels = lookup
                .controller_labels(&workload.controller)
                .await
                .map_err(|error| SelectorError::WorkloadLookup {
                    controller: workload.controller.clone(),
                    source: Arc::from(Box::<dyn StdError + Send + Sync>::from(error)),
                })?;
            let matched = selector.labels.iter().all(|(k, v)| labels.get(k) == Some(v));
            Ok::<_, SelectorError>(matched.then(|| workload.clone()))
        });

        let matched = future::try_join_all(checks).await?;
        Ok(matched.into_iter().flatten().collect())
    }
}

// === impl ServiceMatcher ===

impl ServiceMatcher {
    pub fn matches(&self, destination: &Destination) -> bool {
        let ns_ok = self.namespaces.is_empty()
            || self
                .namespaces
                .iter()
                .any(|ns| *ns == destination.service.namespace);
        let labels_ok = self
            .labels
            .iter()
            .all(|(k, v)| destination.labels.get(k) == Some(v));
        let cluster_ok = self.clusters.is_empty()
            || self.clusters.iter().any(|c| c == destination.cluster());
        ns_ok && labels_ok && cluster_ok
    }
}

// === impl WorkloadSelector ===

impl WorkloadSelector {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty() && self.namespaces.is_empty()
    }
}

// === impl ObjectRef ===

impl ObjectRef {
    pub fn require_cluster(&self) -> Result<&str, SelectorError> {
        self.cluster
            .as_deref()
            .ok_or_else(|| SelectorError::MustProvideClusterName {
                name: self.name.clone(),
                namespace: self.namespace.clone(),
            })
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.cluster.as_deref() {
            Some(cluster) => write!(f, "{}.{}.{}", self.name, self.namespace, cluster),
            None => write!(f, "{}.{}", self.name, self.namespace),
        }
    }
}

impl From<ClusterRef> for ObjectRef {
    fn from(ClusterRef { name, namespace, cluster }: ClusterRef) -> Self {
        Self {
            name,
            namespace,
            cluster: Some(cluster),
        }
    }
}
