//! Mesh-agnostic discovery resources. These are written by discovery and only
//! read by the policy controller.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Identifies an object within a specific registered cluster.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterObjectRef {
    pub name: String,
    pub namespace: String,
    pub cluster_name: String,
}

/// Identifies an object in the management cluster.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
pub struct ResourceRef {
    pub name: String,
    pub namespace: String,
}

/// A network service, in some cluster, that belongs to a mesh.
#[derive(Clone, Debug, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "discovery.mesh.io",
    version = "v1alpha1",
    kind = "MeshService",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct MeshServiceSpec {
    pub kube_service: KubeService,
    pub mesh: ResourceRef,

    /// Label values that select named partitions of the service's endpoints,
    /// keyed by label.
    #[serde(default)]
    pub subsets: BTreeMap<String, SubsetValues>,

    pub federation: Option<Federation>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KubeService {
    #[serde(rename = "ref")]
    pub service_ref: ClusterObjectRef,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    #[serde(default)]
    pub ports: Vec<KubeServicePort>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct KubeServicePort {
    pub port: u32,
    pub name: Option<String>,
    pub protocol: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct SubsetValues {
    #[serde(default)]
    pub values: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Federation {
    /// The globally addressable name through which workloads in other
    /// clusters reach this service.
    pub multicluster_dns_name: Option<String>,
}

/// A workload controller, in some cluster, that belongs to a mesh.
#[derive(Clone, Debug, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "discovery.mesh.io",
    version = "v1alpha1",
    kind = "MeshWorkload",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct MeshWorkloadSpec {
    pub kube_controller: KubeController,
    pub mesh: ResourceRef,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KubeController {
    pub kube_controller_ref: ClusterObjectRef,

    /// Defaults to `apps/v1`.
    pub api_version: Option<String>,

    /// Defaults to `Deployment`.
    pub kind: Option<String>,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    pub service_account_name: String,
}

/// A mesh control plane installed in a registered cluster.
#[derive(Clone, Debug, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "discovery.mesh.io",
    version = "v1alpha1",
    kind = "Mesh",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct MeshSpec {
    pub cluster: ResourceRef,
    pub istio: Option<IstioMesh>,
    pub linkerd: Option<LinkerdMesh>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct IstioMesh {
    pub installation: MeshInstallation,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct LinkerdMesh {
    pub installation: MeshInstallation,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MeshInstallation {
    pub installation_namespace: String,
    pub version: Option<String>,
}
