//! Converts discovery resources into the core model.

use anyhow::{anyhow, bail, Context, Result};
use mesh_policy_controller_core::{
    ClusterRef, ControllerRef, Destination, Mesh, MeshKind, ResourceId, ServicePort, Workload,
};
use mesh_policy_controller_k8s_api::{
    discovery::{self as api, ResourceRef},
    ResourceExt,
};
use std::num::NonZeroU16;

pub(crate) const DEFAULT_CONTROLLER_API_VERSION: &str = "apps/v1";
pub(crate) const DEFAULT_CONTROLLER_KIND: &str = "Deployment";

pub fn destination(svc: &api::MeshService) -> Result<Destination> {
    let id = resource_id(svc)?;
    let api::MeshServiceSpec {
        kube_service,
        mesh,
        subsets,
        federation,
    } = svc.spec.clone();

    let ports = kube_service
        .ports
        .into_iter()
        .map(|api::KubeServicePort { port, name, protocol }| {
            let port = u16::try_from(port)
                .ok()
                .and_then(NonZeroU16::new)
                .ok_or_else(|| anyhow!("invalid service port {port}"))?;
            Ok(ServicePort {
                port,
                name,
                protocol,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let r = kube_service.service_ref;
    Ok(Destination {
        id,
        service: ClusterRef::new(r.name, r.namespace, r.cluster_name),
        labels: kube_service.labels,
        ports,
        subsets: subsets
            .into_iter()
            .map(|(key, values)| (key, values.values.into_iter().collect()))
            .collect(),
        federation_dns_name: federation.and_then(|f| f.multicluster_dns_name),
        mesh: mesh_id(mesh),
    })
}

pub fn workload(wl: &api::MeshWorkload) -> Result<Workload> {
    let id = resource_id(wl)?;
    let api::MeshWorkloadSpec {
        kube_controller,
        mesh,
    } = wl.spec.clone();
    let r = kube_controller.kube_controller_ref;
    Ok(Workload {
        id,
        controller: ControllerRef {
            api_version: kube_controller
                .api_version
                .unwrap_or_else(|| DEFAULT_CONTROLLER_API_VERSION.to_string()),
            kind: kube_controller
                .kind
                .unwrap_or_else(|| DEFAULT_CONTROLLER_KIND.to_string()),
            name: r.name,
            namespace: r.namespace,
            cluster: r.cluster_name,
        },
        labels: kube_controller.labels,
        service_account: kube_controller.service_account_name,
        mesh: mesh_id(mesh),
    })
}

pub fn mesh(mesh: &api::Mesh) -> Result<Mesh> {
    let id = resource_id(mesh)?;
    let kind = match (&mesh.spec.istio, &mesh.spec.linkerd) {
        (Some(api::IstioMesh { installation }), None) => MeshKind::Istio {
            installation_namespace: installation.installation_namespace.clone(),
            version: installation.version.clone(),
        },
        (None, Some(_)) => MeshKind::Linkerd,
        (None, None) => MeshKind::Other("unknown".to_string()),
        (Some(_), Some(_)) => bail!("a mesh may only describe one installation"),
    };
    Ok(Mesh {
        id,
        cluster: mesh.spec.cluster.name.clone(),
        kind,
    })
}

fn resource_id<T: ResourceExt>(obj: &T) -> Result<ResourceId> {
    let namespace = obj.namespace().context("resource must have a namespace")?;
    Ok(ResourceId::new(namespace, obj.name_unchecked()))
}

fn mesh_id(ResourceRef { name, namespace }: ResourceRef) -> ResourceId {
    ResourceId { namespace, name }
}
