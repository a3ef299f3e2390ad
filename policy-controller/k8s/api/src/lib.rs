#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod discovery;
pub mod duration;
pub mod istio;
pub mod networking;

pub use self::{
    discovery::{Mesh, MeshService, MeshWorkload},
    duration::K8sDuration,
    networking::{TrafficPolicy, TrafficPolicySpec, TrafficPolicyStatus},
};
pub use k8s_openapi::{
    api::{self, apps::v1::Deployment, coordination::v1::Lease},
    apimachinery::{self, pkg::apis::meta::v1::Time},
};
pub use kube::{
    api::{
        Api, ApiResource, DynamicObject, GroupVersionKind, ListParams, ObjectMeta, Patch,
        PatchParams, PostParams, Resource, ResourceExt,
    },
    Client, Error,
};
