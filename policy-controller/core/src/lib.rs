#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod destination;
pub mod merge;
pub mod selector;
pub mod traffic_policy;
pub mod validate;
pub mod workload;

#[cfg(test)]
mod test_util;

pub use self::{
    destination::{ClusterRef, Destination, Mesh, MeshKind, ResourceId, ServicePort},
    merge::{merge_for_destinations, ConflictError, MergeOutput, MergedPolicy},
    selector::{
        ControllerLookup, IdentitySelector, ObjectRef, ResourceSelector, SelectorError,
        ServiceMatcher, ServiceSelector, WorkloadSelector,
    },
    traffic_policy::{TrafficPolicy, TranslationState, ValidationState},
    validate::{validate, ValidationError, ValidationErrors},
    workload::{ControllerRef, Workload},
};
pub use http::Method;

pub const POLICY_CONTROLLER_NAME: &str = "networking.mesh.io/policy-controller";
