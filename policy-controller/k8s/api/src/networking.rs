use crate::duration::K8sDuration;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Describes how requests to a set of destinations are routed, and which
/// actions are applied to them.
#[derive(Clone, Debug, Default, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "networking.mesh.io",
    version = "v1alpha1",
    kind = "TrafficPolicy",
    status = "TrafficPolicyStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct TrafficPolicySpec {
    /// Requests originating from workloads not selected here are unaffected.
    /// If omitted, the policy applies to requests from every workload.
    pub source_selector: Option<WorkloadSelector>,

    /// If omitted, the policy applies to every destination.
    pub destination_selector: Option<ServiceSelector>,

    /// If omitted, the policy applies to every request.
    pub http_request_matchers: Option<Vec<HttpMatcher>>,

    pub traffic_shift: Option<MultiDestination>,
    pub fault_injection: Option<FaultInjection>,
    pub request_timeout: Option<K8sDuration>,
    pub retries: Option<RetryPolicy>,
    pub cors_policy: Option<CorsPolicy>,
    pub mirror: Option<Mirror>,
    pub header_manipulation: Option<HeaderManipulation>,
}

/// References a service by name and namespace in a registered cluster.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRef {
    pub name: String,
    pub namespace: String,
    pub cluster: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct WorkloadSelector {
    pub labels: Option<BTreeMap<String, String>>,
    pub namespaces: Option<Vec<String>>,
}

/// Exactly one of `serviceRefs` or `matcher` may be set.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSelector {
    pub service_refs: Option<ServiceRefs>,
    pub matcher: Option<ServiceMatcher>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct ServiceRefs {
    #[serde(default)]
    pub services: Vec<ServiceRef>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct ServiceMatcher {
    pub labels: Option<BTreeMap<String, String>>,
    pub namespaces: Option<Vec<String>>,
    pub clusters: Option<Vec<String>>,
}

/// At most one of `prefix`, `exact` or `regex` may be set.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HttpMatcher {
    pub prefix: Option<String>,
    pub exact: Option<String>,
    pub regex: Option<String>,
    pub method: Option<String>,
    pub headers: Option<Vec<HeaderMatcher>>,
    pub query_parameters: Option<Vec<QueryParameterMatcher>>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HeaderMatcher {
    pub name: String,
    pub value: String,

    /// Interprets `value` as a regular expression.
    #[serde(default)]
    pub regex: bool,

    /// Matches requests on which the header does not match.
    #[serde(default)]
    pub invert_match: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct QueryParameterMatcher {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub regex: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct MultiDestination {
    #[serde(default)]
    pub destinations: Vec<WeightedDestination>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct WeightedDestination {
    pub destination: ServiceRef,
    pub weight: u32,

    /// Required when the destination exposes more than one port.
    pub port: Option<u32>,

    /// Labels selecting a declared subset of the destination.
    pub subset: Option<BTreeMap<String, String>>,
}

/// Exactly one of `abort` or `delay` must be set.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct FaultInjection {
    pub abort: Option<Abort>,
    pub delay: Option<Delay>,
    pub percentage: f64,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Abort {
    pub http_status: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Delay {
    pub fixed_delay: K8sDuration,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    pub attempts: i32,
    pub per_try_timeout: Option<K8sDuration>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CorsPolicy {
    pub allow_origins: Option<Vec<StringMatch>>,
    pub allow_methods: Option<Vec<String>>,
    pub allow_headers: Option<Vec<String>>,
    pub expose_headers: Option<Vec<String>>,
    pub max_age: Option<K8sDuration>,
    pub allow_credentials: Option<bool>,
}

/// Exactly one of `exact` or `regex` must be set.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct StringMatch {
    pub exact: Option<String>,
    pub regex: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct Mirror {
    pub destination: ServiceRef,
    pub percentage: f64,
    pub port: Option<u32>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HeaderManipulation {
    pub append_request_headers: Option<BTreeMap<String, String>>,
    pub remove_request_headers: Option<Vec<String>>,
    pub append_response_headers: Option<BTreeMap<String, String>>,
    pub remove_response_headers: Option<Vec<String>>,
}

/// Written only by the policy controller.
///
/// Optional fields serialize as `null` so that a merge patch of a complete
/// status clears fields that no longer apply.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TrafficPolicyStatus {
    pub observed_generation: Option<i64>,
    pub validation_status: Option<StateStatus>,
    pub translation_status: Option<StateStatus>,

    #[serde(default)]
    pub conflict_errors: Vec<ConflictErrorStatus>,

    #[serde(default)]
    pub translator_errors: Vec<TranslatorErrorStatus>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct StateStatus {
    /// One of `ACCEPTED`, `INVALID`, `CONFLICT` or `PROCESSING_ERROR`.
    pub state: String,
    pub message: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct ConflictErrorStatus {
    pub message: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TranslatorErrorStatus {
    pub translator_id: String,
    pub error_message: String,
}
