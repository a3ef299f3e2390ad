use crate::{
    selector::{ObjectRef, WorkloadSelector},
    ResourceId, ServiceSelector,
};
use chrono::{offset::Utc, DateTime};
use http::Method;
use std::{collections::BTreeMap, fmt, time};

/// A user-authored traffic policy, converted from its resource representation.
#[derive(Clone, Debug, PartialEq)]
pub struct TrafficPolicy {
    pub id: ResourceId,
    pub generation: Option<i64>,

    /// This is required for ordering policies while merging.
    pub creation_timestamp: Option<DateTime<Utc>>,

    /// The most recent validation outcome. Only `Accepted` policies are
    /// merged.
    pub validation: Option<ValidationState>,

    pub source_selector: WorkloadSelector,

    /// Selects the destinations this policy applies to. `None` selects every
    /// destination.
    pub destination_selector: Option<ServiceSelector>,

    pub http_matchers: Vec<HttpMatcher>,
    pub actions: ActionSpec,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ValidationState {
    Accepted,
    Invalid,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TranslationState {
    Accepted,
    Invalid,
    Conflict,
    ProcessingError,
}

/// Matches HTTP requests. All set fields must match.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct HttpMatcher {
    pub path: Option<PathMatch>,
    pub method: Option<Method>,
    pub headers: Vec<HeaderMatcher>,
    pub query_params: Vec<QueryParamMatcher>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum PathMatch {
    Exact(String),
    Prefix(String),
    Regex(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ValueMatch {
    Exact(String),
    Regex(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct HeaderMatcher {
    pub name: String,
    pub value: ValueMatch,

    /// When set, the request matches only if the header does *not* match.
    pub invert: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct QueryParamMatcher {
    pub name: String,
    pub value: ValueMatch,
}

/// The actions a policy applies to matching requests.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ActionSpec {
    pub traffic_shift: Option<TrafficShift>,
    pub fault_injection: Option<FaultInjection>,
    pub request_timeout: Option<time::Duration>,
    pub retries: Option<RetryPolicy>,
    pub cors_policy: Option<CorsPolicy>,
    pub mirror: Option<Mirror>,
    pub header_manipulation: Option<HeaderManipulation>,
}

/// Names a single action field, e.g. in conflict reports.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ActionField {
    TrafficShift,
    FaultInjection,
    RequestTimeout,
    Retries,
    CorsPolicy,
    Mirror,
    HeaderManipulation,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrafficShift {
    pub destinations: Vec<WeightedDestination>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WeightedDestination {
    pub destination: ObjectRef,
    pub weight: u32,
    pub port: Option<u32>,

    /// Labels selecting a subset of the destination's endpoints.
    pub subset: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FaultInjection {
    pub fault: Fault,

    /// Percentage of requests to inject the fault into, in [0, 100].
    pub percentage: f64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Fault {
    Abort { http_status: u32 },
    Delay { fixed_delay: time::Duration },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: i32,
    pub per_try_timeout: Option<time::Duration>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CorsPolicy {
    pub allow_origins: Vec<ValueMatch>,
    pub allow_methods: Vec<String>,
    pub allow_headers: Vec<String>,
    pub expose_headers: Vec<String>,
    pub max_age: Option<time::Duration>,
    pub allow_credentials: Option<bool>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Mirror {
    pub destination: ObjectRef,
    pub percentage: f64,
    pub port: Option<u32>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HeaderManipulation {
    pub append_request_headers: BTreeMap<String, String>,
    pub remove_request_headers: Vec<String>,
    pub append_response_headers: BTreeMap<String, String>,
    pub remove_response_headers: Vec<String>,
}

// === impl TrafficPolicy ===

impl TrafficPolicy {
    #[inline]
    pub fn is_accepted(&self) -> bool {
        self.validation == Some(ValidationState::Accepted)
    }

    /// The matchers this policy routes on. A policy without explicit matchers
    /// applies to every request, which is modeled as one empty matcher.
    pub fn effective_matchers(&self) -> Vec<HttpMatcher> {
        if self.http_matchers.is_empty() {
            return vec![HttpMatcher::default()];
        }
        self.http_matchers.clone()
    }
}

// === impl TranslationState ===

impl TranslationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accepted => "ACCEPTED",
            Self::Invalid => "INVALID",
            Self::Conflict => "CONFLICT",
            Self::ProcessingError => "PROCESSING_ERROR",
        }
    }
}

impl fmt::Display for TranslationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// === impl ActionField ===

impl fmt::Display for ActionField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::TrafficShift => "trafficShift",
            Self::FaultInjection => "faultInjection",
            Self::RequestTimeout => "requestTimeout",
            Self::Retries => "retries",
            Self::CorsPolicy => "corsPolicy",
            Self::Mirror => "mirror",
            Self::HeaderManipulation => "headerManipulation",
        })
    }
}
