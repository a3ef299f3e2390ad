//! Converts `TrafficPolicy` resources into core policies.
//!
//! Conversion rejects specs that cannot be represented at all (unparseable
//! regexes or methods, negative durations, ambiguous variants). Semantic
//! checks against the discovered destinations happen later, in validation.

use ahash::AHashSet as HashSet;
use anyhow::{anyhow, bail, ensure, Context, Result};
use chrono::{DateTime, Utc};
use mesh_policy_controller_core::{
    traffic_policy::{
        ActionSpec, CorsPolicy, Fault, FaultInjection, HeaderManipulation, HeaderMatcher,
        HttpMatcher, Mirror, PathMatch, QueryParamMatcher, RetryPolicy, TrafficShift, ValueMatch,
        WeightedDestination,
    },
    Method, ObjectRef, ResourceId, ServiceMatcher, ServiceSelector, TrafficPolicy,
    WorkloadSelector,
};
use mesh_policy_controller_k8s_api::{self as k8s, networking as api, K8sDuration, ResourceExt};
use std::time;

/// Converts a policy resource. The result has not been validated.
pub fn try_traffic_policy(policy: &k8s::TrafficPolicy) -> Result<TrafficPolicy> {
    let namespace = policy
        .namespace()
        .ok_or_else(|| anyhow!("TrafficPolicy must have a namespace"))?;
    let id = ResourceId::new(namespace, policy.name_unchecked());
    let creation_timestamp = policy
        .metadata
        .creation_timestamp
        .as_ref()
        .and_then(timestamp);
    try_spec(id, policy.metadata.generation, creation_timestamp, policy.spec.clone())
}

pub fn try_spec(
    id: ResourceId,
    generation: Option<i64>,
    creation_timestamp: Option<DateTime<Utc>>,
    api::TrafficPolicySpec {
        source_selector,
        destination_selector,
        http_request_matchers,
        traffic_shift,
        fault_injection,
        request_timeout,
        retries,
        cors_policy,
        mirror,
        header_manipulation,
    }: api::TrafficPolicySpec,
) -> Result<TrafficPolicy> {
    let source_selector = source_selector.map(workload_selector).unwrap_or_default();
    let destination_selector = destination_selector
        .map(service_selector)
        .transpose()
        .context("invalid destinationSelector")?;
    let http_matchers = http_request_matchers
        .into_iter()
        .flatten()
        .map(http_matcher)
        .collect::<Result<_>>()
        .context("invalid httpRequestMatchers")?;

    let actions = ActionSpec {
        traffic_shift: traffic_shift.map(self::traffic_shift).transpose()?,
        fault_injection: fault_injection
            .map(self::fault_injection)
            .transpose()
            .context("invalid faultInjection")?,
        request_timeout: request_timeout
            .map(|d| duration(d, "requestTimeout"))
            .transpose()?,
        retries: retries.map(retry_policy).transpose()?,
        cors_policy: cors_policy
            .map(self::cors_policy)
            .transpose()
            .context("invalid corsPolicy")?,
        mirror: mirror.map(self::mirror),
        header_manipulation: header_manipulation.map(self::header_manipulation),
    };

    Ok(TrafficPolicy {
        id,
        generation,
        creation_timestamp,
        validation: None,
        source_selector,
        destination_selector,
        http_matchers,
        actions,
    })
}

fn workload_selector(
    api::WorkloadSelector { labels, namespaces }: api::WorkloadSelector,
) -> WorkloadSelector {
    WorkloadSelector {
        labels: labels.unwrap_or_default(),
        namespaces: namespaces.unwrap_or_default(),
    }
}

fn service_selector(
    api::ServiceSelector {
        service_refs,
        matcher,
    }: api::ServiceSelector,
) -> Result<ServiceSelector> {
    match (service_refs, matcher) {
        (Some(refs), None) => Ok(ServiceSelector::Refs(
            refs.services.into_iter().map(object_ref).collect(),
        )),
        (None, Some(api::ServiceMatcher {
            labels,
            namespaces,
            clusters,
        })) => Ok(ServiceSelector::Matcher(ServiceMatcher {
            labels: labels.unwrap_or_default(),
            namespaces: namespaces.unwrap_or_default(),
            clusters: clusters.unwrap_or_default(),
        })),
        (None, None) => Ok(ServiceSelector::Matcher(ServiceMatcher::default())),
        (Some(_), Some(_)) => bail!("only one of serviceRefs or matcher may be set"),
    }
}

fn object_ref(
    api::ServiceRef {
        name,
        namespace,
        cluster,
    }: api::ServiceRef,
) -> ObjectRef {
    ObjectRef {
        name,
        namespace,
        cluster,
    }
}

pub fn http_matcher(
    api::HttpMatcher {
        prefix,
        exact,
        regex,
        method,
        headers,
        query_parameters,
    }: api::HttpMatcher,
) -> Result<HttpMatcher> {
    let path = match (prefix, exact, regex) {
        (None, None, None) => None,
        (Some(prefix), None, None) => Some(PathMatch::Prefix(prefix)),
        (None, Some(exact), None) => Some(PathMatch::Exact(exact)),
        (None, None, Some(regex)) => {
            check_regex(&regex)?;
            Some(PathMatch::Regex(regex))
        }
        _ => bail!("only one of prefix, exact or regex may be set"),
    };
    if let Some(PathMatch::Exact(p) | PathMatch::Prefix(p)) = &path {
        ensure!(
            p.starts_with('/'),
            "paths must be absolute (begin with `/`); {p:?} is not an absolute path"
        );
    }

    let method = method
        .map(|m| Method::from_bytes(m.as_bytes()).with_context(|| format!("invalid method {m:?}")))
        .transpose()?;

    let headers: Vec<HeaderMatcher> = headers
        .into_iter()
        .flatten()
        .map(|h| {
            ensure!(!h.name.is_empty(), "header name must not be empty");
            Ok(HeaderMatcher {
                value: value_match(h.value, h.regex)?,
                name: h.name,
                invert: h.invert_match,
            })
        })
        .collect::<Result<_>>()?;

    let query_params: Vec<QueryParamMatcher> = query_parameters
        .into_iter()
        .flatten()
        .map(|q| {
            ensure!(!q.name.is_empty(), "query parameter name must not be empty");
            Ok(QueryParamMatcher {
                value: value_match(q.value, q.regex)?,
                name: q.name,
            })
        })
        .collect::<Result<_>>()?;

    check_unique_names(&headers, &query_params)?;

    Ok(HttpMatcher {
        path,
        method,
        headers,
        query_params,
    })
}

/// A header or query parameter may only be constrained once per matcher (a
/// header may additionally be excluded once). Header names are
/// case-insensitive.
fn check_unique_names(
    headers: &[HeaderMatcher],
    query_params: &[QueryParamMatcher],
) -> Result<()> {
    let mut seen = HashSet::new();
    for h in headers {
        ensure!(
            seen.insert((h.name.to_ascii_lowercase(), h.invert)),
            "header {:?} is matched more than once",
            h.name
        );
    }

    let mut seen = HashSet::new();
    for q in query_params {
        ensure!(
            seen.insert(q.name.as_str()),
            "query parameter {:?} is matched more than once",
            q.name
        );
    }
    Ok(())
}

fn value_match(value: String, regex: bool) -> Result<ValueMatch> {
    if regex {
        check_regex(&value)?;
        return Ok(ValueMatch::Regex(value));
    }
    Ok(ValueMatch::Exact(value))
}

fn check_regex(pattern: &str) -> Result<()> {
    regex::Regex::new(pattern)
        .map(|_| ())
        .with_context(|| format!("invalid regular expression {pattern:?}"))
}

fn traffic_shift(api::MultiDestination { destinations }: api::MultiDestination) -> Result<TrafficShift> {
    ensure!(
        !destinations.is_empty(),
        "trafficShift must specify at least one destination"
    );
    let destinations = destinations
        .into_iter()
        .map(
            |api::WeightedDestination {
                 destination,
                 weight,
                 port,
                 subset,
             }| WeightedDestination {
                destination: object_ref(destination),
                weight,
                port,
                subset: subset.unwrap_or_default(),
            },
        )
        .collect();
    Ok(TrafficShift { destinations })
}

fn fault_injection(
    api::FaultInjection {
        abort,
        delay,
        percentage,
    }: api::FaultInjection,
) -> Result<FaultInjection> {
    let fault = match (abort, delay) {
        (Some(api::Abort { http_status }), None) => Fault::Abort { http_status },
        (None, Some(api::Delay { fixed_delay })) => Fault::Delay {
            fixed_delay: duration(fixed_delay, "delay.fixedDelay")?,
        },
        (None, None) => bail!("one of abort or delay must be set"),
        (Some(_), Some(_)) => bail!("only one of abort or delay may be set"),
    };
    Ok(FaultInjection { fault, percentage })
}

fn retry_policy(
    api::RetryPolicy {
        attempts,
        per_try_timeout,
    }: api::RetryPolicy,
) -> Result<RetryPolicy> {
    Ok(RetryPolicy {
        attempts,
        per_try_timeout: per_try_timeout
            .map(|d| duration(d, "retries.perTryTimeout"))
            .transpose()?,
    })
}

fn cors_policy(
    api::CorsPolicy {
        allow_origins,
        allow_methods,
        allow_headers,
        expose_headers,
        max_age,
        allow_credentials,
    }: api::CorsPolicy,
) -> Result<CorsPolicy> {
    let allow_origins = allow_origins
        .into_iter()
        .flatten()
        .map(|api::StringMatch { exact, regex }| match (exact, regex) {
            (Some(exact), None) => Ok(ValueMatch::Exact(exact)),
            (None, Some(regex)) => {
                check_regex(&regex)?;
                Ok(ValueMatch::Regex(regex))
            }
            _ => bail!("exactly one of exact or regex must be set for allowOrigins"),
        })
        .collect::<Result<_>>()?;

    Ok(CorsPolicy {
        allow_origins,
        allow_methods: allow_methods.unwrap_or_default(),
        allow_headers: allow_headers.unwrap_or_default(),
        expose_headers: expose_headers.unwrap_or_default(),
        max_age: max_age.map(|d| duration(d, "maxAge")).transpose()?,
        allow_credentials,
    })
}

fn mirror(
    api::Mirror {
        destination,
        percentage,
        port,
    }: api::Mirror,
) -> Mirror {
    Mirror {
        destination: object_ref(destination),
        percentage,
        port,
    }
}

fn header_manipulation(
    api::HeaderManipulation {
        append_request_headers,
        remove_request_headers,
        append_response_headers,
        remove_response_headers,
    }: api::HeaderManipulation,
) -> HeaderManipulation {
    HeaderManipulation {
        append_request_headers: append_request_headers.unwrap_or_default(),
        remove_request_headers: remove_request_headers.unwrap_or_default(),
        append_response_headers: append_response_headers.unwrap_or_default(),
        remove_response_headers: remove_response_headers.unwrap_or_default(),
    }
}

fn duration(d: K8sDuration, field: &str) -> Result<time::Duration> {
    d.positive()
        .ok_or_else(|| anyhow!("{field} must not be negative: {d}"))
}

/// Kubernetes timestamps are RFC 3339 strings on the wire.
pub(crate) fn timestamp(time: &k8s::Time) -> Option<DateTime<Utc>> {
    let value = serde_json::to_value(time).ok()?;
    value.as_str()?.parse().ok()
}
