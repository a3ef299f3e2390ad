use crate::{
    selector::WorkloadSelector,
    traffic_policy::{ActionSpec, HttpMatcher},
    ClusterRef, ControllerRef, Destination, ResourceId, ServicePort, TrafficPolicy,
    ValidationState, Workload,
};
use chrono::{DateTime, TimeZone, Utc};
use std::collections::{BTreeMap, BTreeSet};

pub fn mk_destination(name: &str, namespace: &str, cluster: &str) -> Destination {
    Destination {
        id: ResourceId::new("mesh-system", format!("{name}-{namespace}-{cluster}")),
        service: ClusterRef::new(name, namespace, cluster),
        labels: BTreeMap::new(),
        ports: vec![mk_port(8080)],
        subsets: BTreeMap::new(),
        federation_dns_name: Some(format!("{name}.{namespace}.{cluster}.global")),
        mesh: ResourceId::new("mesh-system", format!("istio-{cluster}")),
    }
}

pub fn mk_port(port: u16) -> ServicePort {
    ServicePort {
        port: port.try_into().expect("port must be non-zero"),
        name: Some(format!("http-{port}")),
        protocol: Some("TCP".to_string()),
    }
}

pub fn with_labels(mut destination: Destination, labels: &[(&str, &str)]) -> Destination {
    destination.labels = labels
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    destination
}

pub fn with_subsets(mut destination: Destination, subsets: &[(&str, &[&str])]) -> Destination {
    destination.subsets = subsets
        .iter()
        .map(|(k, vs)| {
            (
                k.to_string(),
                vs.iter().map(|v| v.to_string()).collect::<BTreeSet<_>>(),
            )
        })
        .collect();
    destination
}

pub fn mk_workload(name: &str, namespace: &str, cluster: &str, sa: &str) -> Workload {
    Workload {
        id: ResourceId::new("mesh-system", format!("{name}-{namespace}-{cluster}")),
        controller: ControllerRef {
            api_version: "apps/v1".to_string(),
            kind: "Deployment".to_string(),
            name: name.to_string(),
            namespace: namespace.to_string(),
            cluster: cluster.to_string(),
        },
        labels: BTreeMap::new(),
        service_account: sa.to_string(),
        mesh: ResourceId::new("mesh-system", format!("istio-{cluster}")),
    }
}

pub fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .expect("timestamp must be valid")
}

pub fn mk_policy(name: &str, created: i64, matchers: Vec<HttpMatcher>) -> TrafficPolicy {
    TrafficPolicy {
        id: ResourceId::new("ns", name),
        generation: Some(1),
        creation_timestamp: Some(ts(created)),
        validation: Some(ValidationState::Accepted),
        source_selector: WorkloadSelector::default(),
        destination_selector: None,
        http_matchers: matchers,
        actions: ActionSpec::default(),
    }
}

pub fn method(m: http::Method) -> HttpMatcher {
    HttpMatcher {
        method: Some(m),
        ..HttpMatcher::default()
    }
}
