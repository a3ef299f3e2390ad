use super::*;
use crate::{test_util::*, ResourceId};
use maplit::btreemap;
use std::sync::atomic::{AtomicUsize, Ordering};

fn selector() -> ResourceSelector {
    ResourceSelector::new(
        vec![
            with_labels(mk_destination("reviews", "bookinfo", "c1"), &[("app", "reviews")]),
            with_labels(
                mk_destination("ratings", "bookinfo", "c1"),
                &[("app", "ratings"), ("tier", "backend")],
            ),
            with_labels(mk_destination("reviews", "bookinfo", "c2"), &[("app", "reviews")]),
            with_labels(mk_destination("web", "frontend", "c2"), &[("app", "web")]),
        ],
        vec![
            mk_workload("productpage", "bookinfo", "c1", "bookinfo-productpage"),
            mk_workload("reviews-v1", "bookinfo", "c1", "bookinfo-reviews"),
            mk_workload("web", "frontend", "c2", "web"),
        ],
    )
}

fn services(destinations: &[Destination]) -> Vec<String> {
    destinations.iter().map(|d| d.service.to_string()).collect()
}

#[test]
fn no_selector_resolves_everything() {
    let destinations = selector().resolve_destinations(None).unwrap();
    assert_eq!(destinations.len(), 4);
}

#[test]
fn matcher_by_cluster_ignores_namespace_and_labels() {
    let sel = ServiceSelector::Matcher(ServiceMatcher {
        clusters: vec!["c1".to_string()],
        ..ServiceMatcher::default()
    });
    let destinations = selector().resolve_destinations(Some(&sel)).unwrap();
    assert_eq!(
        services(&destinations),
        vec!["ratings.bookinfo.c1", "reviews.bookinfo.c1"]
    );
}

#[test]
fn matcher_fields_are_anded() {
    let sel = ServiceSelector::Matcher(ServiceMatcher {
        labels: btreemap! { "app".to_string() => "reviews".to_string() },
        namespaces: vec!["bookinfo".to_string()],
        clusters: vec!["c2".to_string()],
    });
    let destinations = selector().resolve_destinations(Some(&sel)).unwrap();
    assert_eq!(services(&destinations), vec!["reviews.bookinfo.c2"]);
}

#[test]
fn matcher_labels_are_a_subset_test() {
    let sel = ServiceSelector::Matcher(ServiceMatcher {
        labels: btreemap! { "tier".to_string() => "backend".to_string() },
        ..ServiceMatcher::default()
    });
    let destinations = selector().resolve_destinations(Some(&sel)).unwrap();
    assert_eq!(services(&destinations), vec!["ratings.bookinfo.c1"]);
}

#[test]
fn refs_resolve_exact_triples() {
    let sel = ServiceSelector::Refs(vec![ObjectRef {
        name: "reviews".to_string(),
        namespace: "bookinfo".to_string(),
        cluster: Some("c2".to_string()),
    }]);
    let destinations = selector().resolve_destinations(Some(&sel)).unwrap();
    assert_eq!(services(&destinations), vec!["reviews.bookinfo.c2"]);
}

#[test]
fn refs_require_cluster() {
    let sel = ServiceSelector::Refs(vec![ObjectRef {
        name: "reviews".to_string(),
        namespace: "bookinfo".to_string(),
        cluster: None,
    }]);
    let err = selector().resolve_destinations(Some(&sel)).unwrap_err();
    assert!(matches!(err, SelectorError::MustProvideClusterName { .. }));
}

#[test]
fn any_unresolved_ref_fails() {
    let sel = ServiceSelector::Refs(vec![
        ObjectRef {
            name: "reviews".to_string(),
            namespace: "bookinfo".to_string(),
            cluster: Some("c1".to_string()),
        },
        ObjectRef {
            name: "missing".to_string(),
            namespace: "bookinfo".to_string(),
            cluster: Some("c1".to_string()),
        },
    ]);
    let err = selector().resolve_destinations(Some(&sel)).unwrap_err();
    match err {
        SelectorError::DestinationNotFound(r) => {
            assert_eq!(r, ClusterRef::new("missing", "bookinfo", "c1"))
        }
        err => panic!("unexpected error: {err}"),
    }
}

#[test]
fn single_destination() {
    let sel = selector();
    let dst = sel
        .resolve_single_destination("web", "frontend", Some("c2"))
        .unwrap();
    assert_eq!(dst.service, ClusterRef::new("web", "frontend", "c2"));

    assert!(matches!(
        sel.resolve_single_destination("web", "frontend", None),
        Err(SelectorError::MustProvideClusterName { .. })
    ));
    assert!(matches!(
        sel.resolve_single_destination("web", "frontend", Some("c1")),
        Err(SelectorError::DestinationNotFound(_))
    ));
}

#[test]
fn single_destination_rejects_duplicates() {
    let mut twin = mk_destination("web", "frontend", "c2");
    twin.id = ResourceId::new("mesh-system", "web-twin");
    let sel = ResourceSelector::new(vec![mk_destination("web", "frontend", "c2"), twin], vec![]);
    assert!(matches!(
        sel.resolve_single_destination("web", "frontend", Some("c2")),
        Err(SelectorError::MultipleDestinationsFound(_))
    ));
}

#[test]
fn workloads_by_identity() {
    let sel = selector();
    assert_eq!(sel.resolve_workloads(None).unwrap().len(), 3);

    let by_ns = sel
        .resolve_workloads(Some(&IdentitySelector::Matcher {
            namespaces: vec!["bookinfo".to_string()],
            clusters: vec![],
        }))
        .unwrap();
    assert_eq!(by_ns.len(), 2);

    let by_sa = sel
        .resolve_workloads(Some(&IdentitySelector::ServiceAccountRefs(vec![ObjectRef {
            name: "web".to_string(),
            namespace: "frontend".to_string(),
            cluster: Some("c2".to_string()),
        }])))
        .unwrap();
    assert_eq!(by_sa.len(), 1);
    assert_eq!(by_sa[0].controller.name, "web");

    let err = sel
        .resolve_workloads(Some(&IdentitySelector::ServiceAccountRefs(vec![ObjectRef {
            name: "web".to_string(),
            namespace: "frontend".to_string(),
            cluster: None,
        }])))
        .unwrap_err();
    assert!(matches!(err, SelectorError::MustProvideClusterName { .. }));
}

struct StaticLookup {
    labels: BTreeMap<String, BTreeMap<String, String>>,
    calls: AtomicUsize,
}

#[async_trait::async_trait]
impl ControllerLookup for StaticLookup {
    async fn controller_labels(
        &self,
        controller: &ControllerRef,
    ) -> anyhow::Result<BTreeMap<String, String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.labels
            .get(&controller.name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("{} not found", controller.name))
    }
}

fn lookup() -> StaticLookup {
    StaticLookup {
        labels: btreemap! {
            "productpage".to_string() => btreemap! { "app".to_string() => "productpage".to_string() },
            "reviews-v1".to_string() => btreemap! {
                "app".to_string() => "reviews".to_string(),
                "version".to_string() => "v1".to_string(),
            },
            "web".to_string() => btreemap! { "app".to_string() => "web".to_string() },
        },
        calls: AtomicUsize::new(0),
    }
}

#[tokio::test]
async fn workloads_by_controller_labels() {
    let sel = selector();
    let lookup = lookup();

    let all = sel
        .resolve_workloads_by_selector(Some(&WorkloadSelector::default()), &lookup)
        .await
        .unwrap();
    assert_eq!(all.len(), 3);
    assert_eq!(lookup.calls.load(Ordering::SeqCst), 0);

    let selected = sel
        .resolve_workloads_by_selector(
            Some(&WorkloadSelector {
                labels: btreemap! { "app".to_string() => "reviews".to_string() },
                namespaces: vec!["bookinfo".to_string()],
            }),
            &lookup,
        )
        .await
        .unwrap();
    assert_eq!(selected.len(), 1);
    assert_eq!(selected[0].controller.name, "reviews-v1");
    // Only workloads in the selected namespace are looked up.
    assert_eq!(lookup.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn workload_lookup_failures_propagate() {
    let sel = ResourceSelector::new(vec![], vec![mk_workload("ghost", "ns", "c1", "ghost")]);
    let err = sel
        .resolve_workloads_by_selector(
            Some(&WorkloadSelector {
                labels: btreemap! { "app".to_string() => "ghost".to_string() },
                namespaces: vec![],
            }),
            &lookup(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SelectorError::WorkloadLookup { .. }));
}
