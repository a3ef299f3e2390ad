use super::*;
use crate::{core::ControllerRef, index::Index};
use maplit::btreemap;
use mesh_policy_controller_k8s_api::{
    discovery::{
        ClusterObjectRef, Federation, IstioMesh, KubeController, KubeService, KubeServicePort,
        MeshInstallation, MeshServiceSpec, MeshSpec, MeshWorkloadSpec, ResourceRef, SubsetValues,
    },
    networking::TrafficPolicySpec,
    TrafficPolicyStatus,
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use tokio::sync::Notify;

const RESYNC: time::Duration = time::Duration::from_secs(3600);

#[derive(Clone, Debug)]
enum Call {
    VirtualService { cluster: String, vs: VirtualService },
    Subsets { service: ClusterRef, names: Vec<String> },
}

#[derive(Clone, Default)]
struct MockWriter {
    calls: Arc<Mutex<Vec<Call>>>,
    fail: Arc<Mutex<bool>>,
    block: Option<Arc<Notify>>,
}

#[derive(Clone, Default)]
struct MockLookup {
    fail: bool,
}

#[async_trait::async_trait]
impl OutputWriter for MockWriter {
    async fn apply_virtual_service(&self, cluster: &str, vs: &VirtualService) -> Result<()> {
        if let Some(started) = &self.block {
            started.notify_one();
            future::pending::<()>().await;
        }
        if *self.fail.lock() {
            anyhow::bail!("connection refused");
        }
        self.calls.lock().push(Call::VirtualService {
            cluster: cluster.to_string(),
            vs: vs.clone(),
        });
        Ok(())
    }

    async fn upsert_subsets(
        &self,
        service: &ClusterRef,
        _host: &str,
        subsets: &[DestinationRuleSubsetUpdate],
    ) -> Result<()> {
        self.calls.lock().push(Call::Subsets {
            service: service.clone(),
            names: subsets.iter().map(|s| s.name.clone()).collect(),
        });
        Ok(())
    }
}

#[async_trait::async_trait]
impl ControllerLookup for MockLookup {
    async fn controller_labels(
        &self,
        controller: &ControllerRef,
    ) -> Result<std::collections::BTreeMap<String, String>> {
        if self.fail {
            anyhow::bail!("{controller} is unreachable");
        }
        Ok(btreemap! { "app".to_string() => "productpage".to_string() })
    }
}

struct Fixture {
    index: SharedIndex,
    writer: MockWriter,
    reconciler: Reconciler<MockWriter, MockLookup>,
}

impl Fixture {
    fn new() -> Self {
        Self::with_lookup(MockLookup::default())
    }

    fn with_lookup(lookup: MockLookup) -> Self {
        let index = Index::shared();
        index.write().apply(mk_mesh_service("reviews", "c1"));
        index.write().apply(mk_istio_mesh("istio-c1", "c1"));

        let writer = MockWriter::default();
        let reconciler = Reconciler::new(
            index.clone(),
            writer.clone(),
            lookup,
            Translator::new("cluster.local"),
            4,
            PipelineMetrics::register(&mut Registry::default()),
        );
        Self {
            index,
            writer,
            reconciler,
        }
    }

    fn apply_policy(&self, policy: k8s::TrafficPolicy) {
        self.index.write().apply(policy);
    }

    fn calls(&self) -> Vec<Call> {
        self.writer.calls.lock().clone()
    }

    fn virtual_services(&self) -> Vec<(String, VirtualService)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::VirtualService { cluster, vs } => Some((cluster, vs)),
                Call::Subsets { .. } => None,
            })
            .collect()
    }
}

#[tokio::test]
async fn accepted_policy_is_written() {
    let mut fixture = Fixture::new();
    fixture.apply_policy(mk_policy(
        "timeout",
        serde_json::json!({
            "destinationSelector": { "serviceRefs": { "services": [reviews_ref()] } },
            "requestTimeout": "2s",
        }),
    ));

    let updates = fixture.reconciler.reconcile().await;
    assert_eq!(updates.len(), 1);
    let status = status_of(&updates[0]);
    assert_eq!(state(&status.validation_status), "ACCEPTED");
    assert_eq!(state(&status.translation_status), "ACCEPTED");
    assert_eq!(status.observed_generation, Some(1));

    let written = fixture.virtual_services();
    assert_eq!(written.len(), 1);
    let (cluster, vs) = &written[0];
    assert_eq!(cluster, "c1");
    assert_eq!(vs.metadata.name.as_deref(), Some("reviews"));
    assert_eq!(vs.metadata.namespace.as_deref(), Some("bookinfo"));
    assert_eq!(vs.spec.hosts, vec!["reviews.bookinfo.svc.cluster.local"]);
    assert_eq!(vs.spec.http.len(), 1);
    assert_eq!(vs.spec.http[0].timeout.as_deref(), Some("2s"));
}

#[tokio::test]
async fn conflicting_policies_are_marked_and_not_written() {
    let mut fixture = Fixture::new();
    for (name, timeout) in [("a", "1s"), ("b", "2s")] {
        fixture.apply_policy(mk_policy(
            name,
            serde_json::json!({
                "destinationSelector": { "serviceRefs": { "services": [reviews_ref()] } },
                "requestTimeout": timeout,
            }),
        ));
    }

    let updates = fixture.reconciler.reconcile().await;
    assert_eq!(updates.len(), 2);
    for update in &updates {
        let status = status_of(update);
        assert_eq!(state(&status.validation_status), "ACCEPTED");
        assert_eq!(state(&status.translation_status), "CONFLICT");
        assert_eq!(status.conflict_errors.len(), 1);
    }
    assert!(fixture.virtual_services().is_empty());
}

#[tokio::test]
async fn invalid_policies_are_reported() {
    let mut fixture = Fixture::new();
    fixture.apply_policy(mk_policy(
        "missing",
        serde_json::json!({
            "destinationSelector": {
                "serviceRefs": {
                    "services": [{ "name": "ratings", "namespace": "bookinfo", "cluster": "c1" }],
                },
            },
            "requestTimeout": "2s",
        }),
    ));
    fixture.apply_policy(mk_policy(
        "unparseable",
        serde_json::json!({ "httpRequestMatchers": [{ "regex": "(" }] }),
    ));

    let updates = fixture.reconciler.reconcile().await;
    assert_eq!(updates.len(), 2);
    for update in &updates {
        let status = status_of(update);
        assert_eq!(state(&status.validation_status), "INVALID", "{}", update.id);
        assert_eq!(state(&status.translation_status), "INVALID", "{}", update.id);
    }
    let missing = status_of(&updates[0]);
    assert!(missing
        .validation_status
        .and_then(|s| s.message)
        .expect("message must be set")
        .contains("ratings"));
    assert!(fixture.virtual_services().is_empty());
}

#[tokio::test]
async fn converges_without_redundant_writes() {
    let mut fixture = Fixture::new();
    let policy = mk_policy(
        "timeout",
        serde_json::json!({
            "destinationSelector": { "serviceRefs": { "services": [reviews_ref()] } },
            "requestTimeout": "2s",
        }),
    );
    fixture.apply_policy(policy.clone());

    let updates = fixture.reconciler.reconcile().await;
    assert_eq!(updates.len(), 1);

    // Record the patched status on the resource, as the status controller
    // would.
    let mut patched = policy;
    patched.status = Some(status_of(&updates[0]));
    fixture.apply_policy(patched);

    let updates = fixture.reconciler.reconcile().await;
    assert!(updates.is_empty(), "unchanged statuses must not be patched");
    assert_eq!(fixture.virtual_services().len(), 1);
}

#[tokio::test]
async fn write_failures_are_processing_errors() {
    let mut fixture = Fixture::new();
    *fixture.writer.fail.lock() = true;
    fixture.apply_policy(mk_policy(
        "timeout",
        serde_json::json!({
            "destinationSelector": { "serviceRefs": { "services": [reviews_ref()] } },
            "requestTimeout": "2s",
        }),
    ));

    let updates = fixture.reconciler.reconcile().await;
    let status = status_of(&updates[0]);
    let translation = status.translation_status.expect("must be set");
    assert_eq!(translation.state, "PROCESSING_ERROR");
    assert!(translation
        .message
        .expect("message must be set")
        .contains("connection refused"));

    // The failed write is retried by the next run.
    *fixture.writer.fail.lock() = false;
    let updates = fixture.reconciler.reconcile().await;
    assert_eq!(state(&status_of(&updates[0]).translation_status), "ACCEPTED");
    assert_eq!(fixture.virtual_services().len(), 1);
}

#[tokio::test]
async fn subsets_are_written_before_routes() {
    let mut fixture = Fixture::new();
    fixture.apply_policy(mk_policy(
        "canary",
        serde_json::json!({
            "destinationSelector": { "serviceRefs": { "services": [reviews_ref()] } },
            "trafficShift": {
                "destinations": [
                    { "destination": reviews_ref(), "weight": 90, "subset": { "version": "v1" } },
                    { "destination": reviews_ref(), "weight": 10, "subset": { "version": "v2" } },
                ],
            },
        }),
    ));

    fixture.reconciler.reconcile().await;
    let calls = fixture.calls();
    assert_eq!(calls.len(), 2);
    let Call::Subsets { service, names } = &calls[0] else {
        panic!("subsets must be written first: {calls:?}");
    };
    assert_eq!(*service, ClusterRef::new("reviews", "bookinfo", "c1"));
    assert_eq!(*names, vec!["version-v1", "version-v2"]);
    assert!(matches!(calls[1], Call::VirtualService { .. }));
}

#[tokio::test]
async fn destinations_outside_istio_are_skipped() {
    let mut fixture = Fixture::new();
    <Index as IndexNamespacedResource<k8s::Mesh>>::delete(
        &mut fixture.index.write(),
        "discovery".to_string(),
        "istio-c1".to_string(),
    );
    fixture.apply_policy(mk_policy(
        "timeout",
        serde_json::json!({
            "destinationSelector": { "serviceRefs": { "services": [reviews_ref()] } },
            "requestTimeout": "2s",
        }),
    ));

    let updates = fixture.reconciler.reconcile().await;
    assert_eq!(state(&status_of(&updates[0]).translation_status), "ACCEPTED");
    assert!(fixture.calls().is_empty());
}

#[tokio::test]
async fn failed_source_lookups_are_processing_errors() {
    let mut fixture = Fixture::with_lookup(MockLookup { fail: true });
    fixture.index.write().apply(mk_workload("productpage", "c1"));
    fixture.apply_policy(mk_policy(
        "from-productpage",
        serde_json::json!({
            "sourceSelector": { "labels": { "app": "productpage" } },
            "destinationSelector": { "serviceRefs": { "services": [reviews_ref()] } },
            "requestTimeout": "2s",
        }),
    ));

    let updates = fixture.reconciler.reconcile().await;
    let translation = status_of(&updates[0])
        .translation_status
        .expect("must be set");
    assert_eq!(translation.state, "PROCESSING_ERROR");
    assert!(translation
        .message
        .expect("message must be set")
        .contains("unreachable"));
}

#[test]
fn events_skip_unchanged_generations() {
    let (tx, mut rx) = mpsc::channel(8);
    let mut events = Events::new(tx);

    let policy = mk_policy("a", serde_json::json!({}));
    events.apply(policy.clone());
    events.apply(policy.clone());
    let mut updated = policy;
    updated.metadata.generation = Some(2);
    events.apply(updated);
    <Events as IndexNamespacedResource<k8s::TrafficPolicy>>::delete(
        &mut events,
        "ns".to_string(),
        "a".to_string(),
    );

    let id = ResourceId::new("ns", "a");
    let mut received = Vec::new();
    while let Ok(event) = rx.try_recv() {
        received.push(event);
    }
    assert_eq!(
        received,
        vec![
            Event::Apply(Kind::TrafficPolicy(id.clone())),
            Event::Apply(Kind::TrafficPolicy(id.clone())),
            Event::Delete(Kind::TrafficPolicy(id.clone())),
        ]
    );

    assert_eq!(
        Event::Apply(Kind::Mesh(id.clone())).dispatch(),
        Dispatch::Run(Kind::Mesh(id.clone()))
    );
    assert_eq!(
        Event::Delete(Kind::TrafficPolicy(id)).dispatch(),
        Dispatch::Ignored
    );
    assert_eq!(Event::Generic.dispatch(), Dispatch::Ignored);
}

#[tokio::test]
async fn leader_sends_status_updates() {
    let fixture = Fixture::new();
    fixture.apply_policy(mk_policy(
        "timeout",
        serde_json::json!({
            "destinationSelector": { "serviceRefs": { "services": [reviews_ref()] } },
            "requestTimeout": "2s",
        }),
    ));

    let (events_tx, events_rx) = mpsc::channel(8);
    let (updates_tx, mut updates_rx) = mpsc::channel(8);
    let (_claims_tx, claims_rx) = watch::channel(claim("test"));
    let (signal, drain) = drain::channel();
    let task = tokio::spawn(run(
        fixture.reconciler,
        events_rx,
        claims_rx,
        "test".to_string(),
        updates_tx,
        RESYNC,
        drain,
    ));

    // Pending events are coalesced into a single run.
    for _ in 0..3 {
        events_tx
            .send(Event::Apply(Kind::TrafficPolicy(ResourceId::new("ns", "timeout"))))
            .await
            .expect("queue must be open");
    }
    let update = updates_rx.recv().await.expect("update must be sent");
    assert_eq!(update.id, ResourceId::new("ns", "timeout"));

    signal.drain().await;
    task.await.expect("task must complete");
    assert!(updates_rx.try_recv().is_err());
}

#[tokio::test]
async fn followers_do_not_reconcile() {
    let fixture = Fixture::new();
    let (events_tx, events_rx) = mpsc::channel(8);
    let (updates_tx, mut updates_rx) = mpsc::channel(8);
    let (_claims_tx, claims_rx) = watch::channel(claim("other"));
    let (signal, drain) = drain::channel();
    let task = tokio::spawn(run(
        fixture.reconciler,
        events_rx,
        claims_rx,
        "test".to_string(),
        updates_tx,
        RESYNC,
        drain,
    ));

    fixture
        .index
        .write()
        .apply(mk_policy("timeout", serde_json::json!({})));
    events_tx
        .send(Event::Apply(Kind::TrafficPolicy(ResourceId::new("ns", "timeout"))))
        .await
        .expect("queue must be open");
    drop(events_tx);

    task.await.expect("task must complete");
    drop(signal);
    assert!(updates_rx.recv().await.is_none());
    assert!(fixture.writer.calls.lock().is_empty());
}

#[tokio::test]
async fn cancelled_runs_send_no_status() {
    let started = Arc::new(Notify::new());
    let mut fixture = Fixture::new();
    fixture.writer.block = Some(started.clone());
    fixture.reconciler.writer = fixture.writer.clone();
    fixture.apply_policy(mk_policy(
        "timeout",
        serde_json::json!({
            "destinationSelector": { "serviceRefs": { "services": [reviews_ref()] } },
            "requestTimeout": "2s",
        }),
    ));

    let (events_tx, events_rx) = mpsc::channel(8);
    let (updates_tx, mut updates_rx) = mpsc::channel(8);
    let (_claims_tx, claims_rx) = watch::channel(claim("test"));
    let (signal, drain) = drain::channel();
    let task = tokio::spawn(run(
        fixture.reconciler,
        events_rx,
        claims_rx,
        "test".to_string(),
        updates_tx,
        RESYNC,
        drain,
    ));

    events_tx
        .send(Event::Apply(Kind::TrafficPolicy(ResourceId::new("ns", "timeout"))))
        .await
        .expect("queue must be open");
    started.notified().await;

    signal.drain().await;
    task.await.expect("task must complete");
    assert!(updates_rx.recv().await.is_none());
}

#[tokio::test]
async fn acquiring_the_lease_rewrites_outputs() {
    let mut fixture = Fixture::new();
    fixture.apply_policy(mk_policy(
        "timeout",
        serde_json::json!({
            "destinationSelector": { "serviceRefs": { "services": [reviews_ref()] } },
            "requestTimeout": "2s",
        }),
    ));

    // Written during an earlier term as leader.
    fixture.reconciler.reconcile().await;
    assert_eq!(fixture.virtual_services().len(), 1);

    let (_events_tx, events_rx) = mpsc::channel(8);
    let (updates_tx, mut updates_rx) = mpsc::channel(8);
    let (claims_tx, claims_rx) = watch::channel(claim("other"));
    let (signal, drain) = drain::channel();
    let writer = fixture.writer.clone();
    let task = tokio::spawn(run(
        fixture.reconciler,
        events_rx,
        claims_rx,
        "test".to_string(),
        updates_tx,
        RESYNC,
        drain,
    ));

    claims_tx.send(claim("test")).expect("claims must be watched");
    updates_rx.recv().await.expect("update must be sent");

    let calls = writer.calls.lock().clone();
    let written = calls
        .iter()
        .filter(|c| matches!(c, Call::VirtualService { .. }))
        .count();
    assert_eq!(written, 2, "the VirtualService must be applied again");

    signal.drain().await;
    task.await.expect("task must complete");
}

#[tokio::test(start_paused = true)]
async fn resyncs_rewrite_outputs() {
    let fixture = Fixture::new();
    fixture.apply_policy(mk_policy(
        "timeout",
        serde_json::json!({
            "destinationSelector": { "serviceRefs": { "services": [reviews_ref()] } },
            "requestTimeout": "2s",
        }),
    ));

    let (events_tx, events_rx) = mpsc::channel(8);
    let (updates_tx, mut updates_rx) = mpsc::channel(8);
    let (_claims_tx, claims_rx) = watch::channel(claim("test"));
    let (signal, drain) = drain::channel();
    let writer = fixture.writer.clone();
    let task = tokio::spawn(run(
        fixture.reconciler,
        events_rx,
        claims_rx,
        "test".to_string(),
        updates_tx,
        time::Duration::from_secs(60),
        drain,
    ));

    events_tx
        .send(Event::Apply(Kind::TrafficPolicy(ResourceId::new("ns", "timeout"))))
        .await
        .expect("queue must be open");
    updates_rx.recv().await.expect("update must be sent");
    assert_eq!(writer.calls.lock().len(), 1);

    // Nothing changed, but the VirtualService may have been edited or deleted
    // in its cluster, so the next resync applies it again.
    updates_rx.recv().await.expect("update must be sent");
    let calls = writer.calls.lock().clone();
    assert!(matches!(
        calls.as_slice(),
        [Call::VirtualService { .. }, Call::VirtualService { .. }]
    ));

    signal.drain().await;
    task.await.expect("task must complete");
}

fn claim(holder: &str) -> Arc<Claim> {
    Arc::new(Claim {
        holder: holder.to_string(),
        expiry: chrono::Utc::now() + chrono::Duration::seconds(300),
    })
}

fn status_of(update: &Update) -> TrafficPolicyStatus {
    let k8s::Patch::Merge(value) = &update.patch else {
        panic!("status must be patched with a merge patch");
    };
    serde_json::from_value(value["status"].clone()).expect("status must deserialize")
}

fn state(status: &Option<k8s::networking::StateStatus>) -> &str {
    status.as_ref().map(|s| s.state.as_str()).unwrap_or_default()
}

fn reviews_ref() -> serde_json::Value {
    serde_json::json!({ "name": "reviews", "namespace": "bookinfo", "cluster": "c1" })
}

fn mk_policy(name: &str, spec: serde_json::Value) -> k8s::TrafficPolicy {
    let spec: TrafficPolicySpec = serde_json::from_value(spec).expect("spec must deserialize");
    let mut policy = k8s::TrafficPolicy::new(name, spec);
    policy.metadata.namespace = Some("ns".to_string());
    policy.metadata.generation = Some(1);
    policy
}

fn mk_mesh_service(name: &str, cluster: &str) -> k8s::MeshService {
    let mut svc = k8s::MeshService::new(
        &format!("{name}-{cluster}"),
        MeshServiceSpec {
            kube_service: KubeService {
                service_ref: ClusterObjectRef {
                    name: name.to_string(),
                    namespace: "bookinfo".to_string(),
                    cluster_name: cluster.to_string(),
                },
                labels: btreemap! { "app".to_string() => name.to_string() },
                ports: vec![KubeServicePort {
                    port: 9080,
                    name: Some("http".to_string()),
                    protocol: Some("TCP".to_string()),
                }],
            },
            mesh: ResourceRef {
                name: format!("istio-{cluster}"),
                namespace: "discovery".to_string(),
            },
            subsets: btreemap! {
                "version".to_string() => SubsetValues {
                    values: vec!["v1".to_string(), "v2".to_string()],
                },
            },
            federation: Some(Federation {
                multicluster_dns_name: Some(format!("{name}.bookinfo.global")),
            }),
        },
    );
    svc.metadata.namespace = Some("discovery".to_string());
    svc
}

fn mk_istio_mesh(name: &str, cluster: &str) -> k8s::Mesh {
    let mut mesh = k8s::Mesh::new(
        name,
        MeshSpec {
            cluster: ResourceRef {
                name: cluster.to_string(),
                namespace: "discovery".to_string(),
            },
            istio: Some(IstioMesh {
                installation: MeshInstallation {
                    installation_namespace: "istio-system".to_string(),
                    version: None,
                },
            }),
            linkerd: None,
        },
    );
    mesh.metadata.namespace = Some("discovery".to_string());
    mesh
}

fn mk_workload(name: &str, cluster: &str) -> k8s::MeshWorkload {
    let mut wl = k8s::MeshWorkload::new(
        &format!("{name}-{cluster}"),
        MeshWorkloadSpec {
            kube_controller: KubeController {
                kube_controller_ref: ClusterObjectRef {
                    name: name.to_string(),
                    namespace: "bookinfo".to_string(),
                    cluster_name: cluster.to_string(),
                },
                api_version: None,
                kind: None,
                labels: btreemap! { "app".to_string() => name.to_string() },
                service_account_name: format!("bookinfo-{name}"),
            },
            mesh: ResourceRef {
                name: format!("istio-{cluster}"),
                namespace: "discovery".to_string(),
            },
        },
    );
    wl.metadata.namespace = Some("discovery".to_string());
    wl
}
