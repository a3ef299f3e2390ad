use crate::{
    admission::Admission,
    clusters::{Clusters, RemoteCluster},
    index::{metrics::IndexMetrics, Index},
    index_list::IndexList,
    istio::Translator,
    k8s, lease,
    pipeline::{self, Events, PipelineMetrics, Reconciler},
    status,
};
use anyhow::{bail, Context, Result};
use clap::Parser;
use kube::runtime::watcher;
use prometheus_client::registry::Registry;
use tokio::{sync::mpsc, time::Duration};
use tracing::{info_span, Instrument};

// Events are coalesced before each run, so the queue only needs to absorb the
// initial listing of every watched resource.
const EVENT_QUEUE_SIZE: usize = 10_000;

// The maximum number of status patches to buffer. Each run sends at most one
// update per policy.
const STATUS_UPDATE_QUEUE_SIZE: usize = 10_000;

#[derive(Debug, Parser)]
#[clap(
    name = "mesh-policy-controller",
    about = "Translates mesh traffic policies into Istio configuration"
)]
pub struct Args {
    #[clap(
        long,
        default_value = "mesh=info,warn",
        env = "MESH_POLICY_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    server: kubert::ServerArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Disables the admission controller server.
    #[clap(long)]
    admission_controller_disabled: bool,

    #[clap(long, default_value = "mesh-system")]
    controller_namespace: String,

    #[clap(long, default_value = "mesh-policy-controller")]
    controller_deployment_name: String,

    /// The name under which the cluster running the controller is registered.
    #[clap(long, default_value = "local")]
    local_cluster_name: String,

    /// A registered cluster and the kubeconfig context used to reach it, as
    /// `NAME=CONTEXT`. May be repeated.
    #[clap(long = "remote-cluster")]
    remote_clusters: Vec<RemoteCluster>,

    /// The number of destinations whose outputs are written concurrently.
    #[clap(long, default_value = "8")]
    worker_concurrency: usize,

    #[clap(long, default_value = "5000")]
    patch_timeout_ms: u64,

    /// How often every output is rewritten, even when no input has changed.
    #[clap(long, default_value = "300")]
    resync_interval_secs: u64,

    #[clap(long, default_value = "cluster.local")]
    cluster_domain: String,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            server,
            admission_controller_disabled,
            controller_namespace,
            controller_deployment_name,
            local_cluster_name,
            remote_clusters,
            worker_concurrency,
            patch_timeout_ms,
            resync_interval_secs,
            cluster_domain,
        } = self;

        if worker_concurrency == 0 {
            bail!("--worker-concurrency must be at least 1");
        }
        if resync_interval_secs == 0 {
            bail!("--resync-interval-secs must be at least 1");
        }

        let server = if admission_controller_disabled {
            None
        } else {
            Some(server)
        };

        let index = Index::shared();

        let mut prom = <Registry>::default();
        let index_metrics =
            IndexMetrics::register(index.clone(), prom.sub_registry_with_prefix("index")).shared();
        let status_metrics =
            status::ControllerMetrics::register(prom.sub_registry_with_prefix("resource_status"));
        let pipeline_metrics = PipelineMetrics::register(prom.sub_registry_with_prefix("pipeline"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .with_optional_server(server)
            .build()
            .await?;

        let hostname =
            std::env::var("HOSTNAME").context("failed to fetch HOSTNAME environment variable")?;

        let claims = lease::init(
            &runtime,
            &controller_namespace,
            &controller_deployment_name,
            &hostname,
        )
        .await?;

        let clusters = Clusters::load(local_cluster_name, runtime.client(), &remote_clusters).await?;

        // Watches update the index before emitting the event that triggers a
        // reconciliation.
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_SIZE);
        let events = Events::new(events_tx).shared();

        let policies = runtime.watch_all::<k8s::TrafficPolicy>(watcher::Config::default());
        let policies_indexes = IndexList::new(index_metrics.clone())
            .push(events.clone())
            .shared();
        tokio::spawn(
            kubert::index::namespaced(policies_indexes, policies)
                .instrument(info_span!("trafficpolicies")),
        );

        let services = runtime.watch_all::<k8s::MeshService>(watcher::Config::default());
        let services_indexes = IndexList::new(index_metrics.clone())
            .push(events.clone())
            .shared();
        tokio::spawn(
            kubert::index::namespaced(services_indexes, services)
                .instrument(info_span!("meshservices")),
        );

        let meshes = runtime.watch_all::<k8s::Mesh>(watcher::Config::default());
        let meshes_indexes = IndexList::new(index_metrics.clone())
            .push(events)
            .shared();
        tokio::spawn(
            kubert::index::namespaced(meshes_indexes, meshes).instrument(info_span!("meshes")),
        );

        let workloads = runtime.watch_all::<k8s::MeshWorkload>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(index_metrics, workloads)
                .instrument(info_span!("meshworkloads")),
        );

        // Spawn the status controller, which patches the statuses produced by
        // the pipeline.
        let (updates_tx, updates_rx) = mpsc::channel(STATUS_UPDATE_QUEUE_SIZE);
        let status_controller = status::Controller::new(
            claims.clone(),
            runtime.client(),
            hostname.clone(),
            updates_rx,
            Duration::from_millis(patch_timeout_ms),
            status_metrics,
        );
        tokio::spawn(
            status_controller
                .run()
                .instrument(info_span!("status_controller")),
        );

        let reconciler = Reconciler::new(
            index.clone(),
            clusters.clone(),
            clusters,
            Translator::new(cluster_domain),
            worker_concurrency,
            pipeline_metrics,
        );
        tokio::spawn(
            pipeline::run(
                reconciler,
                events_rx,
                claims,
                hostname,
                updates_tx,
                Duration::from_secs(resync_interval_secs),
                runtime.shutdown_handle(),
            )
            .instrument(info_span!("pipeline")),
        );

        let runtime = runtime.spawn_server(move || Admission::new(index));

        // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
        // complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}
