//! Clients for the registered clusters.
//!
//! Discovery and policy resources live in the management cluster, while
//! workload controllers and Istio outputs live in the cluster that runs each
//! service. Every registered cluster is reached through a context in the
//! controller's kubeconfig; the local cluster reuses the runtime's client.

use crate::{
    core::{ClusterRef, ControllerLookup, ControllerRef, POLICY_CONTROLLER_NAME},
    istio::DestinationRuleSubsetUpdate,
    k8s::{
        self,
        istio::{DestinationRule, DestinationRuleSpec, Subset, VirtualService},
        ResourceExt,
    },
    pipeline::OutputWriter,
};
use anyhow::{bail, Context, Result};
use backon::{ExponentialBuilder, Retryable};
use std::{collections::BTreeMap, future::Future, str::FromStr, sync::Arc, time::Duration};

const LOOKUP_RETRIES: usize = 3;
const LOOKUP_MIN_BACKOFF: Duration = Duration::from_millis(100);
const LOOKUP_MAX_BACKOFF: Duration = Duration::from_secs(2);

/// A remote cluster registration, parsed from `NAME=CONTEXT`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteCluster {
    pub name: String,
    pub context: String,
}

#[derive(Clone)]
pub struct Clusters {
    clients: Arc<BTreeMap<String, k8s::Client>>,
}

// === impl RemoteCluster ===

impl FromStr for RemoteCluster {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let Some((name, context)) = s.split_once('=') else {
            bail!("remote cluster must be specified as NAME=CONTEXT: {s}");
        };
        if name.is_empty() || context.is_empty() {
            bail!("remote cluster must be specified as NAME=CONTEXT: {s}");
        }
        Ok(Self {
            name: name.to_string(),
            context: context.to_string(),
        })
    }
}

// === impl Clusters ===

impl Clusters {
    pub async fn load(
        local_name: String,
        local: k8s::Client,
        remotes: &[RemoteCluster],
    ) -> Result<Self> {
        let mut clients = BTreeMap::new();
        clients.insert(local_name, local);

        for RemoteCluster { name, context } in remotes {
            let options = kube::config::KubeConfigOptions {
                context: Some(context.clone()),
                ..Default::default()
            };
            let config = kube::Config::from_kubeconfig(&options)
                .await
                .with_context(|| format!("failed to load kubeconfig context {context}"))?;
            let client = k8s::Client::try_from(config)
                .with_context(|| format!("failed to build client for cluster {name}"))?;
            if clients.insert(name.clone(), client).is_some() {
                bail!("cluster {name} is registered more than once");
            }
            tracing::info!(cluster = %name, %context, "Registered remote cluster");
        }

        Ok(Self {
            clients: Arc::new(clients),
        })
    }

    pub fn client(&self, cluster: &str) -> Result<k8s::Client> {
        self.clients
            .get(cluster)
            .cloned()
            .with_context(|| format!("cluster {cluster} is not registered"))
    }
}

#[async_trait::async_trait]
impl ControllerLookup for Clusters {
    async fn controller_labels(&self, controller: &ControllerRef) -> Result<BTreeMap<String, String>> {
        let client = self.client(&controller.cluster)?;
        let (group, version) = match controller.api_version.split_once('/') {
            Some((group, version)) => (group, version),
            None => ("", controller.api_version.as_str()),
        };
        let gvk = k8s::GroupVersionKind::gvk(group, version, &controller.kind);
        let resource = k8s::ApiResource::from_gvk(&gvk);
        let api = k8s::Api::<k8s::DynamicObject>::namespaced_with(
            client,
            &controller.namespace,
            &resource,
        );

        let object = retry_transient(|| api.get(&controller.name))
            .await
            .with_context(|| format!("failed to fetch controller {controller}"))?;

        // Compare against the pod template when the controller has one.
        let template = object
            .data
            .pointer("/spec/template/metadata/labels")
            .and_then(|labels| labels.as_object());
        let labels = match template {
            Some(labels) => labels
                .iter()
                .filter_map(|(k, v)| Some((k.clone(), v.as_str()?.to_string())))
                .collect(),
            None => object.labels().clone(),
        };
        Ok(labels)
    }
}

#[async_trait::async_trait]
impl OutputWriter for Clusters {
    async fn apply_virtual_service(&self, cluster: &str, vs: &VirtualService) -> Result<()> {
        let namespace = vs.namespace().context("VirtualService must be namespaced")?;
        let api = k8s::Api::<VirtualService>::namespaced(self.client(cluster)?, &namespace);
        let params = k8s::PatchParams::apply(POLICY_CONTROLLER_NAME).force();
        api.patch(&vs.name_any(), &params, &k8s::Patch::Apply(vs))
            .await
            .with_context(|| {
                format!("failed to apply VirtualService {namespace}/{}", vs.name_any())
            })?;
        tracing::debug!(%cluster, %namespace, name = %vs.name_any(), "Applied VirtualService");
        Ok(())
    }

    async fn upsert_subsets(
        &self,
        service: &ClusterRef,
        host: &str,
        subsets: &[DestinationRuleSubsetUpdate],
    ) -> Result<()> {
        let api = k8s::Api::<DestinationRule>::namespaced(
            self.client(&service.cluster)?,
            &service.namespace,
        );
        let existing = api
            .get_opt(&service.name)
            .await
            .with_context(|| format!("failed to fetch DestinationRule for {service}"))?;

        match existing {
            Some(mut rule) => {
                if !merge_subsets(&mut rule.spec.subsets, subsets) {
                    return Ok(());
                }
                api.replace(&service.name, &k8s::PostParams::default(), &rule)
                    .await
                    .with_context(|| format!("failed to update DestinationRule for {service}"))?;
                tracing::debug!(%service, "Updated DestinationRule subsets");
            }
            None => {
                let mut spec = DestinationRuleSpec {
                    host: host.to_string(),
                    ..Default::default()
                };
                merge_subsets(&mut spec.subsets, subsets);
                let mut rule = DestinationRule::new(&service.name, spec);
                rule.metadata.namespace = Some(service.namespace.clone());
                api.create(&k8s::PostParams::default(), &rule)
                    .await
                    .with_context(|| format!("failed to create DestinationRule for {service}"))?;
                tracing::debug!(%service, "Created DestinationRule");
            }
        }
        Ok(())
    }
}

/// Runs a Kubernetes API call, retrying transient failures with exponential
/// backoff.
async fn retry_transient<T, F, Fut>(call: F) -> Result<T, k8s::Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, k8s::Error>>,
{
    let backoff = ExponentialBuilder::default()
        .with_min_delay(LOOKUP_MIN_BACKOFF)
        .with_max_delay(LOOKUP_MAX_BACKOFF)
        .with_max_times(LOOKUP_RETRIES);
    call.retry(backoff)
        .when(is_transient)
        .notify(|error, after| tracing::debug!(%error, ?after, "Retrying API call"))
        .await
}

/// Not-found and other client errors are permanent; server errors, throttling
/// and transport failures may succeed on retry.
fn is_transient(error: &k8s::Error) -> bool {
    match error {
        k8s::Error::Api(rsp) => rsp.code >= 500 || rsp.code == 429,
        _ => true,
    }
}

/// Upserts subsets by name, leaving other subsets and the unmanaged fields of
/// existing subsets alone. Returns true if anything changed.
fn merge_subsets(existing: &mut Vec<Subset>, updates: &[DestinationRuleSubsetUpdate]) -> bool {
    let mut changed = false;
    for update in updates {
        match existing.iter_mut().find(|s| s.name == update.name) {
            Some(subset) if subset.labels == update.labels => {}
            Some(subset) => {
                subset.labels = update.labels.clone();
                changed = true;
            }
            None => {
                existing.push(Subset {
                    name: update.name.clone(),
                    labels: update.labels.clone(),
                    ..Default::default()
                });
                changed = true;
            }
        }
    }
    changed
}
