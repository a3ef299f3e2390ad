//! Reconciles every `TrafficPolicy` into Istio configuration.
//!
//! Watches feed [`Event`]s into a bounded queue. A single consumer drains
//! whatever is pending and runs the pipeline once against an immutable
//! snapshot of the index: policies are validated, merged per destination,
//! translated, and written to the cluster that runs each destination. The
//! outcome of the run determines each policy's status, and only statuses that
//! differ from what is recorded on the resource are sent to the status
//! controller.

use crate::{
    core::{
        merge_for_destinations, validate, ClusterRef, ControllerLookup, Destination, ResourceId,
        TrafficPolicy, ValidationState,
    },
    index::{SharedIndex, Snapshot},
    istio::{DestinationRuleSubsetUpdate, Translation, Translator},
    k8s::{
        self,
        istio::{VirtualService, VirtualServiceSpec},
        ResourceExt,
    },
    status::{make_patch, Results, Update},
};
use anyhow::Result;
use futures::prelude::*;
use kubert::{index::IndexNamespacedResource, lease::Claim};
use parking_lot::RwLock;
use prometheus_client::{
    metrics::{
        counter::Counter,
        histogram::{exponential_buckets, Histogram},
    },
    registry::Registry,
};
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};
use tokio::{
    sync::{mpsc, watch},
    time,
};
use tracing::Instrument;

#[cfg(test)]
mod tests;

/// Writes translated outputs to the cluster that runs each destination.
#[async_trait::async_trait]
pub trait OutputWriter {
    async fn apply_virtual_service(&self, cluster: &str, vs: &VirtualService) -> Result<()>;

    async fn upsert_subsets(
        &self,
        service: &ClusterRef,
        host: &str,
        subsets: &[DestinationRuleSubsetUpdate],
    ) -> Result<()>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Kind {
    TrafficPolicy(ResourceId),
    Destination(ResourceId),
    Mesh(ResourceId),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Apply(Kind),
    Delete(Kind),
    Generic,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Dispatch {
    Run(Kind),
    Ignored,
}

/// Emits an [`Event`] for each watch update.
///
/// Composed after the index so that a run triggered by an event always
/// observes the update that caused it.
pub struct Events {
    tx: mpsc::Sender<Event>,
    generations: HashMap<ResourceId, Option<i64>>,
}

pub struct Reconciler<W, L> {
    index: SharedIndex,
    writer: W,
    lookup: L,
    translator: Translator,
    concurrency: usize,

    /// The last VirtualService spec written for each destination.
    applied: HashMap<ClusterRef, VirtualServiceSpec>,

    metrics: PipelineMetrics,
}

#[derive(Clone, Debug)]
pub struct PipelineMetrics {
    runs: Counter,
    conflicts: Counter,
    translation_errors: Counter,
    write_failures: Counter,
    duration: Histogram,
}

/// The outputs of one destination.
struct Output {
    destination: Destination,
    translation: Translation,
    applicable: Vec<ResourceId>,
}

struct Written {
    service: ClusterRef,
    applicable: Vec<ResourceId>,
    applied: Option<VirtualServiceSpec>,
    error: Option<anyhow::Error>,
}

/// Consumes events until the queue closes or shutdown is signaled.
///
/// Runs are skipped while another replica holds the write lease; acquiring
/// the lease triggers a run. Every `resync` period, and whenever the lease is
/// acquired, the record of applied outputs is discarded so that the next run
/// rewrites them, restoring objects that were changed or deleted out of band.
/// A run interrupted by shutdown sends no status updates.
pub async fn run<W, L>(
    mut reconciler: Reconciler<W, L>,
    mut events: mpsc::Receiver<Event>,
    mut claims: watch::Receiver<Arc<Claim>>,
    name: String,
    updates: mpsc::Sender<Update>,
    resync: time::Duration,
    drain: drain::Watch,
) where
    W: OutputWriter + Send + Sync,
    L: ControllerLookup + Send + Sync,
{
    tokio::pin! {
        let shutdown = drain.signaled();
    }

    let mut resyncs = time::interval_at(time::Instant::now() + resync, resync);
    resyncs.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

    let mut leader = claims.borrow_and_update().is_current_for(&name);
    loop {
        let mut pending = tokio::select! {
            event = events.recv() => match event {
                Some(event) => event.dispatch() != Dispatch::Ignored,
                None => return,
            },

            changed = claims.changed() => {
                if changed.is_err() {
                    return;
                }
                let is_leader = claims.borrow_and_update().is_current_for(&name);
                let acquired = is_leader && !leader;
                leader = is_leader;
                if acquired {
                    tracing::info!("Acquired write lease");
                    reconciler.forget_applied();
                }
                acquired
            },

            _ = resyncs.tick() => {
                tracing::debug!("Resyncing outputs");
                reconciler.forget_applied();
                true
            },

            _ = &mut shutdown => return,
        };

        while let Ok(event) = events.try_recv() {
            pending |= event.dispatch() != Dispatch::Ignored;
        }
        if !pending {
            continue;
        }
        if !claims.borrow().is_current_for(&name) {
            tracing::debug!("Not the lease holder; skipping reconciliation");
            continue;
        }

        let statuses = tokio::select! {
            statuses = reconciler.reconcile().instrument(tracing::info_span!("reconcile")) => statuses,
            _ = &mut shutdown => {
                tracing::info!("Reconciliation cancelled");
                return;
            }
        };
        for update in statuses {
            if updates.send(update).await.is_err() {
                return;
            }
        }
    }
}

// === impl Event ===

impl Event {
    pub fn dispatch(self) -> Dispatch {
        match self {
            Self::Apply(kind) => Dispatch::Run(kind),
            Self::Delete(_) | Self::Generic => Dispatch::Ignored,
        }
    }
}

// === impl Events ===

impl Events {
    pub fn new(tx: mpsc::Sender<Event>) -> Self {
        Self {
            tx,
            generations: HashMap::default(),
        }
    }

    pub fn shared(self) -> Arc<RwLock<Self>> {
        Arc::new(RwLock::new(self))
    }

    fn send(&self, event: Event) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                tracing::warn!(?event, "Event queue is full; dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!("Event queue closed");
            }
        }
    }
}

impl IndexNamespacedResource<k8s::TrafficPolicy> for Events {
    fn apply(&mut self, policy: k8s::TrafficPolicy) {
        let Some(namespace) = policy.namespace() else {
            return;
        };
        let id = ResourceId::new(namespace, policy.name_unchecked());

        // Status patches update the resource without changing its generation.
        let generation = policy.metadata.generation;
        if self.generations.get(&id) == Some(&generation) {
            return;
        }
        self.generations.insert(id.clone(), generation);
        self.send(Event::Apply(Kind::TrafficPolicy(id)));
    }

    fn delete(&mut self, namespace: String, name: String) {
        let id = ResourceId { namespace, name };
        self.generations.remove(&id);
        self.send(Event::Delete(Kind::TrafficPolicy(id)));
    }
}

impl IndexNamespacedResource<k8s::MeshService> for Events {
    fn apply(&mut self, svc: k8s::MeshService) {
        let id = ResourceId::new(svc.namespace().unwrap_or_default(), svc.name_unchecked());
        self.send(Event::Apply(Kind::Destination(id)));
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.send(Event::Delete(Kind::Destination(ResourceId { namespace, name })));
    }
}

impl IndexNamespacedResource<k8s::Mesh> for Events {
    fn apply(&mut self, mesh: k8s::Mesh) {
        let id = ResourceId::new(mesh.namespace().unwrap_or_default(), mesh.name_unchecked());
        self.send(Event::Apply(Kind::Mesh(id)));
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.send(Event::Delete(Kind::Mesh(ResourceId { namespace, name })));
    }
}

// === impl Reconciler ===

impl<W, L> Reconciler<W, L>
where
    W: OutputWriter + Send + Sync,
    L: ControllerLookup + Send + Sync,
{
    pub fn new(
        index: SharedIndex,
        writer: W,
        lookup: L,
        translator: Translator,
        concurrency: usize,
        metrics: PipelineMetrics,
    ) -> Self {
        Self {
            index,
            writer,
            lookup,
            translator,
            concurrency: concurrency.max(1),
            applied: HashMap::default(),
            metrics,
        }
    }

    /// Discards the record of applied VirtualServices, so the next run writes
    /// every output.
    fn forget_applied(&mut self) {
        self.applied.clear();
    }

    /// Runs the pipeline once and returns the status updates it produced.
    pub async fn reconcile(&mut self) -> Vec<Update> {
        let start = time::Instant::now();
        self.metrics.runs.inc();

        let snapshot = self.index.read().snapshot();
        let mut results = Results::default();

        let policies = self.validate(&snapshot, &mut results).await;

        let destinations = snapshot
            .selector
            .destinations()
            .iter()
            .filter(|d| match snapshot.mesh_of(d) {
                Some(mesh) => mesh.kind.is_istio(),
                None => {
                    tracing::debug!(destination = %d.service, mesh = %d.mesh, "Mesh not found");
                    false
                }
            })
            .cloned()
            .collect::<Vec<_>>();

        let merged = match merge_for_destinations(&policies, &destinations, &snapshot.selector) {
            Ok(merged) => merged,
            Err(error) => {
                tracing::error!(%error, "Failed to merge policies");
                results.processing_error(
                    policies.iter().filter(|p| p.is_accepted()).map(|p| &p.id),
                    &error,
                );
                return self.finish(&snapshot, &results, start);
            }
        };

        for conflict in &merged.conflicts {
            tracing::info!(destination = %conflict.destination, %conflict, "Conflicting policies");
            self.metrics.conflicts.inc();
            results.conflict(conflict);
        }

        let mut outputs = Vec::with_capacity(merged.merged.len());
        for (service, policies) in &merged.merged {
            let Some(destination) = destinations.iter().find(|d| d.service == *service) else {
                continue;
            };
            let translation = self
                .translator
                .translate(destination, policies, &snapshot.selector);
            for error in &translation.errors {
                self.metrics.translation_errors.inc();
                results.translator_error(error.policy.clone(), error.translator_id(), &error.error);
            }
            outputs.push(Output {
                destination: destination.clone(),
                translation,
                applicable: merged.applicable.get(service).cloned().unwrap_or_default(),
            });
        }

        let written = {
            let this = &*self;
            stream::iter(outputs)
                .map(|output| this.write(output))
                .buffer_unordered(this.concurrency)
                .collect::<Vec<_>>()
                .await
        };
        for Written {
            service,
            applicable,
            applied,
            error,
        } in written
        {
            if let Some(spec) = applied {
                self.applied.insert(service.clone(), spec);
            }
            if let Some(error) = error {
                tracing::warn!(destination = %service, error = %format_args!("{error:#}"), "Failed to write outputs");
                self.metrics.write_failures.inc();
                results.processing_error(&applicable, format_args!("{error:#}"));
            }
        }

        self.finish(&snapshot, &results, start)
    }

    /// Validates every policy, recording the policies that could not be
    /// converted or validated as invalid.
    async fn validate(&self, snapshot: &Snapshot, results: &mut Results) -> Vec<TrafficPolicy> {
        let mut policies = Vec::with_capacity(snapshot.policies.len());
        for entry in &snapshot.policies {
            let mut policy = match &entry.policy {
                Ok(policy) => policy.clone(),
                Err(error) => {
                    results.invalid(entry.id.clone(), format_args!("{error:#}"));
                    continue;
                }
            };
            match validate(&policy, &snapshot.selector) {
                Ok(()) => policy.validation = Some(ValidationState::Accepted),
                Err(errors) => {
                    tracing::debug!(policy = %entry.id, %errors, "Invalid TrafficPolicy");
                    policy.validation = Some(ValidationState::Invalid);
                    results.invalid(entry.id.clone(), errors);
                }
            }
            policies.push(policy);
        }

        // Source selectors are matched against the live labels of each
        // workload's controller. A failed lookup can't change the translated
        // routes but leaves the policy's sources unknown.
        let lookups = policies
            .iter()
            .filter(|p| p.is_accepted() && !p.source_selector.labels.is_empty())
            .map(|policy| async move {
                let resolved = snapshot
                    .selector
                    .resolve_workloads_by_selector(Some(&policy.source_selector), &self.lookup)
                    .await;
                (&policy.id, resolved)
            });
        for (id, resolved) in future::join_all(lookups).await {
            match resolved {
                Ok(workloads) => {
                    tracing::trace!(policy = %id, workloads = workloads.len(), "Resolved source workloads");
                }
                Err(error) => {
                    tracing::warn!(policy = %id, %error, "Failed to resolve source workloads");
                    results.processing_error([id], error);
                }
            }
        }

        policies
    }

    async fn write(&self, output: Output) -> Written {
        let Output {
            destination,
            translation,
            applicable,
        } = output;
        let service = destination.service.clone();
        let mut written = Written {
            service: service.clone(),
            applicable,
            applied: None,
            error: None,
        };

        // Subsets are written first so that routes never reference a subset
        // that doesn't exist yet.
        let mut subsets = BTreeMap::<&ClusterRef, Vec<DestinationRuleSubsetUpdate>>::new();
        for subset in &translation.subsets {
            subsets
                .entry(&subset.service)
                .or_default()
                .push(subset.clone());
        }
        for (target, updates) in subsets {
            let host = updates
                .first()
                .map(|u| u.host.clone())
                .unwrap_or_default();
            if let Err(error) = self.writer.upsert_subsets(target, &host, &updates).await {
                written.error = Some(error);
                return written;
            }
        }

        let Some(vs) = translation.virtual_service else {
            return written;
        };
        if self.applied.get(&service) == Some(&vs.spec) {
            tracing::trace!(destination = %service, "VirtualService unchanged");
            return written;
        }
        match self
            .writer
            .apply_virtual_service(destination.cluster(), &vs)
            .await
        {
            Ok(()) => written.applied = Some(vs.spec),
            Err(error) => written.error = Some(error),
        }
        written
    }

    fn finish(
        &self,
        snapshot: &Snapshot,
        results: &Results,
        start: time::Instant,
    ) -> Vec<Update> {
        let updates = snapshot
            .policies
            .iter()
            .filter_map(|entry| {
                let status = results.status(&entry.id, entry.generation);
                if entry.status.as_ref() == Some(&status) {
                    return None;
                }
                Some(Update {
                    id: entry.id.clone(),
                    patch: make_patch(&entry.id, &status),
                })
            })
            .collect::<Vec<_>>();

        let elapsed = start.elapsed();
        self.metrics.duration.observe(elapsed.as_secs_f64());
        tracing::debug!(
            policies = snapshot.policies.len(),
            updates = updates.len(),
            ?elapsed,
            "Reconciled"
        );
        updates
    }
}

// === impl PipelineMetrics ===

impl PipelineMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let runs = Counter::default();
        prom.register("runs", "Counter of pipeline runs", runs.clone());

        let conflicts = Counter::default();
        prom.register(
            "conflicts",
            "Counter of destinations found in conflict",
            conflicts.clone(),
        );

        let translation_errors = Counter::default();
        prom.register(
            "translation_errors",
            "Counter of translation errors attributed to policies",
            translation_errors.clone(),
        );

        let write_failures = Counter::default();
        prom.register(
            "write_failures",
            "Counter of destinations whose outputs could not be written",
            write_failures.clone(),
        );

        let duration = Histogram::new(exponential_buckets(0.001, 2.0, 14));
        prom.register(
            "run_duration_seconds",
            "Distribution of pipeline run durations",
            duration.clone(),
        );

        Self {
            runs,
            conflicts,
            translation_errors,
            write_failures,
            duration,
        }
    }
}
