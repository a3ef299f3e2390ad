use kubert::lease::Claim;
use mesh_policy_controller_core::{ResourceId, POLICY_CONTROLLER_NAME};
use mesh_policy_controller_k8s_api::{self as k8s, Resource, TrafficPolicyStatus};
use prometheus_client::{metrics::counter::Counter, registry::Registry};
use std::sync::Arc;
use tokio::{
    sync::{mpsc, watch},
    time,
};

/// Applies status patches sent by the reconciler.
///
/// Only the holder of the write lease patches statuses; updates received by
/// other replicas are dropped. Failed patches are not retried: a later
/// reconciliation will produce them again.
pub struct Controller {
    claims: watch::Receiver<Arc<Claim>>,
    client: k8s::Client,
    name: String,
    updates: mpsc::Receiver<Update>,
    patch_timeout: time::Duration,
    metrics: ControllerMetrics,
}

#[derive(Clone, Debug)]
pub struct ControllerMetrics {
    patch_succeeded: Counter,
    patch_failed: Counter,
    patch_timeout: Counter,
    patch_dropped: Counter,
}

#[derive(Debug, PartialEq)]
pub struct Update {
    pub id: ResourceId,
    pub patch: k8s::Patch<serde_json::Value>,
}

// === impl Controller ===

impl Controller {
    pub fn new(
        claims: watch::Receiver<Arc<Claim>>,
        client: k8s::Client,
        name: String,
        updates: mpsc::Receiver<Update>,
        patch_timeout: time::Duration,
        metrics: ControllerMetrics,
    ) -> Self {
        Self {
            claims,
            client,
            name,
            updates,
            patch_timeout,
            metrics,
        }
    }

    pub async fn run(mut self) {
        let patch_params = k8s::PatchParams::apply(POLICY_CONTROLLER_NAME);

        while let Some(Update { id, patch }) = self.updates.recv().await {
            if !self.claims.borrow().is_current_for(&self.name) {
                tracing::debug!(%id, "Not the lease holder; dropping status update");
                self.metrics.patch_dropped.inc();
                continue;
            }

            let api = k8s::Api::<k8s::TrafficPolicy>::namespaced(
                self.client.clone(),
                &id.namespace,
            );
            match time::timeout(
                self.patch_timeout,
                api.patch_status(&id.name, &patch_params, &patch),
            )
            .await
            {
                Ok(Ok(_)) => {
                    tracing::debug!(%id, "Patched TrafficPolicy status");
                    self.metrics.patch_succeeded.inc();
                }
                Ok(Err(error)) => {
                    tracing::error!(namespace = %id.namespace, name = %id.name, %error, "Failed to patch TrafficPolicy status");
                    self.metrics.patch_failed.inc();
                }
                Err(_) => {
                    tracing::error!(namespace = %id.namespace, name = %id.name, timeout = ?self.patch_timeout, "Timed out patching TrafficPolicy status");
                    self.metrics.patch_timeout.inc();
                }
            }
        }
    }
}

// === impl ControllerMetrics ===

impl ControllerMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let patch_succeeded = Counter::default();
        prom.register(
            "patch_succeeded",
            "Counter of successful status patches",
            patch_succeeded.clone(),
        );

        let patch_failed = Counter::default();
        prom.register(
            "patch_failed",
            "Counter of failed status patches",
            patch_failed.clone(),
        );

        let patch_timeout = Counter::default();
        prom.register(
            "patch_timeout",
            "Counter of status patches that timed out",
            patch_timeout.clone(),
        );

        let patch_dropped = Counter::default();
        prom.register(
            "patch_dropped",
            "Counter of status patches dropped because this replica is not the leader",
            patch_dropped.clone(),
        );

        Self {
            patch_succeeded,
            patch_failed,
            patch_timeout,
            patch_dropped,
        }
    }
}

/// Builds a merge patch that replaces a policy's status.
///
/// Unset fields serialize as `null`, which removes them from the stored
/// status.
pub fn make_patch(id: &ResourceId, status: &TrafficPolicyStatus) -> k8s::Patch<serde_json::Value> {
    let value = serde_json::json!({
        "apiVersion": k8s::TrafficPolicy::api_version(&()),
        "kind": k8s::TrafficPolicy::kind(&()),
        "name": id.name,
        "status": status,
    });
    k8s::Patch::Merge(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_policy_controller_k8s_api::networking::StateStatus;
    use pretty_assertions::assert_eq;

    #[test]
    fn patch_clears_unset_fields() {
        let status = TrafficPolicyStatus {
            observed_generation: Some(4),
            validation_status: Some(StateStatus {
                state: "ACCEPTED".to_string(),
                message: None,
            }),
            ..Default::default()
        };
        let patch = make_patch(&ResourceId::new("ns", "tp"), &status);
        let k8s::Patch::Merge(value) = patch else {
            panic!("status must be patched with a merge patch");
        };
        assert_eq!(
            value,
            serde_json::json!({
                "apiVersion": "networking.mesh.io/v1alpha1",
                "kind": "TrafficPolicy",
                "name": "tp",
                "status": {
                    "observedGeneration": 4,
                    "validationStatus": { "state": "ACCEPTED", "message": null },
                    "translationStatus": null,
                    "conflictErrors": [],
                    "translatorErrors": [],
                },
            })
        );
    }
}
