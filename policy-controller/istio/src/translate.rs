use crate::{actions::Resolver, matches::match_entries, order::sort_by_specificity};
use mesh_policy_controller_core::{
    ClusterRef, Destination, MergedPolicy, ResourceId, ResourceSelector, SelectorError,
};
use mesh_policy_controller_k8s_api::istio::{
    HttpMatchRequest, HttpRoute, VirtualService, VirtualServiceSpec,
};
use std::{
    collections::{BTreeMap, BTreeSet},
    num::NonZeroU16,
};

pub const TRANSLATOR_ID: &str = "istio-translator";

const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
const MANAGED_BY: &str = "mesh-policy-controller";

#[derive(Clone, Debug)]
pub struct Translator {
    cluster_domain: String,
}

/// The Istio configuration for a single destination.
#[derive(Clone, Debug, Default)]
pub struct Translation {
    /// Unset when no policy produced a route.
    pub virtual_service: Option<VirtualService>,

    /// Subsets that must exist for the virtual service's routes to resolve.
    /// These are merged into existing rules and never replace them.
    pub subsets: Vec<DestinationRuleSubsetUpdate>,

    pub errors: Vec<PolicyTranslatorError>,
}

/// A subset to upsert into the `DestinationRule` of a service.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DestinationRuleSubsetUpdate {
    /// The service whose `DestinationRule` holds the subset. The rule has the
    /// service's name and namespace, in the service's cluster.
    pub service: ClusterRef,
    pub host: String,
    pub name: String,
    pub labels: BTreeMap<String, String>,
}

#[derive(Clone, Debug, thiserror::Error)]
pub enum TranslatorError {
    #[error("subsets are not supported for {0}, which is in a different cluster")]
    MultiClusterSubsetsNotSupported(ClusterRef),

    #[error("{0} exposes multiple ports, so a destination port must be specified")]
    NoSpecifiedPort(ClusterRef),

    #[error("{0} is in a different cluster but has no federated DNS name")]
    NotFederated(ClusterRef),

    #[error("header {0:?} is matched more than once in a single matcher")]
    DuplicateHeaderMatch(String),

    #[error("query parameter {0:?} is matched more than once in a single matcher")]
    DuplicateQueryParamMatch(String),

    #[error(transparent)]
    Resolution(#[from] SelectorError),
}

/// A translation error, attributed to one of the policies it came from.
#[derive(Clone, Debug)]
pub struct PolicyTranslatorError {
    pub policy: ResourceId,
    pub error: TranslatorError,
}

type PolicyRoutes = (Vec<HttpRoute>, Vec<DestinationRuleSubsetUpdate>);

// === impl Translator ===

impl Translator {
    pub fn new(cluster_domain: impl ToString) -> Self {
        Self {
            cluster_domain: cluster_domain.to_string(),
        }
    }

    /// Translates the merged policies of a single destination.
    ///
    /// A merged policy that cannot be translated contributes no routes; its
    /// error is reported against each of its source policies and the
    /// remaining policies are still translated.
    pub fn translate(
        &self,
        destination: &Destination,
        policies: &[MergedPolicy],
        selector: &ResourceSelector,
    ) -> Translation {
        let mut routes = Vec::new();
        let mut subsets = BTreeSet::new();
        let mut errors = Vec::new();

        for policy in policies {
            match self.translate_policy(destination, policy, selector) {
                Ok((policy_routes, policy_subsets)) => {
                    routes.extend(policy_routes);
                    subsets.extend(policy_subsets);
                }
                Err(error) => {
                    tracing::debug!(destination = %destination.service, %error, "Failed to translate policy");
                    errors.extend(policy.sources.iter().map(|id| PolicyTranslatorError {
                        policy: id.clone(),
                        error: error.clone(),
                    }));
                }
            }
        }

        if routes.is_empty() {
            return Translation {
                virtual_service: None,
                subsets: subsets.into_iter().collect(),
                errors,
            };
        }

        sort_by_specificity(&mut routes);
        let virtual_service = self.virtual_service(destination, routes);
        Translation {
            virtual_service: Some(virtual_service),
            subsets: subsets.into_iter().collect(),
            errors,
        }
    }

    /// The fully-qualified in-cluster name of a destination's service.
    pub fn hostname(&self, destination: &Destination) -> String {
        format!(
            "{}.{}.svc.{}",
            destination.service.name, destination.service.namespace, self.cluster_domain
        )
    }

    fn translate_policy(
        &self,
        destination: &Destination,
        policy: &MergedPolicy,
        selector: &ResourceSelector,
    ) -> Result<PolicyRoutes, TranslatorError> {
        // Istio requires a port on every destination of a multi-port service.
        // Without a traffic shift there's nothing to infer a port from, and
        // with one the route is scoped to each of the target's ports in turn.
        let ports: Vec<Option<NonZeroU16>> = if destination.ports.len() > 1 {
            if policy.actions.traffic_shift.is_none() {
                return Err(TranslatorError::NoSpecifiedPort(
                    destination.service.clone(),
                ));
            }
            destination.ports.iter().map(|p| Some(p.port)).collect()
        } else {
            vec![None]
        };

        let entries = match_entries(&policy.source_selector, &policy.http_matchers)?;
        let mut routes = Vec::with_capacity(entries.len() * ports.len());
        let mut subsets = Vec::new();
        for port in ports {
            let resolver = Resolver {
                translator: self,
                target: destination,
                selector,
                port,
            };
            let (route, port_subsets) = resolver.route(policy.actions.traffic_shift.as_ref())?;
            subsets.extend(port_subsets);

            let mut base = HttpRoute {
                route,
                ..Default::default()
            };
            resolver.apply(&mut base, &policy.actions)?;

            for entry in &entries {
                let mut entry = entry.clone();
                entry.port = port.map(|p| p.get().into());
                let mut route = base.clone();
                if entry != HttpMatchRequest::default() {
                    route.matches = vec![entry];
                }
                routes.push(route);
            }
        }

        Ok((routes, subsets))
    }

    fn virtual_service(&self, destination: &Destination, http: Vec<HttpRoute>) -> VirtualService {
        let mut vs = VirtualService::new(
            &destination.service.name,
            VirtualServiceSpec {
                hosts: vec![self.hostname(destination)],
                http,
            },
        );
        vs.metadata.namespace = Some(destination.service.namespace.clone());
        vs.metadata.labels = Some(
            [(MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string())]
                .into_iter()
                .collect(),
        );
        vs
    }
}

// === impl PolicyTranslatorError ===

impl PolicyTranslatorError {
    #[inline]
    pub fn translator_id(&self) -> &'static str {
        TRANSLATOR_ID
    }
}
