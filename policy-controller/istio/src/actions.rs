use crate::{
    matches::string_match,
    translate::{DestinationRuleSubsetUpdate, Translator, TranslatorError},
};
use mesh_policy_controller_core::{
    traffic_policy::{
        ActionSpec, CorsPolicy, Fault, FaultInjection, HeaderManipulation, Mirror, RetryPolicy,
        TrafficShift,
    },
    Destination, ResourceSelector,
};
use mesh_policy_controller_k8s_api::istio;
use std::{collections::BTreeMap, num::NonZeroU16, time};

/// Resolves references to other destinations relative to the destination
/// being translated.
pub(crate) struct Resolver<'a> {
    pub translator: &'a Translator,
    pub target: &'a Destination,
    pub selector: &'a ResourceSelector,

    /// The target port that the route being built is scoped to, if the
    /// target exposes more than one port.
    pub port: Option<NonZeroU16>,
}

/// The destinations of a route and the subsets they require.
pub(crate) type RouteDestinations = (
    Vec<istio::HttpRouteDestination>,
    Vec<DestinationRuleSubsetUpdate>,
);

impl Resolver<'_> {
    /// Routes to the traffic shift's destinations or, when no traffic shift
    /// is set, to the target itself.
    pub(crate) fn route(
        &self,
        shift: Option<&TrafficShift>,
    ) -> Result<RouteDestinations, TranslatorError> {
        let Some(TrafficShift { destinations }) = shift else {
            let destination = istio::Destination {
                host: self.target.local_hostname(),
                subset: None,
                port: self.port_for(self.target, None)?,
            };
            return Ok((
                vec![istio::HttpRouteDestination {
                    destination,
                    weight: None,
                }],
                vec![],
            ));
        };

        let mut route = Vec::with_capacity(destinations.len());
        let mut subsets = Vec::new();
        for wd in destinations {
            let dst = self.selector.resolve_single_destination(
                &wd.destination.name,
                &wd.destination.namespace,
                wd.destination.cluster.as_deref(),
            )?;

            let subset = if wd.subset.is_empty() {
                None
            } else {
                if dst.cluster() != self.target.cluster() {
                    return Err(TranslatorError::MultiClusterSubsetsNotSupported(
                        dst.service.clone(),
                    ));
                }
                let name = subset_name(&wd.subset);
                subsets.push(DestinationRuleSubsetUpdate {
                    host: self.translator.hostname(&dst),
                    service: dst.service.clone(),
                    name: name.clone(),
                    labels: wd.subset.clone(),
                });
                Some(name)
            };

            route.push(istio::HttpRouteDestination {
                destination: istio::Destination {
                    host: self.host_for(&dst)?,
                    subset,
                    port: self.port_for(&dst, wd.port)?,
                },
                weight: Some(wd.weight),
            });
        }
        Ok((route, subsets))
    }

    /// Sets every action other than the route destinations.
    pub(crate) fn apply(
        &self,
        route: &mut istio::HttpRoute,
        ActionSpec {
            traffic_shift: _,
            fault_injection,
            request_timeout,
            retries,
            cors_policy,
            mirror,
            header_manipulation,
        }: &ActionSpec,
    ) -> Result<(), TranslatorError> {
        route.timeout = request_timeout.map(duration);
        route.retries = retries.as_ref().map(
            |RetryPolicy {
                 attempts,
                 per_try_timeout,
             }| istio::HttpRetry {
                attempts: *attempts,
                per_try_timeout: per_try_timeout.map(duration),
            },
        );
        route.fault = fault_injection.as_ref().map(fault);
        route.cors_policy = cors_policy.as_ref().map(cors);
        route.headers = header_manipulation.as_ref().map(headers);

        if let Some(Mirror {
            destination,
            percentage,
            port,
        }) = mirror
        {
            let dst = self.selector.resolve_single_destination(
                &destination.name,
                &destination.namespace,
                destination.cluster.as_deref(),
            )?;
            route.mirror = Some(istio::Destination {
                host: self.host_for(&dst)?,
                subset: None,
                port: self.port_for(&dst, *port)?,
            });
            route.mirror_percentage = Some(istio::Percent { value: *percentage });
        }

        Ok(())
    }

    /// Destinations in the target's cluster are addressed by their in-cluster
    /// name; all others through their federated name.
    fn host_for(&self, dst: &Destination) -> Result<String, TranslatorError> {
        if dst.cluster() == self.target.cluster() {
            return Ok(dst.local_hostname());
        }
        dst.federation_dns_name
            .clone()
            .ok_or_else(|| TranslatorError::NotFederated(dst.service.clone()))
    }

    fn port_for(
        &self,
        dst: &Destination,
        explicit: Option<u32>,
    ) -> Result<Option<istio::PortSelector>, TranslatorError> {
        if let Some(number) = explicit {
            return Ok(Some(istio::PortSelector { number }));
        }
        if dst.ports.len() <= 1 {
            return Ok(None);
        }
        match self.port {
            Some(port) if dst.service == self.target.service => Ok(Some(istio::PortSelector {
                number: port.get().into(),
            })),
            _ => Err(TranslatorError::NoSpecifiedPort(dst.service.clone())),
        }
    }
}

/// Names a subset by its labels, e.g. `track-canary-version-v2`.
pub(crate) fn subset_name(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}-{v}"))
        .collect::<Vec<_>>()
        .join("-")
}

/// Formats a duration as a protobuf JSON duration, e.g. `1.5s`.
pub(crate) fn duration(d: time::Duration) -> String {
    let secs = d.as_secs();
    let nanos = d.subsec_nanos();
    if nanos == 0 {
        return format!("{secs}s");
    }
    let frac = format!("{nanos:09}");
    format!("{secs}.{}s", frac.trim_end_matches('0'))
}

fn fault(FaultInjection { fault, percentage }: &FaultInjection) -> istio::HttpFaultInjection {
    let percentage = istio::Percent { value: *percentage };
    match fault {
        Fault::Abort { http_status } => istio::HttpFaultInjection {
            abort: Some(istio::FaultAbort {
                http_status: *http_status,
                percentage,
            }),
            delay: None,
        },
        Fault::Delay { fixed_delay } => istio::HttpFaultInjection {
            delay: Some(istio::FaultDelay {
                fixed_delay: duration(*fixed_delay),
                percentage,
            }),
            abort: None,
        },
    }
}

fn cors(
    CorsPolicy {
        allow_origins,
        allow_methods,
        allow_headers,
        expose_headers,
        max_age,
        allow_credentials,
    }: &CorsPolicy,
) -> istio::CorsPolicy {
    istio::CorsPolicy {
        allow_origins: allow_origins.iter().map(string_match).collect(),
        allow_methods: allow_methods.clone(),
        allow_headers: allow_headers.clone(),
        expose_headers: expose_headers.clone(),
        max_age: max_age.map(duration),
        allow_credentials: *allow_credentials,
    }
}

fn headers(
    HeaderManipulation {
        append_request_headers,
        remove_request_headers,
        append_response_headers,
        remove_response_headers,
    }: &HeaderManipulation,
) -> istio::Headers {
    fn ops(
        add: &BTreeMap<String, String>,
        remove: &[String],
    ) -> Option<istio::HeaderOperations> {
        if add.is_empty() && remove.is_empty() {
            return None;
        }
        Some(istio::HeaderOperations {
            add: add.clone(),
            remove: remove.to_vec(),
        })
    }

    istio::Headers {
        request: ops(append_request_headers, remove_request_headers),
        response: ops(append_response_headers, remove_response_headers),
    }
}
