use mesh_policy_controller_k8s_api::istio::{HttpMatchRequest, HttpRoute, StringMatch};
use std::cmp::Reverse;

/// Orders routes from most to least specific.
///
/// Every translated route carries at most one match entry. Routes are ranked
/// by the kind of path match (exact, prefix, regex, none), then by the length
/// of the path, then by the number of other criteria. Ties are broken by the
/// route's JSON encoding so that the order never depends on input order.
pub(crate) fn sort_by_specificity(routes: &mut [HttpRoute]) {
    routes.sort_by_cached_key(|route| {
        let encoded = serde_json::to_string(route).unwrap_or_default();
        (Reverse(Specificity::of(route)), encoded)
    });
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Specificity {
    path_kind: u8,
    path_len: usize,
    criteria: usize,
}

impl Specificity {
    fn of(route: &HttpRoute) -> Self {
        route
            .matches
            .iter()
            .map(Self::of_match)
            .max()
            .unwrap_or(Self {
                path_kind: 0,
                path_len: 0,
                criteria: 0,
            })
    }

    fn of_match(m: &HttpMatchRequest) -> Self {
        let (path_kind, path_len) = match &m.uri {
            Some(StringMatch::Exact(p)) => (3, p.len()),
            Some(StringMatch::Prefix(p)) => (2, p.len()),
            Some(StringMatch::Regex(r)) => (1, r.len()),
            None => (0, 0),
        };
        let criteria = usize::from(m.method.is_some())
            + m.headers.len()
            + m.without_headers.len()
            + m.query_params.len()
            + m.source_labels.len()
            + usize::from(m.source_namespace.is_some())
            + usize::from(m.port.is_some());
        Self {
            path_kind,
            path_len,
            criteria,
        }
    }
}
