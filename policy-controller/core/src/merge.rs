//! Merges the traffic policies that apply to each destination into a
//! conflict-free, matcher-partitioned group.

use crate::{
    selector::WorkloadSelector,
    traffic_policy::{ActionField, ActionSpec, HttpMatcher},
    ClusterRef, Destination, ResourceId, ResourceSelector, SelectorError, TrafficPolicy,
};
use std::{cmp::Ordering, collections::BTreeMap, fmt};


/// A set of actions applied to every request matched by any of its matchers.
#[derive(Clone, Debug, PartialEq)]
pub struct MergedPolicy {
    /// Every policy that contributed a matcher or an action, in merge order.
    pub sources: Vec<ResourceId>,
    pub source_selector: WorkloadSelector,
    pub http_matchers: Vec<HttpMatcher>,
    pub actions: ActionSpec,
}

/// Two policies set different values for the same action on the same
/// request match.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
#[error(
    "{incoming} sets a {field} that conflicts with {} for destination {destination}",
    Ids(.existing)
)]
pub struct ConflictError {
    pub destination: ClusterRef,
    pub field: ActionField,

    /// The policies that had already contributed to the conflicting match.
    pub existing: Vec<ResourceId>,
    pub incoming: ResourceId,

    /// Every policy that applies to the destination.
    pub policies: Vec<ResourceId>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct MergeOutput {
    /// Merge groups for each destination that merged without conflict.
    pub merged: BTreeMap<ClusterRef, Vec<MergedPolicy>>,

    /// At most one conflict per destination. Conflicted destinations are
    /// absent from `merged`.
    pub conflicts: Vec<ConflictError>,

    /// The policies that apply to each destination, in merge order.
    pub applicable: BTreeMap<ClusterRef, Vec<ResourceId>>,
}

/// A working (matcher, actions) pair. Requests from different source
/// populations never overlap, so the source selector is part of the key.
struct Pair<'p> {
    source_selector: &'p WorkloadSelector,
    matcher: HttpMatcher,
    actions: ActionSpec,
    sources: Vec<ResourceId>,
}

struct Ids<'a>(&'a [ResourceId]);

/// Determines which accepted policies apply to each of `destinations` and
/// merges them.
///
/// Policies are folded in creation order, so the earliest policy to set an
/// action field fixes its value. A later policy that sets the same field to
/// a different value on an equal match fails the whole destination.
pub fn merge_for_destinations(
    policies: &[TrafficPolicy],
    destinations: &[Destination],
    selector: &ResourceSelector,
) -> Result<MergeOutput, SelectorError> {
    let mut candidates = BTreeMap::<ClusterRef, Vec<&TrafficPolicy>>::new();
    for destination in destinations {
        candidates.entry(destination.service.clone()).or_default();
    }

    for policy in policies.iter().filter(|p| p.is_accepted()) {
        for destination in selector.resolve_destinations(policy.destination_selector.as_ref())? {
            if let Some(applicable) = candidates.get_mut(&destination.service) {
                applicable.push(policy);
            }
        }
    }

    let mut output = MergeOutput::default();
    for (destination, mut policies) in candidates {
        if policies.is_empty() {
            continue;
        }
        policies.sort_by(|a, b| creation_order(a, b));
        policies.dedup_by(|a, b| a.id == b.id);

        let ids = policies.iter().map(|p| p.id.clone()).collect::<Vec<_>>();
        match merge_destination(&destination, &policies) {
            Ok(merged) => {
                output.merged.insert(destination.clone(), merged);
            }
            Err(mut conflict) => {
                conflict.policies = ids.clone();
                output.conflicts.push(conflict);
            }
        }
        output.applicable.insert(destination, ids);
    }

    Ok(output)
}

fn merge_destination(
    destination: &ClusterRef,
    policies: &[&TrafficPolicy],
) -> Result<Vec<MergedPolicy>, ConflictError> {
    let mut pairs = Vec::<Pair<'_>>::new();

    for policy in policies {
        for matcher in policy.effective_matchers() {
            let existing = pairs
                .iter_mut()
                .find(|p| *p.source_selector == policy.source_selector && p.matcher == matcher);
            match existing {
                Some(pair) => {
                    merge_actions(&mut pair.actions, &policy.actions).map_err(|field| {
                        ConflictError {
                            destination: destination.clone(),
                            field,
                            existing: pair.sources.clone(),
                            incoming: policy.id.clone(),
                            policies: Vec::new(),
                        }
                    })?;
                    if !pair.sources.contains(&policy.id) {
                        pair.sources.push(policy.id.clone());
                    }
                }
                None => pairs.push(Pair {
                    source_selector: &policy.source_selector,
                    matcher,
                    actions: policy.actions.clone(),
                    sources: vec![policy.id.clone()],
                }),
            }
        }
    }

    Ok(consolidate(pairs))
}

/// Combines pairs with equal actions into a single merged policy per source
/// selector, preserving the order in which each group was first seen.
fn consolidate(pairs: Vec<Pair<'_>>) -> Vec<MergedPolicy> {
    let mut merged = Vec::<MergedPolicy>::new();
    for pair in pairs {
        let group = merged
            .iter_mut()
            .find(|m| m.source_selector == *pair.source_selector && m.actions == pair.actions);
        match group {
            Some(group) => {
                group.http_matchers.push(pair.matcher);
                for id in pair.sources {
                    if !group.sources.contains(&id) {
                        group.sources.push(id);
                    }
                }
            }
            None => merged.push(MergedPolicy {
                sources: pair.sources,
                source_selector: pair.source_selector.clone(),
                http_matchers: vec![pair.matcher],
                actions: pair.actions,
            }),
        }
    }
    merged
}

/// Adopts each of `incoming`'s fields that is unset in `existing`. Fails with
/// the first field that both set to different values.
fn merge_actions(existing: &mut ActionSpec, incoming: &ActionSpec) -> Result<(), ActionField> {
    fn merge_field<T: Clone + PartialEq>(
        field: ActionField,
        existing: &mut Option<T>,
        incoming: &Option<T>,
    ) -> Result<(), ActionField> {
        let Some(value) = incoming else {
            return Ok(());
        };
        match existing {
            None => {
                *existing = Some(value.clone());
                Ok(())
            }
            Some(current) if *current == *value => Ok(()),
            Some(_) => Err(field),
        }
    }

    merge_field(
        ActionField::TrafficShift,
        &mut existing.traffic_shift,
        &incoming.traffic_shift,
    )?;
    merge_field(
        ActionField::FaultInjection,
        &mut existing.fault_injection,
        &incoming.fault_injection,
    )?;
    merge_field(
        ActionField::RequestTimeout,
        &mut existing.request_timeout,
        &incoming.request_timeout,
    )?;
    merge_field(ActionField::Retries, &mut existing.retries, &incoming.retries)?;
    merge_field(
        ActionField::CorsPolicy,
        &mut existing.cors_policy,
        &incoming.cors_policy,
    )?;
    merge_field(ActionField::Mirror, &mut existing.mirror, &incoming.mirror)?;
    merge_field(
        ActionField::HeaderManipulation,
        &mut existing.header_manipulation,
        &incoming.header_manipulation,
    )?;
    Ok(())
}

/// Orders policies by creation timestamp, oldest first. Policies without a
/// timestamp sort last; ties are broken by namespace and name.
pub fn creation_order(a: &TrafficPolicy, b: &TrafficPolicy) -> Ordering {
    match (a.creation_timestamp, b.creation_timestamp) {
        (Some(a_ts), Some(b_ts)) => a_ts.cmp(&b_ts),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
    .then_with(|| a.id.cmp(&b.id))
}

impl fmt::Display for Ids<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, id) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            id.fmt(f)?;
        }
        Ok(())
    }
}
