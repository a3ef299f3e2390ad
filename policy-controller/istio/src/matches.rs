use mesh_policy_controller_core::{
    traffic_policy::{HeaderMatcher, HttpMatcher, PathMatch, QueryParamMatcher, ValueMatch},
    WorkloadSelector,
};
use crate::TranslatorError;
use mesh_policy_controller_k8s_api::istio::{HttpMatchRequest, StringMatch};

/// Builds one match entry for every combination of source fragment and
/// request matcher.
///
/// Combinations are never folded into a single entry with several criteria
/// lists, so each entry corresponds to exactly one thing the user asked for.
/// A matcher that constrains the same header or query parameter twice can't
/// be expressed as one entry and fails the translation.
pub(crate) fn match_entries(
    source: &WorkloadSelector,
    matchers: &[HttpMatcher],
) -> Result<Vec<HttpMatchRequest>, TranslatorError> {
    let sources = source_fragments(source);
    if matchers.is_empty() {
        return Ok(sources);
    }

    let mut entries = Vec::with_capacity(sources.len() * matchers.len());
    for src in &sources {
        for matcher in matchers {
            let mut entry = request_fragment(matcher)?;
            entry.source_labels = src.source_labels.clone();
            entry.source_namespace = src.source_namespace.clone();
            entries.push(entry);
        }
    }
    Ok(entries)
}

fn source_fragments(
    WorkloadSelector { labels, namespaces }: &WorkloadSelector,
) -> Vec<HttpMatchRequest> {
    if namespaces.is_empty() {
        return vec![HttpMatchRequest {
            source_labels: labels.clone(),
            ..Default::default()
        }];
    }
    namespaces
        .iter()
        .map(|ns| HttpMatchRequest {
            source_labels: labels.clone(),
            source_namespace: Some(ns.clone()),
            ..Default::default()
        })
        .collect()
}

fn request_fragment(
    HttpMatcher {
        path,
        method,
        headers,
        query_params,
    }: &HttpMatcher,
) -> Result<HttpMatchRequest, TranslatorError> {
    let mut fragment = HttpMatchRequest {
        uri: path.as_ref().map(|p| match p {
            PathMatch::Exact(path) => StringMatch::Exact(path.clone()),
            PathMatch::Prefix(prefix) => StringMatch::Prefix(prefix.clone()),
            PathMatch::Regex(regex) => StringMatch::Regex(regex.clone()),
        }),
        method: method
            .as_ref()
            .map(|m| StringMatch::Exact(m.as_str().to_string())),
        ..Default::default()
    };

    for HeaderMatcher {
        name,
        value,
        invert,
    } in headers
    {
        let headers = if *invert {
            &mut fragment.without_headers
        } else {
            &mut fragment.headers
        };
        let name = name.to_lowercase();
        if headers.insert(name.clone(), string_match(value)).is_some() {
            return Err(TranslatorError::DuplicateHeaderMatch(name));
        }
    }

    for QueryParamMatcher { name, value } in query_params {
        if fragment
            .query_params
            .insert(name.clone(), string_match(value))
            .is_some()
        {
            return Err(TranslatorError::DuplicateQueryParamMatch(name.clone()));
        }
    }

    Ok(fragment)
}

pub(crate) fn string_match(value: &ValueMatch) -> StringMatch {
    match value {
        ValueMatch::Exact(v) => StringMatch::Exact(v.clone()),
        ValueMatch::Regex(r) => StringMatch::Regex(r.clone()),
    }
}
