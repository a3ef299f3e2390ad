use mesh_policy_controller_core::{ConflictError, ResourceId, TranslationState};
use mesh_policy_controller_k8s_api::networking::{
    ConflictErrorStatus, StateStatus, TrafficPolicyStatus, TranslatorErrorStatus,
};
use std::collections::{BTreeMap, BTreeSet};

/// Accumulates the outcome of a reconciliation for each policy.
///
/// A policy's state is derived in order of precedence: a policy that could
/// not be converted or validated is `INVALID`; otherwise it is `CONFLICT` if
/// any destination it applies to is in conflict; otherwise
/// `PROCESSING_ERROR` if an output for one of its destinations could not be
/// written; otherwise `ACCEPTED`.
#[derive(Debug, Default)]
pub struct Results {
    invalid: BTreeMap<ResourceId, String>,
    conflicts: BTreeMap<ResourceId, BTreeSet<String>>,
    processing_errors: BTreeMap<ResourceId, BTreeSet<String>>,
    translator_errors: BTreeMap<ResourceId, BTreeSet<(String, String)>>,
}

impl Results {
    pub fn invalid(&mut self, id: ResourceId, message: impl ToString) {
        self.invalid.insert(id, message.to_string());
    }

    /// Marks every policy that applies to the conflicted destination.
    pub fn conflict(&mut self, conflict: &ConflictError) {
        let message = conflict.to_string();
        for id in &conflict.policies {
            self.conflicts
                .entry(id.clone())
                .or_default()
                .insert(message.clone());
        }
    }

    pub fn processing_error<'a>(
        &mut self,
        ids: impl IntoIterator<Item = &'a ResourceId>,
        message: impl ToString,
    ) {
        let message = message.to_string();
        for id in ids {
            self.processing_errors
                .entry(id.clone())
                .or_default()
                .insert(message.clone());
        }
    }

    pub fn translator_error(
        &mut self,
        id: ResourceId,
        translator_id: impl ToString,
        message: impl ToString,
    ) {
        self.translator_errors
            .entry(id)
            .or_default()
            .insert((translator_id.to_string(), message.to_string()));
    }

    pub fn state(&self, id: &ResourceId) -> TranslationState {
        if self.invalid.contains_key(id) {
            TranslationState::Invalid
        } else if self.conflicts.contains_key(id) {
            TranslationState::Conflict
        } else if self.processing_errors.contains_key(id) {
            TranslationState::ProcessingError
        } else {
            TranslationState::Accepted
        }
    }

    /// Builds the complete status for a policy.
    ///
    /// Statuses carry no timestamps, so reconciling unchanged inputs yields
    /// an identical status.
    pub fn status(&self, id: &ResourceId, generation: Option<i64>) -> TrafficPolicyStatus {
        let state = self.state(id);
        if let Some(message) = self.invalid.get(id) {
            let status = Some(state_status(state, Some(message.clone())));
            return TrafficPolicyStatus {
                observed_generation: generation,
                validation_status: status.clone(),
                translation_status: status,
                conflict_errors: vec![],
                translator_errors: vec![],
            };
        }

        let conflict_errors = self
            .conflicts
            .get(id)
            .into_iter()
            .flatten()
            .map(|message| ConflictErrorStatus {
                message: message.clone(),
            })
            .collect::<Vec<_>>();

        let message = match state {
            TranslationState::Conflict => Some(join(self.conflicts.get(id))),
            TranslationState::ProcessingError => Some(join(self.processing_errors.get(id))),
            _ => None,
        };

        let translator_errors = self
            .translator_errors
            .get(id)
            .into_iter()
            .flatten()
            .map(|(translator_id, error_message)| TranslatorErrorStatus {
                translator_id: translator_id.clone(),
                error_message: error_message.clone(),
            })
            .collect();

        TrafficPolicyStatus {
            observed_generation: generation,
            validation_status: Some(state_status(TranslationState::Accepted, None)),
            translation_status: Some(state_status(state, message)),
            conflict_errors,
            translator_errors,
        }
    }
}

fn state_status(state: TranslationState, message: Option<String>) -> StateStatus {
    StateStatus {
        state: state.to_string(),
        message,
    }
}

fn join(messages: Option<&BTreeSet<String>>) -> String {
    messages
        .into_iter()
        .flatten()
        .cloned()
        .collect::<Vec<_>>()
        .join("; ")
}
