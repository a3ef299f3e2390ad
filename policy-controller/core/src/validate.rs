//! Field-level semantic validation of a single traffic policy.
//!
//! Every check runs independently so that a policy author sees all problems
//! at once. Validation never mutates the policy.

use crate::{
    traffic_policy::{ActionSpec, Fault, FaultInjection, Mirror, TrafficShift},
    ClusterRef, ResourceSelector, SelectorError, TrafficPolicy,
};
use std::{fmt, time};


/// The shortest duration accepted for timeouts and delays.
pub const MIN_DURATION: time::Duration = time::Duration::from_millis(1);

#[derive(Clone, Debug, thiserror::Error)]
pub enum ValidationError {
    #[error(transparent)]
    Selector(#[from] SelectorError),

    #[error("subset selector {key}={value} not found on destination {destination}")]
    SubsetSelectorNotFound {
        destination: ClusterRef,
        key: String,
        value: String,
    },

    #[error("traffic shift weights must sum to 100, got {sum}")]
    InvalidWeightSum { sum: u64 },

    #[error("{field} percentage must be between 0 and 100, got {value}")]
    InvalidPercentage { field: &'static str, value: f64 },

    #[error("invalid HTTP status code {0}")]
    InvalidHttpStatus(u32),

    #[error("{field} must be at least 1ms, got {duration:?}")]
    DurationTooShort {
        field: &'static str,
        duration: time::Duration,
    },

    #[error("retry attempts must not be negative, got {0}")]
    NegativeRetryAttempts(i32),
}

/// All of the problems found with a policy. Never empty.
#[derive(Clone, Debug)]
pub struct ValidationErrors(Vec<ValidationError>);

/// Validates a policy against the currently known destinations.
pub fn validate(policy: &TrafficPolicy, selector: &ResourceSelector) -> Result<(), ValidationErrors> {
    let mut errors = Vec::new();

    if let Some(destinations) = policy.destination_selector.as_ref() {
        if let Err(error) = selector.resolve_destinations(Some(destinations)) {
            errors.push(error.into());
        }
    }

    let ActionSpec {
        traffic_shift,
        fault_injection,
        request_timeout,
        retries,
        cors_policy,
        mirror,
        header_manipulation: _,
    } = &policy.actions;

    if let Some(shift) = traffic_shift {
        validate_traffic_shift(shift, selector, &mut errors);
    }

    if let Some(fault) = fault_injection {
        validate_fault_injection(fault, &mut errors);
    }

    validate_duration("requestTimeout", *request_timeout, &mut errors);

    if let Some(retries) = retries {
        if retries.attempts < 0 {
            errors.push(ValidationError::NegativeRetryAttempts(retries.attempts));
        }
        validate_duration("retries.perTryTimeout", retries.per_try_timeout, &mut errors);
    }

    if let Some(cors) = cors_policy {
        validate_duration("corsPolicy.maxAge", cors.max_age, &mut errors);
    }

    if let Some(mirror) = mirror {
        validate_mirror(mirror, selector, &mut errors);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ValidationErrors(errors))
    }
}

fn validate_traffic_shift(
    shift: &TrafficShift,
    selector: &ResourceSelector,
    errors: &mut Vec<ValidationError>,
) {
    for weighted in &shift.destinations {
        let target = &weighted.destination;
        let destination = match selector.resolve_single_destination(
            &target.name,
            &target.namespace,
            target.cluster.as_deref(),
        ) {
            Ok(destination) => destination,
            Err(error) => {
                errors.push(error.into());
                continue;
            }
        };

        for (key, value) in &weighted.subset {
            if !destination.declares_subset(key, value) {
                errors.push(ValidationError::SubsetSelectorNotFound {
                    destination: destination.service.clone(),
                    key: key.clone(),
                    value: value.clone(),
                });
            }
        }
    }

    if shift.destinations.len() > 1 {
        let sum = shift
            .destinations
            .iter()
            .map(|d| u64::from(d.weight))
            .sum::<u64>();
        if sum != 100 {
            errors.push(ValidationError::InvalidWeightSum { sum });
        }
    }
}

fn validate_fault_injection(fault: &FaultInjection, errors: &mut Vec<ValidationError>) {
    validate_percentage("faultInjection", fault.percentage, errors);
    match fault.fault {
        Fault::Abort { http_status } => {
            if !is_known_status(http_status) {
                errors.push(ValidationError::InvalidHttpStatus(http_status));
            }
        }
        Fault::Delay { fixed_delay } => {
            validate_duration("faultInjection.delay.fixedDelay", Some(fixed_delay), errors)
        }
    }
}

fn validate_mirror(mirror: &Mirror, selector: &ResourceSelector, errors: &mut Vec<ValidationError>) {
    let target = &mirror.destination;
    if let Err(error) = selector.resolve_single_destination(
        &target.name,
        &target.namespace,
        target.cluster.as_deref(),
    ) {
        errors.push(error.into());
    }
    validate_percentage("mirror", mirror.percentage, errors);
}

fn validate_percentage(field: &'static str, value: f64, errors: &mut Vec<ValidationError>) {
    if !(0.0..=100.0).contains(&value) {
        errors.push(ValidationError::InvalidPercentage { field, value });
    }
}

fn validate_duration(
    field: &'static str,
    duration: Option<time::Duration>,
    errors: &mut Vec<ValidationError>,
) {
    if let Some(duration) = duration {
        if duration < MIN_DURATION {
            errors.push(ValidationError::DurationTooShort { field, duration });
        }
    }
}

fn is_known_status(code: u32) -> bool {
    u16::try_from(code)
        .ok()
        .and_then(|code| http::StatusCode::from_u16(code).ok())
        .and_then(|status| status.canonical_reason())
        .is_some()
}

// === impl ValidationErrors ===

impl ValidationErrors {
    #[inline]
    pub fn errors(&self) -> &[ValidationError] {
        &self.0
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut errors = self.0.iter();
        if let Some(first) = errors.next() {
            first.fmt(f)?;
        }
        for error in errors {
            write!(f, "; {error}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationErrors {}

impl From<ValidationError> for ValidationErrors {
    fn from(error: ValidationError) -> Self {
        Self(vec![error])
    }
}
