use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, str::FromStr, time::Duration};

/// A duration in Go's `time.Duration` string format (e.g. `1.5s`, `2m30s`),
/// as used by Kubernetes resources.
///
/// Go durations are signed and Rust durations are not, so the sign is kept
/// separately. Negative durations parse but are rejected when converted to
/// policy.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct K8sDuration {
    duration: Duration,
    is_negative: bool,
}

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
pub enum ParseError {
    #[error("empty duration")]
    Empty,

    #[error("unknown unit {0:?}: expected one of {UNITS}")]
    UnknownUnit(String),

    #[error("missing unit after {0:?}: expected one of {UNITS}")]
    MissingUnit(String),

    #[error("invalid number {0:?}")]
    InvalidNumber(String),
}

const UNITS: &str = "'ns', 'us', '\u{00b5}s', 'ms', 's', 'm', 'h'";

// === impl K8sDuration ===

impl K8sDuration {
    #[inline]
    #[must_use]
    pub fn is_negative(&self) -> bool {
        self.is_negative
    }

    /// Returns the magnitude of the duration, or `None` if it is negative.
    #[inline]
    pub fn positive(&self) -> Option<Duration> {
        (!self.is_negative).then_some(self.duration)
    }
}

impl From<Duration> for K8sDuration {
    fn from(duration: Duration) -> Self {
        Self {
            duration,
            is_negative: false,
        }
    }
}

impl fmt::Debug for K8sDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_negative {
            f.write_str("-")?;
        }
        fmt::Debug::fmt(&self.duration, f)
    }
}

impl fmt::Display for K8sDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

fn unit_base(unit: &str) -> Option<Duration> {
    Some(match unit {
        "ns" => Duration::from_nanos(1),
        // Both the micro sign and the Greek mu are accepted.
        "us" | "\u{00b5}s" | "\u{03bc}s" => Duration::from_micros(1),
        "ms" => Duration::from_millis(1),
        "s" => Duration::from_secs(1),
        "m" => Duration::from_secs(60),
        "h" => Duration::from_secs(60 * 60),
        _ => return None,
    })
}

impl FromStr for K8sDuration {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (is_negative, mut rest) = match s.as_bytes().first() {
            Some(b'-') => (true, &s[1..]),
            Some(b'+') => (false, &s[1..]),
            Some(_) => (false, s),
            None => return Err(ParseError::Empty),
        };
        if rest == "0" {
            return Ok(Self {
                duration: Duration::ZERO,
                is_negative,
            });
        }
        if rest.is_empty() {
            return Err(ParseError::Empty);
        }

        let mut duration = Duration::ZERO;
        while !rest.is_empty() {
            let unit_start = rest
                .find(|c: char| !(c.is_ascii_digit() || c == '.'))
                .ok_or_else(|| ParseError::MissingUnit(rest.to_string()))?;
            let (number, tail) = rest.split_at(unit_start);
            let unit_end = tail
                .find(|c: char| c.is_ascii_digit() || c == '.')
                .unwrap_or(tail.len());
            let (unit, tail) = tail.split_at(unit_end);

            let value = number
                .parse::<f64>()
                .map_err(|_| ParseError::InvalidNumber(number.to_string()))?;
            let base = unit_base(unit).ok_or_else(|| ParseError::UnknownUnit(unit.to_string()))?;
            duration += base.mul_f64(value);
            rest = tail;
        }

        Ok(Self {
            duration,
            is_negative,
        })
    }
}

impl Serialize for K8sDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for K8sDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct Visitor;

        impl de::Visitor<'_> for Visitor {
            type Value = K8sDuration;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a duration such as \"1.5s\" or \"2m30s\"")
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
                value.parse().map_err(de::Error::custom)
            }
        }

        deserializer.deserialize_str(Visitor)
    }
}

impl schemars::JsonSchema for K8sDuration {
    fn schema_name() -> String {
        "K8sDuration".to_owned()
    }

    fn is_referenceable() -> bool {
        false
    }

    fn json_schema(_: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
        // Not "duration": that format means ISO 8601.
        schemars::schema::SchemaObject {
            instance_type: Some(schemars::schema::InstanceType::String.into()),
            format: None,
            ..Default::default()
        }
        .into()
    }
}
