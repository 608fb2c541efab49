//! Incoming events and their JSON wire form.
//!
//! Events are produced by an external collaborator (a message bus consumer
//! in production). The JSON form accepts both descriptive field names and
//! the abbreviated names used on the bus:
//!
//! | field        | alias    | type                                   |
//! |--------------|----------|----------------------------------------|
//! | `domain`     | `dmn`    | string                                 |
//! | `code`       | `sCd`    | string                                 |
//! | `start_time` | `strtTm` | RFC 3339 string or integer nanoseconds |
//! | `duration`   | `drtn`   | number (optional)                      |
//!
//! Every other key is kept as an auxiliary field and can be referenced by
//! predicates and latency sources.

use std::borrow::Cow;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// An immutable domain event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Business domain the event belongs to. Drives classification.
    #[serde(alias = "dmn")]
    pub domain: String,

    /// Status code reported by the emitter.
    #[serde(alias = "sCd")]
    pub code: String,

    /// Event start time in nanoseconds since the Unix epoch.
    #[serde(alias = "strtTm", with = "timestamp_serde")]
    pub start_time: u64,

    /// Optional duration reported by the emitter.
    #[serde(alias = "drtn", default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,

    /// Auxiliary fields carried through untouched.
    #[serde(flatten)]
    pub fields: BTreeMap<String, serde_json::Value>,
}

impl Event {
    /// Creates an event with no duration and no auxiliary fields.
    pub fn new(domain: impl Into<String>, code: impl Into<String>, start_time: u64) -> Self {
        Self {
            domain: domain.into(),
            code: code.into(),
            start_time,
            duration: None,
            fields: BTreeMap::new(),
        }
    }

    /// Sets the event duration.
    #[must_use]
    pub fn with_duration(mut self, duration: f64) -> Self {
        self.duration = Some(duration);
        self
    }

    /// Adds an auxiliary field.
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Parses one event from its JSON wire form.
    ///
    /// # Errors
    ///
    /// Returns the `serde_json` error if the text is not a valid event.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Looks up a field as text.
    ///
    /// `domain` and `code` resolve to the typed fields; any other name is
    /// looked up among the auxiliary fields. Numbers and booleans are
    /// rendered with their JSON text.
    pub fn field_str(&self, name: &str) -> Option<Cow<'_, str>> {
        match name {
            "domain" => Some(Cow::Borrowed(&self.domain)),
            "code" => Some(Cow::Borrowed(&self.code)),
            _ => match self.fields.get(name)? {
                serde_json::Value::String(s) => Some(Cow::Borrowed(s)),
                serde_json::Value::Number(n) => Some(Cow::Owned(n.to_string())),
                serde_json::Value::Bool(b) => Some(Cow::Owned(b.to_string())),
                _ => None,
            },
        }
    }

    /// Looks up a field as a number.
    ///
    /// `duration` resolves to the typed field; auxiliary fields may hold a
    /// JSON number or a numeric string.
    pub fn field_f64(&self, name: &str) -> Option<f64> {
        if name == "duration" {
            return self.duration;
        }
        match self.fields.get(name)? {
            serde_json::Value::Number(n) => n.as_f64(),
            serde_json::Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }
}

/// Serde support for event timestamps.
///
/// Serialized as integer nanoseconds; deserialized from either integer
/// nanoseconds or an RFC 3339 string.
mod timestamp_serde {
    use chrono::DateTime;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Nanos(u64),
        Text(String),
    }

    pub fn serialize<S>(timestamp: &u64, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(*timestamp)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<u64, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Raw::deserialize(deserializer)? {
            Raw::Nanos(n) => Ok(n),
            Raw::Text(text) => {
                let parsed = DateTime::parse_from_rfc3339(&text)
                    .map_err(|e| D::Error::custom(format!("time '{text}' is not RFC 3339: {e}")))?;
                parsed
                    .timestamp_nanos_opt()
                    .and_then(|n| u64::try_from(n).ok())
                    .ok_or_else(|| D::Error::custom(format!("time '{text}' is out of range")))
            }
        }
    }
}
