//! Declarative per-namespace programs.
//!
//! Namespaces are configured with small structured programs rather than
//! an embedded expression language:
//!
//! - [`Predicate`]: the closed grammar used by group rules and filters
//!   (equality, substring, membership, boolean combinators).
//! - [`FilterProgram`]: predicate plus the code→class mapping and optional
//!   latency source that turn an accepted event into a metric sample.
//! - [`CombineProgram`]: the per-field merge used to fold samples into
//!   windows and windows into monitor records.
//! - [`MonitorProgram`]: range and projection of monitor records.
//!
//! All programs are plain serde data and load from JSON.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::event::Event;

/// A boolean test over an event.
///
/// Fields are named by string: `domain` and `code` resolve to the typed
/// event fields, anything else to an auxiliary field. A missing auxiliary
/// field never matches a leaf test.
///
/// # Examples
///
/// ```rust
/// use tally::event::Event;
/// use tally::program::Predicate;
///
/// let predicate = Predicate::all([
///     Predicate::eq("domain", "G1"),
///     Predicate::contains("code", "STATUS"),
/// ]);
///
/// assert!(predicate.matches(&Event::new("G1", "STATUS1", 0)));
/// assert!(!predicate.matches(&Event::new("G2", "STATUS1", 0)));
/// assert!(!predicate.matches(&Event::new("G1", "OK", 0)));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    /// Matches every event.
    Always,

    /// Field equals the value exactly.
    Eq {
        /// Field name.
        field: String,
        /// Expected value.
        value: String,
    },

    /// Field contains the value as a substring.
    Contains {
        /// Field name.
        field: String,
        /// Required substring.
        value: String,
    },

    /// Field equals one of the values.
    OneOf {
        /// Field name.
        field: String,
        /// Accepted values.
        values: Vec<String>,
    },

    /// Every inner predicate matches. Empty matches everything.
    All(Vec<Predicate>),

    /// At least one inner predicate matches. Empty matches nothing.
    Any(Vec<Predicate>),

    /// The inner predicate does not match.
    Not(Box<Predicate>),
}

impl Predicate {
    /// Builds an equality test.
    pub fn eq(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Eq {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Builds a substring test.
    pub fn contains(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Contains {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Builds a membership test.
    pub fn one_of<I, V>(field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        Self::OneOf {
            field: field.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// Builds a conjunction.
    pub fn all(predicates: impl IntoIterator<Item = Predicate>) -> Self {
        Self::All(predicates.into_iter().collect())
    }

    /// Builds a disjunction.
    pub fn any(predicates: impl IntoIterator<Item = Predicate>) -> Self {
        Self::Any(predicates.into_iter().collect())
    }

    /// Builds a negation.
    pub fn negate(predicate: Predicate) -> Self {
        Self::Not(Box::new(predicate))
    }

    /// Evaluates the predicate against an event.
    pub fn matches(&self, event: &Event) -> bool {
        match self {
            Self::Always => true,
            Self::Eq { field, value } => event.field_str(field).is_some_and(|v| v == value.as_str()),
            Self::Contains { field, value } => event
                .field_str(field)
                .is_some_and(|v| v.contains(value.as_str())),
            Self::OneOf { field, values } => event
                .field_str(field)
                .is_some_and(|v| values.iter().any(|candidate| v == candidate.as_str())),
            Self::All(inner) => inner.iter().all(|p| p.matches(event)),
            Self::Any(inner) => inner.iter().any(|p| p.matches(event)),
            Self::Not(inner) => !inner.matches(event),
        }
    }

    /// Checks that every leaf names a field.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid leaf.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::Always => Ok(()),
            Self::Eq { field, .. } | Self::Contains { field, .. } | Self::OneOf { field, .. }
                if field.is_empty() =>
            {
                Err("predicate field name must not be empty".to_string())
            }
            Self::Eq { .. } | Self::Contains { .. } | Self::OneOf { .. } => Ok(()),
            Self::All(inner) | Self::Any(inner) => inner.iter().try_for_each(Self::validate),
            Self::Not(inner) => inner.validate(),
        }
    }
}

/// How a code class recognizes a status code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodeMatch {
    /// The code equals this value.
    Equals(String),
    /// The code contains this substring.
    Contains(String),
    /// The code equals one of these values.
    OneOf(Vec<String>),
}

impl CodeMatch {
    /// Tests a status code.
    pub fn matches(&self, code: &str) -> bool {
        match self {
            Self::Equals(value) => code == value,
            Self::Contains(value) => code.contains(value.as_str()),
            Self::OneOf(values) => values.iter().any(|v| v == code),
        }
    }
}

/// One entry of a namespace's code→class mapping.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CodeClass {
    /// Metric field incremented when the class matches.
    pub metric: String,

    /// Codes belonging to this class.
    #[serde(rename = "match")]
    pub matcher: CodeMatch,

    /// Whether a match means the event was not a success.
    #[serde(default)]
    pub failure: bool,
}

impl CodeClass {
    /// Creates a code class.
    pub fn new(metric: impl Into<String>, matcher: CodeMatch, failure: bool) -> Self {
        Self {
            metric: metric.into(),
            matcher,
            failure,
        }
    }
}

/// Source of the optional continuous sample.
///
/// An accepted event whose latency field is present contributes
/// `<metric>_sum`, `<metric>_count` and `<metric>_max`. With histogram
/// `buckets` configured it also contributes one cumulative
/// `<metric>_le_<bound>` field per upper bound, set to 1 when the value
/// is at or below the bound. The `+Inf` bucket is the count field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencySource {
    /// Event field holding the raw value.
    #[serde(default = "default_latency_field")]
    pub field: String,

    /// Prefix of the derived metric fields.
    #[serde(default = "default_latency_metric")]
    pub metric: String,

    /// Factor applied to the raw value (e.g. `0.001` for ms → s).
    #[serde(default = "default_scale")]
    pub scale: f64,

    /// Reject events that lack the field instead of skipping the sample.
    #[serde(default)]
    pub required: bool,

    /// Histogram upper bounds, strictly increasing. Empty disables the
    /// histogram.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub buckets: Vec<f64>,
}

impl LatencySource {
    /// Name of the running-sum field.
    pub fn sum_field(&self) -> String {
        format!("{}_sum", self.metric)
    }

    /// Name of the sample-count field.
    pub fn count_field(&self) -> String {
        format!("{}_count", self.metric)
    }

    /// Name of the maximum field.
    pub fn max_field(&self) -> String {
        format!("{}_max", self.metric)
    }

    /// Name of the cumulative histogram field for `bound`.
    pub fn bucket_field(&self, bound: f64) -> String {
        format!("{}_le_{bound}", self.metric)
    }

    /// Configured histogram bounds paired with their field names.
    pub fn bucket_fields(&self) -> impl Iterator<Item = (f64, String)> + '_ {
        self.buckets.iter().map(|&bound| (bound, self.bucket_field(bound)))
    }

    /// Enables the histogram with the given upper bounds.
    #[must_use]
    pub fn with_buckets(mut self, buckets: impl IntoIterator<Item = f64>) -> Self {
        self.buckets = buckets.into_iter().collect();
        self
    }
}

impl Default for LatencySource {
    fn default() -> Self {
        Self {
            field: default_latency_field(),
            metric: default_latency_metric(),
            scale: default_scale(),
            required: false,
            buckets: Vec::new(),
        }
    }
}

fn default_latency_field() -> String {
    "duration".to_string()
}

fn default_latency_metric() -> String {
    "duration".to_string()
}

fn default_scale() -> f64 {
    1.0
}

fn default_total_metric() -> String {
    "total".to_string()
}

fn default_success_metric() -> String {
    "success".to_string()
}

/// A namespace's filter program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterProgram {
    /// Events failing this predicate raise a namespace-tagged filter error.
    pub predicate: Predicate,

    /// Code→class mapping. Order is the field order of the sample schema.
    #[serde(default)]
    pub classes: Vec<CodeClass>,

    /// Field counting every accepted event.
    #[serde(default = "default_total_metric")]
    pub total_metric: String,

    /// Field counting accepted events that hit no failure class.
    #[serde(default = "default_success_metric")]
    pub success_metric: String,

    /// Optional continuous sample.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency: Option<LatencySource>,
}

impl FilterProgram {
    /// Creates a program with the default `total`/`success` fields.
    pub fn new(predicate: Predicate, classes: Vec<CodeClass>) -> Self {
        Self {
            predicate,
            classes,
            total_metric: default_total_metric(),
            success_metric: default_success_metric(),
            latency: None,
        }
    }

    /// Adds a latency source.
    #[must_use]
    pub fn with_latency(mut self, latency: LatencySource) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Returns every metric field the program can emit, in schema order.
    pub fn metric_fields(&self) -> Vec<String> {
        let mut fields = vec![self.total_metric.clone(), self.success_metric.clone()];
        fields.extend(self.classes.iter().map(|c| c.metric.clone()));
        if let Some(latency) = &self.latency {
            fields.push(latency.sum_field());
            fields.push(latency.count_field());
            fields.push(latency.max_field());
            fields.extend(latency.bucket_fields().map(|(_, field)| field));
        }
        fields
    }

    /// Validates the program.
    ///
    /// # Errors
    ///
    /// Returns a description of the first problem: an invalid predicate,
    /// an empty or duplicated metric name, a non-finite latency scale, or
    /// histogram bounds that are not finite and strictly increasing.
    pub fn validate(&self) -> Result<(), String> {
        self.predicate.validate()?;

        let fields = self.metric_fields();
        let mut seen = HashSet::with_capacity(fields.len());
        for field in &fields {
            if field.is_empty() {
                return Err("metric field names must not be empty".to_string());
            }
            if !seen.insert(field.as_str()) {
                return Err(format!("metric field '{field}' is declared more than once"));
            }
        }

        if let Some(latency) = &self.latency {
            if latency.field.is_empty() || latency.metric.is_empty() {
                return Err("latency field and metric must not be empty".to_string());
            }
            if !latency.scale.is_finite() || latency.scale <= 0.0 {
                return Err(format!("latency scale {} must be finite and > 0", latency.scale));
            }
            if latency.buckets.iter().any(|b| !b.is_finite()) {
                return Err("histogram bounds must be finite".to_string());
            }
            if latency.buckets.windows(2).any(|pair| pair[0] >= pair[1]) {
                return Err("histogram bounds must be strictly increasing".to_string());
            }
        }

        Ok(())
    }
}

/// Per-field merge operation. Every variant is commutative and
/// associative, and an absent operand is the identity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeOp {
    /// Addition.
    #[default]
    Sum,
    /// Minimum.
    Min,
    /// Maximum.
    Max,
}

impl MergeOp {
    /// Merges two present values.
    ///
    /// ```rust
    /// use tally::program::MergeOp;
    ///
    /// assert_eq!(MergeOp::Sum.apply(2.0, 3.0), 5.0);
    /// assert_eq!(MergeOp::Min.apply(2.0, 3.0), 2.0);
    /// assert_eq!(MergeOp::Max.apply(2.0, 3.0), 3.0);
    /// ```
    #[inline]
    pub fn apply(self, left: f64, right: f64) -> f64 {
        match self {
            Self::Sum => left + right,
            Self::Min => left.min(right),
            Self::Max => left.max(right),
        }
    }
}

/// A namespace's combine program.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CombineProgram {
    /// Operation for fields without an override.
    #[serde(default)]
    pub default: MergeOp,

    /// Per-field overrides.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, MergeOp>,
}

impl CombineProgram {
    /// Returns the operation for a field.
    #[inline]
    pub fn op_for(&self, field: &str) -> MergeOp {
        self.fields.get(field).copied().unwrap_or(self.default)
    }

    /// Returns a copy with the latency maximum field merged with
    /// [`MergeOp::Max`], unless the program already overrides it.
    #[must_use]
    pub fn resolved_for(&self, filter: &FilterProgram) -> Self {
        let mut resolved = self.clone();
        if let Some(latency) = &filter.latency {
            resolved
                .fields
                .entry(latency.max_field())
                .or_insert(MergeOp::Max);
        }
        resolved
    }
}

/// A namespace's monitor program.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorProgram {
    /// Number of buckets folded, ending at the query bucket. Defaults to
    /// the namespace cardinality.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window: Option<u32>,

    /// Fields emitted in the record. Empty emits every field.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metrics: Vec<String>,
}
