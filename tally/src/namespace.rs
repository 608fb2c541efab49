//! Namespace and group-rule configuration.
//!
//! A namespace is an isolated metrics domain: its own filter program,
//! bucket granularity, retention (cardinality) and store. Namespaces are
//! loaded once at registration and are read-only at runtime. Group rules
//! route events to namespaces and live in a single ordered rule set.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::program::{CombineProgram, FilterProgram, MonitorProgram, Predicate};

/// Largest accepted cardinality. Bounds slab sizes and cache memory.
pub const MAX_CARDINALITY: u32 = 1_000_000;

/// Smallest accepted granularity.
const MIN_GRANULARITY: Duration = Duration::from_millis(1);

/// Which store adapter persists a namespace's windows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreType {
    /// In-process memory only.
    #[default]
    Memory,
    /// Memory-mapped slab in the pipeline's data directory.
    Durable,
    /// Write-through memory cache in front of the durable slab.
    Cached,
}

impl StoreType {
    /// Returns the configuration spelling of this store type.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Durable => "durable",
            Self::Cached => "cached",
        }
    }
}

fn default_true() -> bool {
    true
}

/// Configuration of a single namespace.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use tally::namespace::{NamespaceConfig, StoreType};
/// use tally::program::{CodeClass, CodeMatch, FilterProgram, Predicate};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let filter = FilterProgram::new(
///     Predicate::all([
///         Predicate::eq("domain", "G1"),
///         Predicate::contains("code", "STATUS"),
///     ]),
///     vec![CodeClass::new("tech_error", CodeMatch::Equals("STATUS1".into()), true)],
/// );
/// let config = NamespaceConfig::new("NS1", "G1", Duration::from_secs(60), 10, filter)?;
/// assert_eq!(config.store_type, StoreType::Memory);
/// assert_eq!(config.granularity_ns(), 60_000_000_000);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamespaceConfig {
    /// Unique namespace name.
    #[serde(alias = "namespace")]
    pub name: String,

    /// Group whose events this namespace receives.
    pub group: String,

    /// Bucket duration.
    #[serde(with = "duration_serde")]
    pub granularity: Duration,

    /// Maximum number of retained buckets.
    pub cardinality: u32,

    /// Checkpoint open windows to a snapshot file on tick and shutdown.
    #[serde(default)]
    pub snapshot: bool,

    /// Include the bucket containing the query time in monitor folds.
    #[serde(default = "default_true")]
    pub current: bool,

    /// Store adapter for this namespace.
    #[serde(default)]
    pub store_type: StoreType,

    /// Filter program.
    pub filter: FilterProgram,

    /// Combine program.
    #[serde(default)]
    pub combine: CombineProgram,

    /// Monitor program.
    #[serde(default)]
    pub monitor: MonitorProgram,
}

impl NamespaceConfig {
    /// Creates a validated namespace with default programs, memory store,
    /// no snapshots, and monitor folds that include the current bucket.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the configuration is invalid.
    pub fn new(
        name: impl Into<String>,
        group: impl Into<String>,
        granularity: Duration,
        cardinality: u32,
        filter: FilterProgram,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            name: name.into(),
            group: group.into(),
            granularity,
            cardinality,
            snapshot: false,
            current: true,
            store_type: StoreType::Memory,
            filter,
            combine: CombineProgram::default(),
            monitor: MonitorProgram::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Sets the store type.
    #[must_use]
    pub fn with_store_type(mut self, store_type: StoreType) -> Self {
        self.store_type = store_type;
        self
    }

    /// Enables or disables snapshots.
    #[must_use]
    pub fn with_snapshot(mut self, snapshot: bool) -> Self {
        self.snapshot = snapshot;
        self
    }

    /// Validates the namespace configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if validation fails:
    /// - empty name or group
    /// - granularity below one millisecond
    /// - cardinality outside `1..=MAX_CARDINALITY`
    /// - an inconsistent filter, combine or monitor program
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::MissingField {
                namespace: self.name.clone(),
                field: "name",
            });
        }

        if self.group.is_empty() {
            return Err(ConfigError::MissingField {
                namespace: self.name.clone(),
                field: "group",
            });
        }

        if self.granularity < MIN_GRANULARITY {
            return Err(ConfigError::InvalidGranularity {
                namespace: self.name.clone(),
            });
        }

        if self.cardinality == 0 || self.cardinality > MAX_CARDINALITY {
            return Err(ConfigError::InvalidCardinality {
                namespace: self.name.clone(),
                cardinality: self.cardinality,
                max: MAX_CARDINALITY,
            });
        }

        self.filter
            .validate()
            .map_err(|reason| self.program_error(reason))?;

        let fields = self.filter.metric_fields();
        if let Some(unknown) = self
            .combine
            .fields
            .keys()
            .find(|f| !fields.contains(*f))
        {
            return Err(self.program_error(format!(
                "combine program names unknown field '{unknown}'"
            )));
        }

        if let Some(window) = self.monitor.window
            && (window == 0 || window > self.cardinality)
        {
            return Err(self.program_error(format!(
                "monitor window {window} must be within 1..={}",
                self.cardinality
            )));
        }

        if let Some(unknown) = self.monitor.metrics.iter().find(|m| !fields.contains(*m)) {
            return Err(self.program_error(format!(
                "monitor program projects unknown field '{unknown}'"
            )));
        }

        Ok(())
    }

    fn program_error(&self, reason: String) -> ConfigError {
        ConfigError::InvalidProgram {
            namespace: self.name.clone(),
            reason,
        }
    }

    /// Returns the granularity in nanoseconds.
    #[allow(clippy::cast_possible_truncation)] // granularities beyond u64 nanos are impractical
    pub fn granularity_ns(&self) -> u64 {
        self.granularity.as_nanos() as u64
    }

    /// Returns the start of the bucket containing `timestamp_ns`.
    #[inline]
    pub fn bucket_start(&self, timestamp_ns: u64) -> u64 {
        crate::window::floor_to(timestamp_ns, self.granularity_ns())
    }

    /// Number of buckets a monitor fold covers.
    pub fn monitor_window(&self) -> u32 {
        self.monitor.window.unwrap_or(self.cardinality)
    }

    /// The combine program with implied per-field operations filled in.
    pub fn effective_combine(&self) -> CombineProgram {
        self.combine.resolved_for(&self.filter)
    }

    /// Returns the metric fields of this namespace, in schema order.
    pub fn metric_fields(&self) -> Vec<String> {
        self.filter.metric_fields()
    }

    /// Computes a stable hash of everything that shapes the stored layout.
    ///
    /// Used by the durable store to detect configuration changes when a
    /// data directory is reopened. Programs that do not change the field
    /// set (predicates, monitor ranges) do not affect the hash.
    pub fn layout_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.name.hash(&mut hasher);
        self.granularity.hash(&mut hasher);
        self.cardinality.hash(&mut hasher);
        self.metric_fields().hash(&mut hasher);
        hasher.finish()
    }
}

/// One classification rule: events matching `predicate` belong to `group`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupRule {
    /// Group selected by this rule.
    pub group: String,
    /// Test over the event, usually `domain` equality.
    pub predicate: Predicate,
}

impl GroupRule {
    /// Creates a rule.
    pub fn new(group: impl Into<String>, predicate: Predicate) -> Self {
        Self {
            group: group.into(),
            predicate,
        }
    }

    /// Creates the common `domain == group` rule.
    pub fn domain(group: impl Into<String>) -> Self {
        let group = group.into();
        let predicate = Predicate::eq("domain", group.clone());
        Self { group, predicate }
    }
}

/// What the classifier does when no rule matches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Fallback {
    /// Raise a classification error.
    #[default]
    Error,
    /// Route to this group.
    Group(String),
}

/// The ordered rule set used by the classifier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRules {
    /// Rules in priority order; the first match wins.
    pub rules: Vec<GroupRule>,
    /// Behaviour when no rule matches.
    #[serde(default)]
    pub fallback: Fallback,
}

impl GroupRules {
    /// Creates a rule set that falls back to an error.
    pub fn new(rules: Vec<GroupRule>) -> Self {
        Self {
            rules,
            fallback: Fallback::Error,
        }
    }

    /// Builds one `domain == group` rule per group, in the given order.
    pub fn by_domain<I, G>(groups: I) -> Self
    where
        I: IntoIterator<Item = G>,
        G: Into<String>,
    {
        Self::new(groups.into_iter().map(GroupRule::domain).collect())
    }

    /// Validates the rule set.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidGroupRules`] for an empty group name,
    /// an invalid predicate, or an empty fallback group.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (index, rule) in self.rules.iter().enumerate() {
            if rule.group.is_empty() {
                return Err(ConfigError::InvalidGroupRules {
                    reason: format!("rule {index} has an empty group"),
                });
            }
            rule.predicate
                .validate()
                .map_err(|reason| ConfigError::InvalidGroupRules {
                    reason: format!("rule {index}: {reason}"),
                })?;
        }

        if let Fallback::Group(group) = &self.fallback
            && group.is_empty()
        {
            return Err(ConfigError::InvalidGroupRules {
                reason: "fallback group must not be empty".to_string(),
            });
        }

        Ok(())
    }
}

/// Serde support for Duration fields.
///
/// Durations are serialized as total seconds (f64) for human readability
/// in JSON configuration files.
pub(crate) mod duration_serde {
    use std::time::Duration;

    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let seconds = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(seconds)
            .map_err(|e| D::Error::custom(format!("invalid duration {seconds}s: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::{CodeClass, CodeMatch, MergeOp};

    fn filter() -> FilterProgram {
        FilterProgram::new(
            Predicate::eq("domain", "G1"),
            vec![CodeClass::new("tech_error", CodeMatch::Equals("ERR1".to_string()), true)],
        )
    }

    #[test]
    fn test_namespace_validation() {
        let minute = Duration::from_secs(60);
        assert!(NamespaceConfig::new("NS1", "G1", minute, 10, filter()).is_ok());

        assert!(matches!(
            NamespaceConfig::new("", "G1", minute, 10, filter()),
            Err(ConfigError::MissingField { field: "name", .. })
        ));
        assert!(matches!(
            NamespaceConfig::new("NS1", "", minute, 10, filter()),
            Err(ConfigError::MissingField { field: "group", .. })
        ));
        assert!(matches!(
            NamespaceConfig::new("NS1", "G1", Duration::ZERO, 10, filter()),
            Err(ConfigError::InvalidGranularity { .. })
        ));
        assert!(matches!(
            NamespaceConfig::new("NS1", "G1", minute, 0, filter()),
            Err(ConfigError::InvalidCardinality { .. })
        ));
    }

    #[test]
    fn test_program_cross_validation() {
        let mut config = NamespaceConfig::new("NS1", "G1", Duration::from_secs(60), 10, filter()).unwrap();

        config.combine.fields.insert("unknown".to_string(), MergeOp::Max);
        assert!(matches!(config.validate(), Err(ConfigError::InvalidProgram { .. })));
        config.combine.fields.clear();

        config.monitor.window = Some(11);
        assert!(config.validate().is_err());
        config.monitor.window = Some(3);
        assert!(config.validate().is_ok());

        config.monitor.metrics = vec!["func_error".to_string()];
        assert!(config.validate().is_err());
        config.monitor.metrics = vec!["tech_error".to_string()];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bucket_start() {
        let config = NamespaceConfig::new("NS1", "G1", Duration::from_secs(60), 10, filter()).unwrap();
        let second = 1_000_000_000u64;

        assert_eq!(config.bucket_start(0), 0);
        assert_eq!(config.bucket_start(59 * second), 0);
        assert_eq!(config.bucket_start(60 * second), 60 * second);
        assert_eq!(config.bucket_start(125 * second), 120 * second);
    }

    #[test]
    fn test_namespace_json() {
        let json = r#"{
            "namespace": "NS1",
            "group": "G1",
            "granularity": 60,
            "cardinality": 5,
            "snapshot": true,
            "store_type": "cached",
            "filter": {"predicate": {"eq": {"field": "domain", "value": "G1"}}}
        }"#;
        let config: NamespaceConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.name, "NS1");
        assert_eq!(config.granularity, Duration::from_secs(60));
        assert!(config.snapshot);
        assert!(config.current);
        assert_eq!(config.store_type, StoreType::Cached);
        assert!(config.validate().is_ok());

        let missing_group = r#"{"name": "NS1", "granularity": 60, "cardinality": 5, "filter": {"predicate": "always"}}"#;
        assert!(serde_json::from_str::<NamespaceConfig>(missing_group).is_err());

        let negative = r#"{"name": "NS1", "group": "G1", "granularity": -1, "cardinality": 5, "filter": {"predicate": "always"}}"#;
        assert!(serde_json::from_str::<NamespaceConfig>(negative).is_err());
    }

    #[test]
    fn test_layout_hash() {
        let a = NamespaceConfig::new("NS1", "G1", Duration::from_secs(60), 10, filter()).unwrap();

        let mut b = a.clone();
        b.filter.predicate = Predicate::Always;
        b.monitor.window = Some(2);
        assert_eq!(a.layout_hash(), b.layout_hash());

        let mut c = a.clone();
        c.cardinality = 20;
        assert_ne!(a.layout_hash(), c.layout_hash());

        let mut d = a.clone();
        d.filter.classes.clear();
        assert_ne!(a.layout_hash(), d.layout_hash());
    }

    #[test]
    fn test_group_rules() {
        let rules = GroupRules::by_domain(["G1", "G2"]);
        assert_eq!(rules.rules.len(), 2);
        assert_eq!(rules.rules[1].predicate, Predicate::eq("domain", "G2"));
        assert!(rules.validate().is_ok());

        let json = r#"{"rules": [{"group": "G1", "predicate": {"eq": {"field": "domain", "value": "G1"}}}], "fallback": {"group": "catch_all"}}"#;
        let parsed: GroupRules = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.fallback, Fallback::Group("catch_all".to_string()));

        let bad = GroupRules {
            rules: vec![GroupRule::new("", Predicate::Always)],
            fallback: Fallback::Error,
        };
        assert!(bad.validate().is_err());
    }
}
