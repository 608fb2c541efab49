//! Explicit loading of namespace and group configuration.
//!
//! # Directory Layout
//!
//! ```text
//! config_dir/
//! ├── tally.json          <- PipelineConfig (optional)
//! ├── groups.json         <- GroupRules (optional)
//! └── namespaces/
//!     ├── ns1.json        <- NamespaceConfig
//!     └── ...
//! ```
//!
//! Namespace files register in file-name order. A file that fails to read,
//! parse or validate is rejected on its own and logged; every other
//! namespace still loads. Without `groups.json` each namespace's group is
//! matched by `domain` equality, in registration order.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{error, info};

use crate::classify::Classifier;
use crate::error::ConfigError;
use crate::namespace::{GroupRules, NamespaceConfig};

/// File name of the group rules inside a config directory.
pub const GROUPS_FILE: &str = "groups.json";

/// Directory of namespace files inside a config directory.
pub const NAMESPACES_DIR: &str = "namespaces";

/// A namespace that failed to load or register.
#[derive(Debug)]
pub struct Rejected {
    /// The file or namespace name the error came from.
    pub origin: String,
    /// Why it was rejected.
    pub error: ConfigError,
}

/// All namespaces and the group rules routing events to them.
#[derive(Debug)]
pub struct Registry {
    rules: GroupRules,
    namespaces: Vec<Arc<NamespaceConfig>>,
    rejected: Vec<Rejected>,
}

impl Registry {
    /// Loads every configuration file under `config_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] only when the group rules are unreadable or
    /// invalid, or the namespace directory cannot be listed. Individual
    /// namespace failures are collected in [`Registry::rejected`].
    pub fn load<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();
        let rules = read_json::<GroupRules>(&config_dir.join(GROUPS_FILE))?;

        let ns_dir = config_dir.join(NAMESPACES_DIR);
        let read_dir = fs::read_dir(&ns_dir).map_err(|source| ConfigError::Read {
            path: ns_dir.display().to_string(),
            source,
        })?;

        let mut files: Vec<PathBuf> = read_dir
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .collect();
        files.sort();

        let mut parsed = Vec::with_capacity(files.len());
        let mut rejected = Vec::new();
        for file in files {
            match read_json::<NamespaceConfig>(&file) {
                Ok(Some(config)) => parsed.push((file.display().to_string(), config)),
                Ok(None) => {}
                Err(error) => rejected.push(Rejected {
                    origin: file.display().to_string(),
                    error,
                }),
            }
        }

        Self::build(rules, parsed, rejected)
    }

    /// Builds a registry from in-memory configuration.
    ///
    /// `rules` of `None` derives `domain == group` rules from the
    /// namespaces.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidGroupRules`] if the rules are invalid.
    pub fn from_parts(rules: Option<GroupRules>, namespaces: Vec<NamespaceConfig>) -> Result<Self, ConfigError> {
        let parsed = namespaces.into_iter().map(|ns| (ns.name.clone(), ns)).collect();
        Self::build(rules, parsed, Vec::new())
    }

    fn build(
        rules: Option<GroupRules>,
        parsed: Vec<(String, NamespaceConfig)>,
        mut rejected: Vec<Rejected>,
    ) -> Result<Self, ConfigError> {
        let mut namespaces: Vec<Arc<NamespaceConfig>> = Vec::with_capacity(parsed.len());
        for (origin, config) in parsed {
            let outcome = config.validate().and_then(|()| {
                if namespaces.iter().any(|ns| ns.name == config.name) {
                    Err(ConfigError::DuplicateNamespace {
                        namespace: config.name.clone(),
                    })
                } else {
                    Ok(())
                }
            });
            match outcome {
                Ok(()) => namespaces.push(Arc::new(config)),
                Err(error) => rejected.push(Rejected { origin, error }),
            }
        }

        for rejection in &rejected {
            error!(origin = %rejection.origin, error = %rejection.error, "rejected namespace configuration");
        }

        let rules = match rules {
            Some(rules) => rules,
            None => {
                let mut groups: Vec<&str> = Vec::new();
                for ns in &namespaces {
                    if !groups.contains(&ns.group.as_str()) {
                        groups.push(&ns.group);
                    }
                }
                GroupRules::by_domain(groups)
            }
        };
        rules.validate()?;

        info!(
            namespaces = namespaces.len(),
            rejected = rejected.len(),
            rules = rules.rules.len(),
            "loaded namespace registry"
        );

        Ok(Self {
            rules,
            namespaces,
            rejected,
        })
    }

    /// Registered namespaces in registration order.
    pub fn namespaces(&self) -> &[Arc<NamespaceConfig>] {
        &self.namespaces
    }

    /// Looks up a namespace by name.
    pub fn namespace(&self, name: &str) -> Option<&Arc<NamespaceConfig>> {
        self.namespaces.iter().find(|ns| ns.name == name)
    }

    /// Namespaces that failed to load.
    pub fn rejected(&self) -> &[Rejected] {
        &self.rejected
    }

    /// The group rules.
    pub fn rules(&self) -> &GroupRules {
        &self.rules
    }

    /// Builds a classifier over the registered namespaces.
    pub fn classifier(&self) -> Classifier {
        Classifier::new(
            self.rules.clone(),
            self.namespaces.iter().map(|ns| (ns.name.as_str(), ns.group.as_str())),
        )
    }

    /// Removes namespaces that failed to register, recording why.
    pub(crate) fn reject_registered(&mut self, failures: Vec<Rejected>) {
        self.namespaces
            .retain(|ns| !failures.iter().any(|f| f.origin == ns.name));
        self.rejected.extend(failures);
    }
}

/// Reads a JSON file, returning `None` if it does not exist.
fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use crate::program::{FilterProgram, Predicate};
    use std::time::Duration;

    fn namespace(name: &str, group: &str) -> NamespaceConfig {
        let filter = FilterProgram::new(Predicate::eq("domain", group), Vec::new());
        NamespaceConfig::new(name, group, Duration::from_secs(60), 10, filter).unwrap()
    }

    #[test]
    fn test_from_parts_derives_domain_rules() {
        let registry = Registry::from_parts(
            None,
            vec![namespace("NS1", "G1"), namespace("NS2", "G2"), namespace("NS2b", "G2")],
        )
        .unwrap();

        assert_eq!(registry.rules().rules.len(), 2);
        let classifier = registry.classifier();
        let hit = classifier.classify(&Event::new("G2", "OK", 0)).unwrap();
        assert_eq!(hit.namespaces.len(), 2);
    }

    #[test]
    fn test_duplicate_and_invalid_rejected() {
        let mut bad = namespace("BAD", "G1");
        bad.cardinality = 0;
        let registry = Registry::from_parts(
            None,
            vec![namespace("NS1", "G1"), namespace("NS1", "G1"), bad],
        )
        .unwrap();

        assert_eq!(registry.namespaces().len(), 1);
        assert_eq!(registry.rejected().len(), 2);
        assert!(matches!(registry.rejected()[0].error, ConfigError::DuplicateNamespace { .. }));
        assert!(matches!(registry.rejected()[1].error, ConfigError::InvalidCardinality { .. }));
    }

    #[test]
    fn test_invalid_rules_are_fatal() {
        let rules = GroupRules::by_domain([""]);
        assert!(Registry::from_parts(Some(rules), vec![namespace("NS1", "G1")]).is_err());
    }

    #[test]
    fn test_reject_registered() {
        let mut registry =
            Registry::from_parts(None, vec![namespace("NS1", "G1"), namespace("NS2", "G2")]).unwrap();
        registry.reject_registered(vec![Rejected {
            origin: "NS2".to_string(),
            error: ConfigError::UnsupportedStore {
                namespace: "NS2".to_string(),
                store_type: "durable".to_string(),
                reason: "no data directory".to_string(),
            },
        }]);

        assert!(registry.namespace("NS2").is_none());
        assert_eq!(registry.rejected().len(), 1);
        assert!(registry.classifier().namespaces_for("G2").is_empty());
    }
}
