//! Event classifier: ordered group rules to candidate namespaces.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::ClassificationError;
use crate::event::Event;
use crate::namespace::{Fallback, GroupRules};

/// Result of a successful classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification<'a> {
    /// The selected group.
    pub group: &'a str,
    /// Namespaces registered for the group, in registration order.
    pub namespaces: &'a [Arc<str>],
}

impl Classification<'_> {
    /// The first candidate namespace.
    pub fn primary(&self) -> &str {
        // A classification is only built for groups with at least one namespace.
        self.namespaces.first().map_or("", |ns| ns.as_ref())
    }
}

/// Routes events to namespaces.
///
/// Rules are evaluated in order and the first match wins. A group may map
/// to several namespaces. Classification reads only immutable state and is
/// safe to call from any number of tasks.
#[derive(Debug, Clone)]
pub struct Classifier {
    rules: GroupRules,
    routes: HashMap<String, Vec<Arc<str>>>,
}

impl Classifier {
    /// Builds a classifier from a rule set and `(namespace, group)` pairs
    /// in registration order.
    pub fn new<'a, I>(rules: GroupRules, namespaces: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut routes: HashMap<String, Vec<Arc<str>>> = HashMap::new();
        for (namespace, group) in namespaces {
            routes.entry(group.to_string()).or_default().push(Arc::from(namespace));
        }
        Self { rules, routes }
    }

    /// Assigns an event to its group and candidate namespaces.
    ///
    /// # Errors
    ///
    /// Returns [`ClassificationError::NoMatchingGroup`] when no rule matches
    /// and the rule set has no fallback group, and
    /// [`ClassificationError::UnroutedGroup`] when the selected group has
    /// no registered namespace.
    pub fn classify(&self, event: &Event) -> Result<Classification<'_>, ClassificationError> {
        let group = self
            .rules
            .rules
            .iter()
            .find(|rule| rule.predicate.matches(event))
            .map(|rule| rule.group.as_str())
            .or(match &self.rules.fallback {
                Fallback::Group(group) => Some(group.as_str()),
                Fallback::Error => None,
            })
            .ok_or_else(|| ClassificationError::NoMatchingGroup {
                domain: event.domain.clone(),
            })?;

        match self.routes.get(group) {
            Some(namespaces) if !namespaces.is_empty() => Ok(Classification { group, namespaces }),
            _ => Err(ClassificationError::UnroutedGroup {
                group: group.to_string(),
                domain: event.domain.clone(),
            }),
        }
    }

    /// Returns the namespaces registered for a group.
    pub fn namespaces_for(&self, group: &str) -> &[Arc<str>] {
        self.routes.get(group).map(Vec::as_slice).unwrap_or_default()
    }

    /// Returns the rule set.
    pub fn rules(&self) -> &GroupRules {
        &self.rules
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespace::GroupRule;
    use crate::program::Predicate;

    fn classifier() -> Classifier {
        Classifier::new(
            GroupRules::by_domain(["G1", "G2", "G3"]),
            [("NS1", "G1"), ("NS2", "G2"), ("NS2b", "G2")],
        )
    }

    #[test]
    fn test_first_match_wins() {
        let rules = GroupRules::new(vec![
            GroupRule::new("wide", Predicate::contains("domain", "G")),
            GroupRule::domain("G1"),
        ]);
        let classifier = Classifier::new(rules, [("W", "wide"), ("NS1", "G1")]);

        let hit = classifier.classify(&Event::new("G1", "OK", 0)).unwrap();
        assert_eq!(hit.group, "wide");
        assert_eq!(hit.primary(), "W");
    }

    #[test]
    fn test_many_to_one_routing() {
        let classifier = classifier();
        let hit = classifier.classify(&Event::new("G2", "OK", 0)).unwrap();
        assert_eq!(hit.group, "G2");
        let names: Vec<&str> = hit.namespaces.iter().map(|n| &**n).collect();
        assert_eq!(names, vec!["NS2", "NS2b"]);
    }

    #[test]
    fn test_unknown_domain() {
        let err = classifier().classify(&Event::new("UNKNOWN", "OK", 0)).unwrap_err();
        assert_eq!(err, ClassificationError::NoMatchingGroup { domain: "UNKNOWN".to_string() });
    }

    #[test]
    fn test_group_without_namespace() {
        let err = classifier().classify(&Event::new("G3", "OK", 0)).unwrap_err();
        assert!(matches!(err, ClassificationError::UnroutedGroup { ref group, .. } if group == "G3"));
        assert!(classifier().namespaces_for("G3").is_empty());
    }

    #[test]
    fn test_fallback_group() {
        let mut rules = GroupRules::by_domain(["G1"]);
        rules.fallback = Fallback::Group("G1".to_string());
        let classifier = Classifier::new(rules, [("NS1", "G1")]);

        let hit = classifier.classify(&Event::new("elsewhere", "OK", 0)).unwrap();
        assert_eq!(hit.primary(), "NS1");
    }
}
