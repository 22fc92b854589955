//! Cross-tool rule equivalence classes
//!
//! Different tools flag the same vulnerability under different rule ids
//! (Bandit B602 and Semgrep's subprocess-shell-true both describe shelling
//! out with user input). The mapping is deployment configuration, loaded
//! from TOML; the default is empty, in which case only exact rule-id
//! matches merge.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::{OrchestratorError, OrchestratorResult};

#[derive(Debug, Deserialize)]
struct EquivalenceFile {
    /// class name -> member rule ids
    #[serde(default)]
    classes: HashMap<String, Vec<String>>,
}

/// Rule-id equivalence lookup
#[derive(Debug, Clone, Default)]
pub struct RuleEquivalence {
    /// rule id -> class name
    class_by_rule: HashMap<String, String>,
}

impl RuleEquivalence {
    /// Parse the TOML mapping:
    ///
    /// ```toml
    /// [classes]
    /// subprocess-shell = ["B602", "security/detect-child-process"]
    /// ```
    pub fn from_toml_str(raw: &str) -> OrchestratorResult<Self> {
        let file: EquivalenceFile = toml::from_str(raw)
            .map_err(|e| OrchestratorError::config(format!("rule equivalence: {e}")))?;

        let mut class_by_rule = HashMap::new();
        for (class, rules) in file.classes {
            for rule in rules {
                if let Some(existing) = class_by_rule.insert(rule.clone(), class.clone()) {
                    if existing != class {
                        return Err(OrchestratorError::config(format!(
                            "rule {rule} appears in classes {existing} and {class}"
                        )));
                    }
                }
            }
        }
        Ok(Self { class_by_rule })
    }

    pub fn from_file(path: impl AsRef<Path>) -> OrchestratorResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// The equivalence class a rule belongs to, if any
    pub fn class_of(&self, rule_id: &str) -> Option<&str> {
        self.class_by_rule.get(rule_id).map(String::as_str)
    }

    /// Whether two rule ids describe the same vulnerability
    pub fn equivalent(&self, a: &str, b: &str) -> bool {
        if a == b {
            return true;
        }
        match (self.class_of(a), self.class_of(b)) {
            (Some(ca), Some(cb)) => ca == cb,
            _ => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.class_by_rule.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[classes]
subprocess-shell = ["B602", "security/detect-child-process"]
hardcoded-password = ["B105", "generic.secrets.security.detected-generic-secret"]
"#;

    #[test]
    fn test_exact_match_always_equivalent() {
        let eq = RuleEquivalence::default();
        assert!(eq.equivalent("B602", "B602"));
        assert!(!eq.equivalent("B602", "B603"));
    }

    #[test]
    fn test_class_membership() {
        let eq = RuleEquivalence::from_toml_str(SAMPLE).unwrap();
        assert!(eq.equivalent("B602", "security/detect-child-process"));
        assert!(!eq.equivalent("B602", "B105"));
        assert_eq!(eq.class_of("B105"), Some("hardcoded-password"));
        assert_eq!(eq.class_of("unknown"), None);
    }

    #[test]
    fn test_rule_in_two_classes_rejected() {
        let raw = r#"
[classes]
a = ["B602"]
b = ["B602"]
"#;
        assert!(RuleEquivalence::from_toml_str(raw).is_err());
    }

    #[test]
    fn test_empty_input() {
        let eq = RuleEquivalence::from_toml_str("").unwrap();
        assert!(eq.is_empty());
    }
}
