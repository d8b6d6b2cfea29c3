//! Output validation predicates for work units.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Decides whether a unit's raw output is acceptable
pub trait OutputValidator: Send + Sync + fmt::Debug {
    /// `Err` carries the reason the output was rejected
    fn check(&self, output: &str) -> Result<(), String>;

    fn validate(&self, output: &str) -> bool {
        self.check(output).is_ok()
    }
}

/// Declarative validation rules
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "rule", content = "value")]
pub enum ValidationRule {
    /// Output must contain a non-whitespace character
    NonEmpty,
    /// Output must be at least this many characters
    MinLength(usize),
    /// Every substring must appear
    RequiredSubstrings(Vec<String>),
    /// No substring may appear
    ForbiddenSubstrings(Vec<String>),
    /// Every nested rule must pass
    All(Vec<ValidationRule>),
}

impl OutputValidator for ValidationRule {
    fn check(&self, output: &str) -> Result<(), String> {
        match self {
            ValidationRule::NonEmpty => {
                if output.trim().is_empty() {
                    Err("output is empty".to_string())
                } else {
                    Ok(())
                }
            }
            ValidationRule::MinLength(min) => {
                let len = output.chars().count();
                if len < *min {
                    Err(format!("output has {} characters, expected at least {}", len, min))
                } else {
                    Ok(())
                }
            }
            ValidationRule::RequiredSubstrings(required) => {
                let missing: Vec<&str> = required
                    .iter()
                    .filter(|s| !output.contains(s.as_str()))
                    .map(String::as_str)
                    .collect();
                if missing.is_empty() {
                    Ok(())
                } else {
                    Err(format!("output is missing {:?}", missing))
                }
            }
            ValidationRule::ForbiddenSubstrings(forbidden) => {
                match forbidden.iter().find(|s| output.contains(s.as_str())) {
                    Some(found) => Err(format!("output contains forbidden {:?}", found)),
                    None => Ok(()),
                }
            }
            ValidationRule::All(rules) => rules.iter().try_for_each(|rule| rule.check(output)),
        }
    }
}

/// Wraps a closure as a validator
#[derive(Clone)]
pub struct PredicateValidator {
    name: String,
    predicate: Arc<dyn Fn(&str) -> bool + Send + Sync>,
}

impl PredicateValidator {
    pub fn new<F>(name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            predicate: Arc::new(predicate),
        }
    }
}

impl fmt::Debug for PredicateValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PredicateValidator").field("name", &self.name).finish()
    }
}

impl OutputValidator for PredicateValidator {
    fn check(&self, output: &str) -> Result<(), String> {
        if (self.predicate)(output) {
            Ok(())
        } else {
            Err(format!("output rejected by '{}'", self.name))
        }
    }
}
