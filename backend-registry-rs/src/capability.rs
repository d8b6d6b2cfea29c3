//! Capability declarations and the TOML file format they can be loaded from.
//!
//! ```toml
//! [[capability]]
//! backend = "llm-primary"
//! operation = "summarize"
//! required_keys = ["text"]
//! performance_score = 0.9
//! reliability_score = 0.95
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use error_handling_rs::{Error, Result};

/// One operation kind a backend can serve
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendCapability {
    pub backend_id: String,
    pub operation_kind: String,
    /// Keys that must be present in the operation's parameters or context
    pub required_keys: Vec<String>,
    /// Static suitability in `[0, 1]`, refreshed from live latency
    pub performance_score: f64,
    /// Static reliability in `[0, 1]`, refreshed from live error rate
    pub reliability_score: f64,
}

impl BackendCapability {
    pub fn new(operation_kind: impl Into<String>) -> Self {
        Self {
            backend_id: String::new(),
            operation_kind: operation_kind.into(),
            required_keys: Vec::new(),
            performance_score: 0.5,
            reliability_score: 0.5,
        }
    }

    pub fn requires(mut self, key: impl Into<String>) -> Self {
        self.required_keys.push(key.into());
        self
    }

    pub fn with_scores(mut self, performance_score: f64, reliability_score: f64) -> Self {
        self.performance_score = performance_score;
        self.reliability_score = reliability_score;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.backend_id.trim().is_empty() {
            return Err(Error::Configuration("capability has an empty backend id".to_string()));
        }
        if self.operation_kind.trim().is_empty() {
            return Err(Error::Configuration(format!(
                "capability of backend '{}' has an empty operation kind",
                self.backend_id
            )));
        }
        for (name, score) in [
            ("performance_score", self.performance_score),
            ("reliability_score", self.reliability_score),
        ] {
            if !(0.0..=1.0).contains(&score) {
                return Err(Error::Configuration(format!(
                    "{} of '{}/{}' must be within [0, 1], got {}",
                    name, self.backend_id, self.operation_kind, score
                )));
            }
        }
        Ok(())
    }
}

/// Configuration file structure for capability declarations
#[derive(Debug, Deserialize)]
struct DeclarationFile {
    #[serde(default)]
    capability: Vec<CapabilityDefinition>,
}

#[derive(Debug, Deserialize)]
struct CapabilityDefinition {
    backend: String,
    operation: String,
    #[serde(default)]
    required_keys: Vec<String>,
    #[serde(default = "default_score")]
    performance_score: f64,
    #[serde(default = "default_score")]
    reliability_score: f64,
}

fn default_score() -> f64 {
    0.5
}

/// Parses capability declarations from TOML text
pub fn parse_declarations(content: &str) -> Result<Vec<BackendCapability>> {
    let file: DeclarationFile = toml::from_str(content)
        .map_err(|e| Error::Configuration(format!("invalid capability declarations: {}", e)))?;

    Ok(file
        .capability
        .into_iter()
        .map(|def| BackendCapability {
            backend_id: def.backend,
            operation_kind: def.operation,
            required_keys: def.required_keys,
            performance_score: def.performance_score,
            reliability_score: def.reliability_score,
        })
        .collect())
}

/// Reads capability declarations from a TOML file
pub async fn load_declarations(path: &Path) -> Result<Vec<BackendCapability>> {
    let content = tokio::fs::read_to_string(path).await?;
    let capabilities = parse_declarations(&content)?;
    tracing::info!(
        path = %path.display(),
        count = capabilities.len(),
        "Loaded capability declarations"
    );
    Ok(capabilities)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_declarations() {
        let content = r#"
            [[capability]]
            backend = "llm-primary"
            operation = "summarize"
            required_keys = ["text"]
            performance_score = 0.9
            reliability_score = 0.95

            [[capability]]
            backend = "llm-small"
            operation = "summarize"
        "#;

        let caps = parse_declarations(content).unwrap();
        assert_eq!(caps.len(), 2);
        assert_eq!(caps[0].required_keys, vec!["text".to_string()]);
        assert_eq!(caps[1].performance_score, 0.5);
        assert!(caps[1].required_keys.is_empty());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(parse_declarations("[[capability]]\nbackend = 3"), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_validate_scores() {
        let mut cap = BackendCapability::new("summarize").with_scores(1.2, 0.5);
        cap.backend_id = "b".to_string();
        assert!(cap.validate().is_err());

        cap.performance_score = 0.7;
        assert!(cap.validate().is_ok());
    }
}
