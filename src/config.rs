//! Pipeline configuration
//!
//! JSON-shaped with fixed field names. Validation happens at construction;
//! a config that validates never fails for configuration reasons at
//! runtime.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Configuration for one pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Unique pipeline name within the process.
    #[serde(rename = "pipeline_name")]
    pub name: String,

    /// Plugin names executed in declared order.
    #[serde(rename = "plugin_names")]
    pub plugins: Vec<String>,

    /// Number of parallel workers, in `[1, 65535]`.
    pub parallelism: u16,
}

impl PipelineConfig {
    pub fn new(name: impl Into<String>, plugins: Vec<String>, parallelism: u16) -> Self {
        Self {
            name: name.into(),
            plugins,
            parallelism,
        }
    }

    /// Load from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::InvalidConfig(format!("failed to read config file: {}", e)))?;
        Self::from_json(&content)
    }

    /// Parse from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| Error::InvalidConfig(format!("failed to parse pipeline config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidConfig("invalid pipeline name".to_string()));
        }
        if self.plugins.is_empty() {
            return Err(Error::InvalidConfig("pipeline is empty".to_string()));
        }
        if self.parallelism < 1 {
            return Err(Error::InvalidConfig(
                "invalid pipeline parallelism".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_config() {
        let config = PipelineConfig::new("p", vec!["a".to_string()], 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_blank_name_rejected() {
        let config = PipelineConfig::new("  ", vec!["a".to_string()], 1);
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_empty_plugins_rejected() {
        let config = PipelineConfig::new("p", vec![], 1);
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_zero_parallelism_rejected() {
        let config = PipelineConfig::new("p", vec!["a".to_string()], 0);
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_wire_field_names() {
        let config: PipelineConfig = serde_json::from_str(
            r#"{"pipeline_name": "p", "plugin_names": ["a", "b"], "parallelism": 8}"#,
        )
        .unwrap();
        assert_eq!(config.name, "p");
        assert_eq!(config.plugins, vec!["a", "b"]);
        assert_eq!(config.parallelism, 8);

        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("pipeline_name"));
        assert!(json.contains("plugin_names"));
    }

    #[test]
    fn test_from_json_validates() {
        let err = PipelineConfig::from_json(
            r#"{"pipeline_name": "p", "plugin_names": [], "parallelism": 1}"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }
}
