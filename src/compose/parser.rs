//! Layered compose file parsing

use super::config::ComposeConfig;
use crate::error::{OrchestratorError, Result};
use serde_yaml::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Compose file parser
pub struct ComposeParser;

impl ComposeParser {
    /// Parse compose file from path
    pub fn parse_file(path: &Path) -> Result<ComposeConfig> {
        let value = Self::read_value(path)?;
        Self::from_value(value)
    }

    /// Parse compose file from string
    pub fn parse_str(content: &str) -> Result<ComposeConfig> {
        let value: Value = serde_yaml::from_str(content)
            .map_err(|e| OrchestratorError::config(format!("Failed to parse YAML: {}", e)))?;
        Self::from_value(value)
    }

    /// Parse and merge layered files; later files override earlier keys
    ///
    /// Paths that do not exist are skipped. At least one must resolve.
    pub fn parse_files(paths: &[PathBuf]) -> Result<ComposeConfig> {
        let mut merged = Value::Mapping(Default::default());
        let mut resolved = 0usize;

        for path in paths {
            if !path.is_file() {
                warn!(path = %path.display(), "Compose file not found, skipping");
                continue;
            }
            let layer = Self::read_value(path)?;
            Self::merge_values(&mut merged, layer);
            resolved += 1;
            debug!(path = %path.display(), "Merged compose layer");
        }

        if resolved == 0 {
            let listed: Vec<String> = paths.iter().map(|p| p.display().to_string()).collect();
            return Err(OrchestratorError::config(format!(
                "No base configuration files could be resolved from [{}]",
                listed.join(", ")
            )));
        }

        Self::from_value(merged)
    }

    /// Deep-merge `overlay` into `base`
    ///
    /// Mappings merge key by key; any other value (sequences included)
    /// replaces the base value.
    pub fn merge_values(base: &mut Value, overlay: Value) {
        match (base, overlay) {
            (Value::Mapping(base_map), Value::Mapping(overlay_map)) => {
                for (key, value) in overlay_map {
                    let nested = value.is_mapping()
                        && base_map.get(&key).map_or(false, Value::is_mapping);
                    match base_map.get_mut(&key) {
                        Some(existing) if nested => Self::merge_values(existing, value),
                        _ => {
                            base_map.insert(key, value);
                        }
                    }
                }
            }
            // An empty layer document leaves the base untouched
            (_, Value::Null) => {}
            (base, overlay) => *base = overlay,
        }
    }

    /// Validate compose configuration, returning non-fatal warnings
    pub fn validate(config: &ComposeConfig) -> Result<Vec<String>> {
        let mut warnings = Vec::new();

        if config.services.is_empty() {
            return Err(OrchestratorError::config(
                "Merged configuration defines no services",
            ));
        }

        for (name, service) in &config.services {
            // Service must have either image or build
            if service.image.is_none() && service.build.is_none() {
                return Err(OrchestratorError::config(format!(
                    "Service '{}' must have either 'image' or 'build' specified",
                    name
                )));
            }

            if let Some(ref depends) = service.depends_on {
                for dep in depends.services() {
                    if !config.services.contains_key(&dep) {
                        return Err(OrchestratorError::config(format!(
                            "Service '{}' depends on unknown service '{}'",
                            name, dep
                        )));
                    }
                }
            }

            if service.container_name.is_some() && service.declared_replicas().unwrap_or(1) > 1 {
                warnings.push(format!(
                    "Service '{}' sets container_name and cannot run more than one replica",
                    name
                ));
            }
        }

        Ok(warnings)
    }

    fn read_value(path: &Path) -> Result<Value> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            OrchestratorError::config(format!("Failed to read file: {}", e))
                .with_resource(path.display().to_string())
        })?;
        serde_yaml::from_str(&content).map_err(|e| {
            OrchestratorError::config(format!("Failed to parse YAML: {}", e))
                .with_resource(path.display().to_string())
        })
    }

    fn from_value(value: Value) -> Result<ComposeConfig> {
        if value.is_null() {
            return Ok(ComposeConfig::default());
        }
        serde_yaml::from_value(value)
            .map_err(|e| OrchestratorError::config(format!("Invalid compose structure: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_parse_simple_compose() {
        let yaml = r#"
version: "3.8"
services:
  rl_coach:
    image: awsdeepracercommunity/deepracer-rlcoach:5.2
  robomaker:
    image: awsdeepracercommunity/deepracer-robomaker:5.2-cpu
"#;

        let config = ComposeParser::parse_str(yaml).unwrap();
        assert_eq!(config.services.len(), 2);
        assert!(config.services.contains_key("rl_coach"));
        assert!(config.services.contains_key("robomaker"));
    }

    #[test]
    fn test_later_layers_override() {
        let temp = tempdir().unwrap();
        let base = temp.path().join("base.yml");
        let keys = temp.path().join("keys.yml");
        fs::write(
            &base,
            r#"
services:
  robomaker:
    image: robomaker:cpu
    environment:
      WORLD_NAME: base_track
      GUI: "false"
    ports:
      - "8080:8080"
"#,
        )
        .unwrap();
        fs::write(
            &keys,
            r#"
services:
  robomaker:
    image: robomaker:gpu
    environment:
      WORLD_NAME: reInvent2019_track
    ports:
      - "9090:8080"
"#,
        )
        .unwrap();

        let config = ComposeParser::parse_files(&[base, keys]).unwrap();
        let robomaker = &config.services["robomaker"];
        let env = robomaker.environment.as_ref().unwrap();

        assert_eq!(robomaker.image.as_deref(), Some("robomaker:gpu"));
        assert_eq!(env.get("WORLD_NAME").as_deref(), Some("reInvent2019_track"));
        assert_eq!(env.get("GUI").as_deref(), Some("false"));

        // Sequences are replaced, not concatenated
        let ports = robomaker.extra["ports"].as_sequence().unwrap();
        assert_eq!(ports.len(), 1);
    }

    #[test]
    fn test_missing_paths_are_skipped() {
        let temp = tempdir().unwrap();
        let base = temp.path().join("base.yml");
        fs::write(&base, "services:\n  redis:\n    image: redis:alpine\n").unwrap();

        let config = ComposeParser::parse_files(&[temp.path().join("absent.yml"), base]).unwrap();
        assert_eq!(config.service_names(), vec!["redis"]);
    }

    #[test]
    fn test_no_paths_resolve() {
        let temp = tempdir().unwrap();
        let err = ComposeParser::parse_files(&[temp.path().join("absent.yml")]).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Config);
        assert!(err.to_string().contains("No base configuration files"));
    }

    #[test]
    fn test_validate_empty_services() {
        let config = ComposeParser::parse_str("version: \"3.8\"\n").unwrap();
        let err = ComposeParser::validate(&config).unwrap_err();
        assert!(err.to_string().contains("defines no services"));
    }

    #[test]
    fn test_validate_missing_image() {
        let yaml = r#"
services:
  web:
    ports:
      - "80:80"
"#;

        let config = ComposeParser::parse_str(yaml).unwrap();
        let result = ComposeParser::validate(&config);
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_unknown_dependency() {
        let yaml = r#"
services:
  robomaker:
    image: robomaker
    depends_on:
      - rl_coach
"#;
        let config = ComposeParser::parse_str(yaml).unwrap();
        let err = ComposeParser::validate(&config).unwrap_err();
        assert!(err.to_string().contains("unknown service 'rl_coach'"));
    }

    #[test]
    fn test_merge_empty_layer_keeps_base() {
        let mut base: Value = serde_yaml::from_str("services:\n  a:\n    image: x\n").unwrap();
        ComposeParser::merge_values(&mut base, Value::Null);
        assert!(base["services"]["a"].is_mapping());
    }
}
