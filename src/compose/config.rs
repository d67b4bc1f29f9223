//! Compose file model
//!
//! Only the keys the orchestrator reads or rewrites are typed. Everything
//! else is kept in flattened passthrough maps so a rendered file keeps
//! every key the orchestrator does not understand.

use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::BTreeMap;

/// Compose (or stack) file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComposeConfig {
    /// Services
    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,
    /// Top-level keys passed through untouched (version, networks, volumes, ...)
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl ComposeConfig {
    /// Service names in sorted order
    pub fn service_names(&self) -> Vec<String> {
        self.services.keys().cloned().collect()
    }
}

/// Service configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Image name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Build configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<Value>,
    /// Container name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,
    /// Environment variables
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<EnvironmentConfig>,
    /// Service dependencies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<DependsOnConfig>,
    /// Deploy configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deploy: Option<DeployConfig>,
    /// Remaining service keys
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl ServiceConfig {
    /// Replica count declared under `deploy.replicas`
    pub fn declared_replicas(&self) -> Option<u32> {
        self.deploy.as_ref().and_then(|d| d.replicas)
    }

    /// Set an environment variable, converting an absent section to map form
    pub fn set_env(&mut self, key: &str, value: &str) {
        self.environment
            .get_or_insert_with(|| EnvironmentConfig::Map(BTreeMap::new()))
            .set(key, value);
    }
}

/// Environment configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvironmentConfig {
    /// Array of KEY=value strings
    Array(Vec<String>),
    /// Map of key to value (numbers and booleans are allowed)
    Map(BTreeMap<String, Option<Value>>),
}

impl EnvironmentConfig {
    /// Insert or replace `key`
    pub fn set(&mut self, key: &str, value: &str) {
        match self {
            EnvironmentConfig::Map(map) => {
                map.insert(key.to_string(), Some(Value::String(value.to_string())));
            }
            EnvironmentConfig::Array(items) => {
                let prefix = format!("{}=", key);
                items.retain(|item| item != key && !item.starts_with(&prefix));
                items.push(format!("{}={}", key, value));
            }
        }
    }

    /// Value of `key` rendered as a string
    pub fn get(&self, key: &str) -> Option<String> {
        match self {
            EnvironmentConfig::Map(map) => map.get(key).and_then(|v| v.as_ref()).map(|v| match v {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                other => serde_yaml::to_string(other).unwrap_or_default().trim().to_string(),
            }),
            EnvironmentConfig::Array(items) => {
                let prefix = format!("{}=", key);
                items
                    .iter()
                    .find_map(|item| item.strip_prefix(&prefix).map(str::to_string))
            }
        }
    }
}

/// Depends on configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DependsOnConfig {
    /// Simple array of service names
    Array(Vec<String>),
    /// Map with conditions
    Map(BTreeMap<String, Value>),
}

impl DependsOnConfig {
    pub fn services(&self) -> Vec<String> {
        match self {
            DependsOnConfig::Array(arr) => arr.clone(),
            DependsOnConfig::Map(map) => map.keys().cloned().collect(),
        }
    }
}

/// Deploy configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeployConfig {
    /// Number of replicas
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<u32>,
    /// Remaining deploy keys (resources, restart_policy, placement, ...)
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}
