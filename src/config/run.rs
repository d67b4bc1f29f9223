//! Run configuration

use crate::error::{OrchestratorError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Environment variables every command of a run must see
pub const REQUIRED_ENV_KEYS: &[&str] = &["DR_RUN_ID", "DR_WORKERS", "DR_DOCKER_STYLE", "DR_AWS_APP_REGION"];

/// Project names accepted by both Compose and Swarm
const PROJECT_NAME_PATTERN: &str = r"^[a-z0-9][a-z0-9_-]*$";

const DEFAULT_REGION: &str = "us-east-1";
const DEFAULT_REDIS_PORT: u16 = 6379;

/// Container orchestration backend style
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendStyle {
    /// Docker Compose project
    #[default]
    Compose,
    /// Docker Swarm stack
    Swarm,
}

impl BackendStyle {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendStyle::Compose => "compose",
            BackendStyle::Swarm => "swarm",
        }
    }
}

impl fmt::Display for BackendStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendStyle {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "compose" => Ok(BackendStyle::Compose),
            "swarm" => Ok(BackendStyle::Swarm),
            other => Err(OrchestratorError::config(format!(
                "Unknown backend style '{}' (expected compose or swarm)",
                other
            ))),
        }
    }
}

/// Redis endpoint injected into the coordinator service
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RedisEndpoint {
    pub host: String,
    pub port: u16,
}

impl FromStr for RedisEndpoint {
    type Err = OrchestratorError;

    /// Accepts `host`, `host:port` or `redis://host:port`
    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let without_scheme = trimmed.strip_prefix("redis://").unwrap_or(trimmed);
        let without_path = without_scheme.split('/').next().unwrap_or_default();

        let (host, port) = match without_path.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| {
                    OrchestratorError::config(format!("Invalid Redis port in endpoint '{}'", s))
                })?;
                (host, port)
            }
            None => (without_path, DEFAULT_REDIS_PORT),
        };

        if host.is_empty() {
            return Err(OrchestratorError::config(format!(
                "Redis endpoint '{}' has no host",
                s
            )));
        }

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for RedisEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Immutable description of one orchestration run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunConfiguration {
    backend_style: BackendStyle,
    project_name: String,
    run_id: u32,
    worker_count: u32,
    region: String,
    environment_overrides: BTreeMap<String, String>,
    base_config_paths: Vec<PathBuf>,
    redis_endpoint: Option<RedisEndpoint>,
}

impl RunConfiguration {
    /// Start building a configuration for `run_id`
    pub fn builder(run_id: u32) -> RunConfigurationBuilder {
        RunConfigurationBuilder::new(run_id)
    }

    /// Load from `DR_*` variables of the current process
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary variable lookup
    ///
    /// `DR_RUN_ID`, `DR_WORKERS` and `DR_DOCKER_STYLE` are required.
    /// `DR_COMPOSE_FILES` is a comma separated list of base files.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| OrchestratorError::config(format!("Missing required environment variable {}", key)))
        };

        let run_id = parse_number(&required("DR_RUN_ID")?, "DR_RUN_ID")?;
        let workers = parse_number(&required("DR_WORKERS")?, "DR_WORKERS")?;
        let style: BackendStyle = required("DR_DOCKER_STYLE")?.parse()?;

        let mut builder = RunConfigurationBuilder::new(run_id)
            .style(style)
            .workers(workers);

        if let Some(region) = lookup("DR_AWS_APP_REGION") {
            builder = builder.region(region);
        }
        if let Some(project) = lookup("DR_PROJECT_NAME") {
            builder = builder.project_name(project);
        }
        if let Some(redis) = lookup("DR_REDIS_ENDPOINT").filter(|v| !v.trim().is_empty()) {
            builder = builder.redis_endpoint(redis);
        }
        if let Some(files) = lookup("DR_COMPOSE_FILES") {
            for file in files.split(',').map(str::trim).filter(|f| !f.is_empty()) {
                builder = builder.base_config(file);
            }
        }

        builder.build()
    }

    pub fn backend_style(&self) -> BackendStyle {
        self.backend_style
    }

    pub fn project_name(&self) -> &str {
        &self.project_name
    }

    pub fn run_id(&self) -> u32 {
        self.run_id
    }

    pub fn worker_count(&self) -> u32 {
        self.worker_count
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn environment_overrides(&self) -> &BTreeMap<String, String> {
        &self.environment_overrides
    }

    pub fn base_config_paths(&self) -> &[PathBuf] {
        &self.base_config_paths
    }

    pub fn redis_endpoint(&self) -> Option<&RedisEndpoint> {
        self.redis_endpoint.as_ref()
    }

    /// Environment passed verbatim to every command of this run
    ///
    /// The fixed base set comes first and the overrides are layered on top.
    pub fn environment(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert("DR_RUN_ID".to_string(), self.run_id.to_string());
        env.insert("DR_WORKERS".to_string(), self.worker_count.to_string());
        env.insert("DR_DOCKER_STYLE".to_string(), self.backend_style.to_string());
        env.insert("DR_AWS_APP_REGION".to_string(), self.region.clone());
        if let Some(ref redis) = self.redis_endpoint {
            env.insert("REDIS_HOST".to_string(), redis.host.clone());
            env.insert("REDIS_PORT".to_string(), redis.port.to_string());
        }

        for (key, value) in &self.environment_overrides {
            env.insert(key.clone(), value.clone());
        }
        env
    }
}

/// Check that every required key is present and non-empty
pub(crate) fn validate_environment(env: &BTreeMap<String, String>) -> Result<()> {
    let missing: Vec<&str> = REQUIRED_ENV_KEYS
        .iter()
        .copied()
        .filter(|key| env.get(*key).map_or(true, |v| v.trim().is_empty()))
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(OrchestratorError::config(format!(
            "Missing critical environment variables: {}",
            missing.join(", ")
        )))
    }
}

fn parse_number(value: &str, key: &str) -> Result<u32> {
    value
        .trim()
        .parse()
        .map_err(|_| OrchestratorError::config(format!("{} must be a non-negative integer, got '{}'", key, value)))
}

/// Builder for [`RunConfiguration`]
#[derive(Debug, Clone)]
pub struct RunConfigurationBuilder {
    run_id: u32,
    backend_style: BackendStyle,
    project_name: Option<String>,
    worker_count: u32,
    region: String,
    environment_overrides: BTreeMap<String, String>,
    base_config_paths: Vec<PathBuf>,
    redis_endpoint: Option<String>,
}

impl RunConfigurationBuilder {
    pub fn new(run_id: u32) -> Self {
        Self {
            run_id,
            backend_style: BackendStyle::default(),
            project_name: None,
            worker_count: 1,
            region: DEFAULT_REGION.to_string(),
            environment_overrides: BTreeMap::new(),
            base_config_paths: Vec::new(),
            redis_endpoint: None,
        }
    }

    pub fn style(mut self, style: BackendStyle) -> Self {
        self.backend_style = style;
        self
    }

    /// Defaults to `deepracer-{run_id}`
    pub fn project_name(mut self, name: impl Into<String>) -> Self {
        self.project_name = Some(name.into());
        self
    }

    pub fn workers(mut self, count: u32) -> Self {
        self.worker_count = count;
        self
    }

    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    /// Add an environment override; a repeated key replaces the earlier value
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment_overrides.insert(key.into(), value.into());
        self
    }

    /// Append a base configuration file (later files take precedence)
    pub fn base_config(mut self, path: impl AsRef<Path>) -> Self {
        self.base_config_paths.push(path.as_ref().to_path_buf());
        self
    }

    pub fn redis_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.redis_endpoint = Some(endpoint.into());
        self
    }

    pub fn build(self) -> Result<RunConfiguration> {
        if self.worker_count < 1 {
            return Err(OrchestratorError::config("Worker count must be at least 1"));
        }

        let project_name = self
            .project_name
            .unwrap_or_else(|| format!("deepracer-{}", self.run_id));
        let pattern = Regex::new(PROJECT_NAME_PATTERN)
            .map_err(|e| OrchestratorError::config(format!("Invalid project name pattern: {}", e)))?;
        if !pattern.is_match(&project_name) {
            return Err(OrchestratorError::config(format!(
                "Invalid project name '{}': must match {}",
                project_name, PROJECT_NAME_PATTERN
            )));
        }

        let redis_endpoint = self
            .redis_endpoint
            .as_deref()
            .map(str::parse::<RedisEndpoint>)
            .transpose()?;

        Ok(RunConfiguration {
            backend_style: self.backend_style,
            project_name,
            run_id: self.run_id,
            worker_count: self.worker_count,
            region: self.region,
            environment_overrides: self.environment_overrides,
            base_config_paths: self.base_config_paths,
            redis_endpoint,
        })
    }
}
