//! Orchestrator settings

use crate::error::{OrchestratorError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Process-level orchestrator settings
///
/// Every field has a default, so a settings file only needs the keys it
/// changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSettings {
    /// Docker CLI binary
    pub docker_binary: String,
    /// Command prefix for Compose (`docker compose` or `docker-compose`)
    pub compose_command: Vec<String>,
    /// Timeout applied to every external command
    pub command_timeout_secs: u64,
    /// Delay before the first status re-check
    pub poll_interval_ms: u64,
    /// Upper bound for the exponential poll backoff
    pub poll_max_interval_ms: u64,
    /// Status checks before a startup is declared timed out
    pub poll_max_attempts: u32,
    /// Directory receiving rendered artifacts
    pub artifact_dir: PathBuf,
    /// File name prefix for rendered artifacts
    pub artifact_prefix: String,
    /// Service scaled to the run's worker count
    pub worker_service: String,
    /// Service receiving the Redis endpoint
    pub coordinator_service: String,
    /// Shared external network created before deploy (`None` to skip)
    pub network: Option<String>,
    /// Pass `--detach=true` to `docker stack deploy`
    pub swarm_detach: bool,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        let artifact_dir = dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("drfc")
            .join("artifacts");

        Self {
            docker_binary: "docker".to_string(),
            compose_command: vec!["docker".to_string(), "compose".to_string()],
            command_timeout_secs: 120,
            poll_interval_ms: 2_000,
            poll_max_interval_ms: 15_000,
            poll_max_attempts: 30,
            artifact_dir,
            artifact_prefix: "drfc".to_string(),
            worker_service: "robomaker".to_string(),
            coordinator_service: "rl_coach".to_string(),
            network: Some("sagemaker-local".to_string()),
            swarm_detach: true,
        }
    }
}

impl OrchestratorSettings {
    /// Load settings from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            OrchestratorError::config(format!("Failed to read settings file {}: {}", path.display(), e))
                .with_resource(path.display().to_string())
        })?;
        Self::parse_str(&content)
    }

    /// Parse settings from YAML text
    pub fn parse_str(content: &str) -> Result<Self> {
        let settings: Self = serde_yaml::from_str(content)
            .map_err(|e| OrchestratorError::config(format!("Failed to parse settings: {}", e)))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.compose_command.is_empty() {
            return Err(OrchestratorError::config("compose_command must not be empty"));
        }
        if self.poll_max_attempts == 0 {
            return Err(OrchestratorError::config("poll_max_attempts must be at least 1"));
        }
        if self.artifact_prefix.is_empty() || self.artifact_prefix.contains('/') {
            return Err(OrchestratorError::config(
                "artifact_prefix must be a non-empty file name fragment",
            ));
        }
        Ok(())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn poll_max_interval(&self) -> Duration {
        Duration::from_millis(self.poll_max_interval_ms)
    }

    /// Longest time a status poll loop can block
    pub fn max_poll_wait(&self) -> Duration {
        let cap = self.poll_max_interval();
        let mut total = Duration::ZERO;
        let mut delay = self.poll_interval();
        let mut sleeps = self.poll_max_attempts.saturating_sub(1);

        while sleeps > 0 && delay < cap {
            total += delay;
            delay = (delay * 2).min(cap);
            sleeps -= 1;
        }
        if sleeps > 0 {
            total = total
                .saturating_add(delay)
                .saturating_add(cap.saturating_mul(sleeps - 1));
        }
        total
    }
}
