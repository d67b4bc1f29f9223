//! Rendered compose artifacts
//!
//! A run's base files are merged into one document, adjusted for the
//! backend style and written to a uniquely named file. The file lives
//! exactly as long as its [`RenderedArtifact`] handle.

use crate::compose::{ComposeConfig, ComposeParser};
use crate::config::{BackendStyle, OrchestratorSettings, RunConfiguration};
use crate::error::{OrchestratorError, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

const SUFFIX: &str = ".yml";
const ID_LEN: usize = 8;

/// Merged configuration ready to be written, with the replica counts it implies
#[derive(Debug, Clone, PartialEq)]
pub struct RenderPlan {
    pub config: ComposeConfig,
    /// Service name to expected replica count
    pub expected: BTreeMap<String, u32>,
    /// Non-fatal findings from validation
    pub warnings: Vec<String>,
}

/// Generated on-disk compose file, removed when dropped
#[derive(Debug)]
pub struct RenderedArtifact {
    path: PathBuf,
    released: bool,
}

impl RenderedArtifact {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the file now, reporting a failure instead of logging it
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        remove_artifact(&self.path).map_err(|e| {
            OrchestratorError::resource(format!("Failed to remove artifact: {}", e))
                .with_resource(self.path.display().to_string())
        })
    }
}

impl Drop for RenderedArtifact {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = remove_artifact(&self.path) {
            warn!(path = %self.path.display(), error = %e, "Failed to remove artifact");
        }
    }
}

fn remove_artifact(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!(path = %path.display(), "Removed artifact");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Builds render plans and writes artifacts
pub struct ArtifactRenderer<'a> {
    settings: &'a OrchestratorSettings,
}

impl<'a> ArtifactRenderer<'a> {
    pub fn new(settings: &'a OrchestratorSettings) -> Self {
        Self { settings }
    }

    /// Merge, adapt and validate without touching anything but the base files
    pub fn plan(&self, config: &RunConfiguration) -> Result<RenderPlan> {
        let mut merged = ComposeParser::parse_files(config.base_config_paths())?;
        let style = config.backend_style();

        if let Some(redis) = config.redis_endpoint() {
            let coordinator = &self.settings.coordinator_service;
            let service = merged.services.get_mut(coordinator).ok_or_else(|| {
                OrchestratorError::config(format!(
                    "Redis endpoint is set but coordinator service '{}' is not defined",
                    coordinator
                ))
            })?;
            service.set_env("REDIS_HOST", &redis.host);
            service.set_env("REDIS_PORT", &redis.port.to_string());
        }

        match style {
            BackendStyle::Compose if config.worker_count() > 1 => {
                if let Some(worker) = merged.services.get_mut(&self.settings.worker_service) {
                    if worker.container_name.take().is_some() {
                        debug!(service = %self.settings.worker_service, "Dropped container_name from scaled service");
                    }
                }
            }
            BackendStyle::Compose => {}
            BackendStyle::Swarm => {
                for service in merged.services.values_mut() {
                    service.container_name = None;
                }
            }
        }

        let warnings = ComposeParser::validate(&merged)?;
        for warning in &warnings {
            warn!(project = %config.project_name(), "{}", warning);
        }

        if !merged.services.contains_key(&self.settings.worker_service) {
            return Err(OrchestratorError::config(format!(
                "Worker service '{}' is not defined in the merged configuration",
                self.settings.worker_service
            )));
        }

        let expected = self.expected_replicas(&merged, config);
        Ok(RenderPlan {
            config: merged,
            expected,
            warnings,
        })
    }

    /// Replicas each service should reach: the worker count for the worker
    /// service, `deploy.replicas` or 1 for everything else
    pub fn expected_replicas(&self, merged: &ComposeConfig, config: &RunConfiguration) -> BTreeMap<String, u32> {
        merged
            .services
            .iter()
            .map(|(name, service)| {
                let count = if *name == self.settings.worker_service {
                    config.worker_count()
                } else {
                    service.declared_replicas().unwrap_or(1)
                };
                (name.clone(), count)
            })
            .collect()
    }

    pub fn to_yaml(&self, plan: &RenderPlan) -> Result<String> {
        serde_yaml::to_string(&plan.config)
            .map_err(|e| OrchestratorError::config(format!("Failed to serialize configuration: {}", e)))
    }

    /// Write `plan` to a fresh file in the artifact directory
    pub fn write(&self, config: &RunConfiguration, plan: &RenderPlan) -> Result<RenderedArtifact> {
        let style = config.backend_style();
        let yaml = self.to_yaml(plan)?;
        let dir = &self.settings.artifact_dir;
        let path = dir.join(artifact_file_name(&self.settings.artifact_prefix, config.project_name()));

        let write_err = |e: std::io::Error| {
            OrchestratorError::backend(style, format!("Failed to write artifact: {}", e))
                .with_resource(path.display().to_string())
        };
        fs::create_dir_all(dir).map_err(write_err)?;
        fs::write(&path, yaml).map_err(write_err)?;

        info!(project = %config.project_name(), path = %path.display(), "Rendered artifact");
        Ok(RenderedArtifact { path, released: false })
    }

    pub fn render(&self, config: &RunConfiguration) -> Result<RenderedArtifact> {
        let plan = self.plan(config)?;
        self.write(config, &plan)
    }
}

fn artifact_file_name(prefix: &str, project: &str) -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}{}", prefix, project, &id[..ID_LEN], SUFFIX)
}

/// Whether `file_name` is an artifact rendered for exactly `project`
///
/// Another project whose name extends this one never matches.
pub fn is_artifact_for(prefix: &str, project: &str, file_name: &str) -> bool {
    let head = format!("{}-{}-", prefix, project);
    file_name
        .strip_prefix(&head)
        .and_then(|rest| rest.strip_suffix(SUFFIX))
        .map_or(false, |id| id.len() == ID_LEN && id.chars().all(|c| c.is_ascii_hexdigit()))
}
