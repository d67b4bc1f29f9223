//! Docker Compose backend

use crate::artifact::RenderedArtifact;
use crate::backend::{self, Backend, RunContext};
use crate::config::{BackendStyle, OrchestratorSettings};
use crate::error::{OrchestratorError, Result};
use crate::exec::CommandExecutor;
use crate::status::{InstanceState, ServiceStatusSnapshot};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// stderr fragments meaning `down` found nothing to remove
const ALREADY_DOWN: &[&str] = &["no resource found"];

/// One container row of `compose ps --format json`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct PsEntry {
    pub service: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub health: String,
}

impl PsEntry {
    fn instance_state(&self) -> InstanceState {
        match self.state.to_lowercase().as_str() {
            "running" if self.health.eq_ignore_ascii_case("starting") => InstanceState::Starting,
            "running" => InstanceState::Running,
            "created" | "restarting" => InstanceState::Starting,
            "exited" | "dead" | "paused" | "removing" => InstanceState::Stopped,
            _ => InstanceState::Unknown,
        }
    }
}

/// Parse `ps` output printed either as one JSON array or one object per line
pub(crate) fn parse_ps(output: &str) -> std::result::Result<Vec<PsEntry>, serde_json::Error> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed);
    }
    trimmed
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(serde_json::from_str)
        .collect()
}

/// Runs a project through `docker compose`
pub struct ComposeBackend {
    executor: Arc<dyn CommandExecutor>,
    settings: Arc<OrchestratorSettings>,
}

impl ComposeBackend {
    pub fn new(executor: Arc<dyn CommandExecutor>, settings: Arc<OrchestratorSettings>) -> Self {
        Self { executor, settings }
    }

    fn command(&self, file: Option<&Path>, project: &str, args: &[&str]) -> Vec<String> {
        let mut argv = self.settings.compose_command.clone();
        if let Some(file) = file {
            argv.push("-f".to_string());
            argv.push(file.display().to_string());
        }
        argv.push("-p".to_string());
        argv.push(project.to_string());
        argv.extend(args.iter().map(|a| a.to_string()));
        argv
    }
}

#[async_trait]
impl Backend for ComposeBackend {
    fn style(&self) -> BackendStyle {
        BackendStyle::Compose
    }

    fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    async fn prepare_network(&self, ctx: &RunContext) -> Result<()> {
        backend::ensure_network(self.executor.as_ref(), &self.settings, ctx, BackendStyle::Compose).await
    }

    async fn deploy(&self, ctx: &RunContext, artifact: RenderedArtifact) -> Result<()> {
        let scale = format!("{}={}", self.settings.worker_service, ctx.config.worker_count());
        let argv = self.command(
            Some(artifact.path()),
            ctx.project(),
            &["up", "-d", "--remove-orphans", "--force-recreate", "--scale", &scale],
        );

        info!(project = %ctx.project(), workers = ctx.config.worker_count(), "Starting compose project");
        let result = backend::run(self.executor.as_ref(), &self.settings, ctx, argv).await;
        let released = artifact.release();

        let result = result?;
        if !result.success() {
            return Err(OrchestratorError::command_failed(BackendStyle::Compose, "start services", result)
                .with_resource(ctx.project()));
        }
        released
    }

    async fn status(&self, ctx: &RunContext) -> Result<ServiceStatusSnapshot> {
        let argv = self.command(None, ctx.project(), &["ps", "--all", "--format", "json"]);
        let result = backend::run(self.executor.as_ref(), &self.settings, ctx, argv).await?;
        if !result.success() {
            return Err(OrchestratorError::command_failed(BackendStyle::Compose, "list containers", result));
        }

        let entries = match parse_ps(&result.stdout) {
            Ok(entries) => entries,
            Err(e) => {
                return Err(OrchestratorError::backend(
                    BackendStyle::Compose,
                    format!("Unparsable container listing: {}", e),
                )
                .with_result(result))
            }
        };

        for entry in &entries {
            debug!(container = %entry.name, service = %entry.service, state = %entry.state, "Observed container");
        }
        Ok(ServiceStatusSnapshot::aggregate(
            ctx.project(),
            &ctx.expected,
            entries.iter().map(|e| (e.service.clone(), e.instance_state())),
        ))
    }

    async fn logs(&self, ctx: &RunContext, service: &str, tail: u32) -> Result<String> {
        let snapshot = self.status(ctx).await?;
        backend::require_service(BackendStyle::Compose, &snapshot, service)?;

        let tail = tail.to_string();
        let argv = self.command(None, ctx.project(), &["logs", "--no-color", "--tail", &tail, service]);
        let result = backend::run(self.executor.as_ref(), &self.settings, ctx, argv).await?;
        if !result.success() {
            return Err(OrchestratorError::command_failed(BackendStyle::Compose, "fetch logs", result)
                .with_resource(service));
        }
        Ok(format!("{}{}", result.stdout, result.stderr))
    }

    async fn down(&self, ctx: &RunContext) -> Result<()> {
        let argv = self.command(None, ctx.project(), &["down", "--remove-orphans", "--volumes"]);
        let result = backend::run(self.executor.as_ref(), &self.settings, ctx, argv).await?;

        if result.success() {
            info!(project = %ctx.project(), "Compose project removed");
            Ok(())
        } else if ALREADY_DOWN.iter().any(|s| result.output_contains(s)) {
            debug!(project = %ctx.project(), "Compose project already down");
            Ok(())
        } else {
            Err(OrchestratorError::command_failed(BackendStyle::Compose, "stop services", result)
                .with_resource(ctx.project()))
        }
    }
}
