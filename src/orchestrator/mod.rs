//! Orchestration facade
//!
//! [`Orchestrator`] is the single entry point for running a training stack.
//! It picks the backend for a run, holds the project's run lock while a
//! lifecycle verb executes, and guarantees cleanup on every exit path of
//! `start`. Every verb fails fast with a `ConfigError` while another verb
//! holds the same project.

pub mod registry;

pub use registry::{RunLease, RunRegistry, RunState};

use crate::artifact::{ArtifactRenderer, RenderPlan};
use crate::backend::{self, wait_until_running, Backend, RunContext};
use crate::cleaner::{CleanupReport, CleanupScope, CleanupTrigger, ResourceCleaner};
use crate::config::run::validate_environment;
use crate::config::{BackendStyle, OrchestratorSettings, RunConfiguration};
use crate::error::{ErrorCategory, ErrorRecord, OrchestratorError, Result};
use crate::exec::{CommandExecutor, ProcessExecutor};
use crate::status::ServiceStatusSnapshot;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle manager over the Compose and Swarm backends
pub struct Orchestrator {
    executor: Arc<dyn CommandExecutor>,
    settings: Arc<OrchestratorSettings>,
    registry: Arc<RunRegistry>,
    cleaner: ResourceCleaner,
}

impl Orchestrator {
    /// Orchestrator spawning real processes, with a fresh registry
    pub fn new(settings: OrchestratorSettings) -> Self {
        Self::with_executor(
            Arc::new(ProcessExecutor::new()),
            Arc::new(settings),
            Arc::new(RunRegistry::new()),
        )
    }

    pub fn with_executor(
        executor: Arc<dyn CommandExecutor>,
        settings: Arc<OrchestratorSettings>,
        registry: Arc<RunRegistry>,
    ) -> Self {
        let cleaner = ResourceCleaner::new(executor.clone(), settings.clone());
        Self {
            executor,
            settings,
            registry,
            cleaner,
        }
    }

    pub fn registry(&self) -> &Arc<RunRegistry> {
        &self.registry
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn backend(&self, style: BackendStyle) -> Box<dyn Backend> {
        backend::select(style, self.executor.clone(), self.settings.clone())
    }

    /// Validate a run and compute its merged configuration without running anything
    pub fn plan(&self, config: &RunConfiguration) -> Result<RenderPlan> {
        validate_environment(&config.environment())?;
        self.backend(config.backend_style()).plan(config)
    }

    /// Merged configuration of a run as YAML
    pub fn render_yaml(&self, config: &RunConfiguration) -> Result<String> {
        let plan = self.plan(config)?;
        ArtifactRenderer::new(&self.settings).to_yaml(&plan)
    }

    /// Start a run and wait until every expected service is running
    pub async fn start(&self, config: &RunConfiguration) -> Result<ServiceStatusSnapshot> {
        self.start_with_cancel(config, CancellationToken::new()).await
    }

    /// Like [`start`](Self::start), aborting at the next status poll once `cancel` fires
    ///
    /// A cancelled start tears the project down and returns a `Cancelled` error.
    pub async fn start_with_cancel(
        &self,
        config: &RunConfiguration,
        cancel: CancellationToken,
    ) -> Result<ServiceStatusSnapshot> {
        let project = config.project_name();
        let backend = self.backend(config.backend_style());

        // Nothing below runs a command until the lease is held
        let plan = self.plan(config)?;
        let mut lease = self.registry.try_acquire(project)?;
        if lease.state() == RunState::Running {
            return Err(OrchestratorError::config(format!(
                "Project {} is already running; stop it first",
                project
            ))
            .with_resource(project));
        }

        lease.record(config, plan.expected.clone());
        let ctx = RunContext::new(config, plan.expected.clone()).with_cancel(cancel);
        info!(project, style = %config.backend_style(), workers = config.worker_count(), "Starting run");

        match self.drive_start(backend.as_ref(), &mut lease, &ctx, &plan).await {
            Ok(snapshot) => {
                lease.transition(RunState::Running)?;
                info!(project, "Run is running");
                Ok(snapshot)
            }
            Err(err) if err.category() == ErrorCategory::Cancelled => {
                warn!(project, "Start cancelled, tearing down");
                if lease.state() != RunState::Polling {
                    lease.fail();
                }
                lease.transition(RunState::StoppingCleaning)?;
                let cleanup_errors = match self.teardown(backend.as_ref(), &ctx).await {
                    Ok(report) => report.errors,
                    Err(teardown) => vec![teardown.into_record()],
                };
                lease.transition(RunState::Idle)?;
                Err(err.with_cleanup_errors(cleanup_errors))
            }
            Err(err) => {
                error!(project, state = %lease.state(), "Start failed: {}", err.record().message);
                lease.fail();

                // A partially scaled stack stays up for inspection
                let scope = if err.record().partial.is_some() {
                    CleanupScope::ArtifactsOnly
                } else {
                    CleanupScope::Full
                };
                let report = self
                    .cleaner
                    .cleanup(backend.as_ref(), &ctx, scope, CleanupTrigger::Defensive)
                    .await;
                Err(err.with_cleanup_errors(report.errors))
            }
        }
    }

    async fn drive_start(
        &self,
        backend: &dyn Backend,
        lease: &mut RunLease,
        ctx: &RunContext,
        plan: &RenderPlan,
    ) -> Result<ServiceStatusSnapshot> {
        lease.transition(RunState::Cleaning)?;
        let report = self.cleaner.cleanup_previous_run(backend, ctx).await;
        if !report.is_clean() {
            debug!(project = %ctx.project(), errors = report.errors.len(), "Proactive cleanup was incomplete");
        }

        lease.transition(RunState::Rendering)?;
        let artifact = backend.render(ctx, plan)?;

        lease.transition(RunState::Deploying)?;
        backend.prepare_network(ctx).await?;
        backend.deploy(ctx, artifact).await?;

        if backend.scales_after_deploy() {
            lease.transition(RunState::Scaling)?;
            backend.scale(ctx).await?;
        }

        lease.transition(RunState::Polling)?;
        wait_until_running(backend, ctx).await
    }

    /// Stop a run: remove the project, then clean up after it
    ///
    /// Both steps run even when the first fails. Stopping a project that is
    /// not running is not an error.
    pub async fn stop(&self, config: &RunConfiguration) -> Result<CleanupReport> {
        let project = config.project_name();
        let backend = self.backend(config.backend_style());
        let mut lease = self.registry.try_acquire(project)?;
        let ctx = RunContext::new(config, self.expected_for(backend.as_ref(), config, &lease));

        info!(project, "Stopping run");
        lease.transition(RunState::StoppingCleaning)?;
        let result = self.teardown(backend.as_ref(), &ctx).await;
        lease.transition(RunState::Idle)?;
        result
    }

    async fn teardown(&self, backend: &dyn Backend, ctx: &RunContext) -> Result<CleanupReport> {
        let down = backend.down(ctx).await;
        let report = self
            .cleaner
            .cleanup(backend, ctx, CleanupScope::Prune, CleanupTrigger::Teardown)
            .await;

        match down {
            Ok(()) => Ok(report),
            Err(err) => Err(err.with_cleanup_errors(report.errors)),
        }
    }

    /// Fresh status of a project's services
    pub async fn status(&self, config: &RunConfiguration) -> Result<ServiceStatusSnapshot> {
        let backend = self.backend(config.backend_style());
        let lease = self.registry.try_acquire(config.project_name())?;
        let ctx = RunContext::new(config, self.expected_for(backend.as_ref(), config, &lease));
        backend.status(&ctx).await
    }

    /// Last `tail` log lines of one service
    pub async fn logs(&self, config: &RunConfiguration, service: &str, tail: u32) -> Result<String> {
        let backend = self.backend(config.backend_style());
        let lease = self.registry.try_acquire(config.project_name())?;
        let ctx = RunContext::new(config, self.expected_for(backend.as_ref(), config, &lease));
        backend.logs(&ctx, service, tail).await
    }

    /// Stop every project this process left running
    pub async fn shutdown(&self) -> Vec<ErrorRecord> {
        let mut errors = Vec::new();
        if self.registry.is_empty() {
            return errors;
        }
        debug!(tracked = self.registry.len(), "Shutting down orchestrator");
        for config in self.registry.running() {
            info!(project = %config.project_name(), "Shutting down run");
            if let Err(err) = self.stop(&config).await {
                errors.push(err.into_record());
            }
        }
        errors
    }

    // The plan, else the counts recorded by the last start, else the worker alone
    fn expected_for(&self, backend: &dyn Backend, config: &RunConfiguration, lease: &RunLease) -> BTreeMap<String, u32> {
        match backend.plan(config) {
            Ok(plan) => plan.expected,
            Err(err) => {
                debug!(project = %config.project_name(), "Falling back to recorded replica counts: {}", err.record().message);
                if lease.expected().is_empty() {
                    BTreeMap::from([(self.settings.worker_service.clone(), config.worker_count())])
                } else {
                    lease.expected().clone()
                }
            }
        }
    }
}
