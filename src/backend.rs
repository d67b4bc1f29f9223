//! Backend contract shared by the Compose and Swarm implementations

use crate::artifact::{ArtifactRenderer, RenderPlan, RenderedArtifact};
use crate::compose::ComposeBackend;
use crate::config::{BackendStyle, OrchestratorSettings, RunConfiguration};
use crate::error::{ErrorCategory, OrchestratorError, Result};
use crate::exec::{CommandExecutor, CommandRequest, CommandResult};
use crate::status::ServiceStatusSnapshot;
use crate::swarm::SwarmBackend;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Everything a backend verb needs to know about the run it acts on
#[derive(Debug, Clone)]
pub struct RunContext {
    pub config: RunConfiguration,
    /// Environment passed to every command
    pub environment: BTreeMap<String, String>,
    /// Service name to expected replica count
    pub expected: BTreeMap<String, u32>,
    pub cancel: CancellationToken,
}

impl RunContext {
    pub fn new(config: &RunConfiguration, expected: BTreeMap<String, u32>) -> Self {
        Self {
            environment: config.environment(),
            config: config.clone(),
            expected,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn project(&self) -> &str {
        self.config.project_name()
    }
}

/// Lifecycle verbs of one orchestration backend
#[async_trait]
pub trait Backend: Send + Sync {
    fn style(&self) -> BackendStyle;

    fn settings(&self) -> &OrchestratorSettings;

    /// Merge and adapt the run's base files; runs no commands
    fn plan(&self, config: &RunConfiguration) -> Result<RenderPlan> {
        ArtifactRenderer::new(self.settings()).plan(config)
    }

    fn render(&self, ctx: &RunContext, plan: &RenderPlan) -> Result<RenderedArtifact> {
        ArtifactRenderer::new(self.settings()).write(&ctx.config, plan)
    }

    /// Make sure the shared external network exists
    async fn prepare_network(&self, ctx: &RunContext) -> Result<()>;

    /// Submit the artifact; the artifact is gone when this returns
    async fn deploy(&self, ctx: &RunContext, artifact: RenderedArtifact) -> Result<()>;

    /// Whether replica counts are applied by a separate pass after deploy
    fn scales_after_deploy(&self) -> bool {
        false
    }

    async fn scale(&self, _ctx: &RunContext) -> Result<()> {
        Ok(())
    }

    async fn status(&self, ctx: &RunContext) -> Result<ServiceStatusSnapshot>;

    async fn logs(&self, ctx: &RunContext, service: &str, tail: u32) -> Result<String>;

    /// Stop and remove the project; an absent project is not an error
    async fn down(&self, ctx: &RunContext) -> Result<()>;

    /// Deploy, scale and wait until every expected service runs
    async fn up(&self, ctx: &RunContext, artifact: RenderedArtifact) -> Result<ServiceStatusSnapshot> {
        self.prepare_network(ctx).await?;
        self.deploy(ctx, artifact).await?;
        if self.scales_after_deploy() {
            self.scale(ctx).await?;
        }
        wait_until_running(self, ctx).await
    }
}

/// Backend for `style`
pub fn select(
    style: BackendStyle,
    executor: Arc<dyn CommandExecutor>,
    settings: Arc<OrchestratorSettings>,
) -> Box<dyn Backend> {
    match style {
        BackendStyle::Compose => Box::new(ComposeBackend::new(executor, settings)),
        BackendStyle::Swarm => Box::new(SwarmBackend::new(executor, settings)),
    }
}

/// Poll `status` with exponential backoff until every expected service runs
///
/// A command timeout counts as one not-yet-running attempt. Cancellation is
/// observed between attempts only.
pub async fn wait_until_running<B>(backend: &B, ctx: &RunContext) -> Result<ServiceStatusSnapshot>
where
    B: Backend + ?Sized,
{
    let settings = backend.settings();
    let max_attempts = settings.poll_max_attempts.max(1);
    let mut delay = settings.poll_interval();
    let mut last: Option<ServiceStatusSnapshot> = None;
    info!(
        project = %ctx.project(),
        max_attempts,
        max_wait = ?settings.max_poll_wait(),
        "Waiting for services to run"
    );

    for attempt in 1..=max_attempts {
        if ctx.cancel.is_cancelled() {
            return Err(cancelled(ctx));
        }

        match backend.status(ctx).await {
            Ok(snapshot) if snapshot.all_running() => {
                info!(project = %ctx.project(), attempt, "All services running");
                return Ok(snapshot);
            }
            Ok(snapshot) => {
                debug!(project = %ctx.project(), attempt, pending = ?snapshot.pending(), "Services not running yet");
                last = Some(snapshot);
            }
            Err(err) if err.category() == ErrorCategory::Timeout => {
                warn!(project = %ctx.project(), attempt, "Status check timed out");
            }
            Err(err) => return Err(err),
        }

        if attempt == max_attempts {
            break;
        }
        tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(cancelled(ctx)),
            _ = tokio::time::sleep(delay) => {}
        }
        delay = (delay * 2).min(settings.poll_max_interval());
    }

    let pending = last
        .map(|s| s.pending().join(", "))
        .unwrap_or_else(|| "no status could be read".to_string());
    Err(OrchestratorError::backend(
        backend.style(),
        format!(
            "Startup timed out after {} status checks; not running: {}",
            max_attempts, pending
        ),
    )
    .with_resource(ctx.project()))
}

fn cancelled(ctx: &RunContext) -> OrchestratorError {
    OrchestratorError::cancelled("Start cancelled while waiting for services").with_resource(ctx.project())
}

/// Run one command with the run's environment and the configured timeout
pub(crate) async fn run(
    executor: &dyn CommandExecutor,
    settings: &OrchestratorSettings,
    ctx: &RunContext,
    argv: Vec<String>,
) -> Result<CommandResult> {
    let request = CommandRequest::new(argv, settings.command_timeout()).env(&ctx.environment);
    executor.execute(&request).await
}

/// Fail unless `service` appears in `snapshot`
pub(crate) fn require_service(style: BackendStyle, snapshot: &ServiceStatusSnapshot, service: &str) -> Result<()> {
    if snapshot.contains(service) {
        return Ok(());
    }
    let known: Vec<&str> = snapshot.services.keys().map(String::as_str).collect();
    Err(OrchestratorError::backend(
        style,
        format!(
            "Unknown service '{}' in project {} (known: [{}])",
            service,
            snapshot.project,
            known.join(", ")
        ),
    )
    .with_resource(service))
}

/// Create the shared external network, tolerating one that already exists
pub(crate) async fn ensure_network(
    executor: &dyn CommandExecutor,
    settings: &OrchestratorSettings,
    ctx: &RunContext,
    style: BackendStyle,
) -> Result<()> {
    let Some(network) = settings.network.as_deref() else {
        return Ok(());
    };

    let mut argv = vec![
        settings.docker_binary.clone(),
        "network".to_string(),
        "create".to_string(),
        "--driver".to_string(),
    ];
    match style {
        BackendStyle::Compose => argv.push("bridge".to_string()),
        BackendStyle::Swarm => {
            argv.push("overlay".to_string());
            argv.push("--attachable".to_string());
        }
    }
    argv.push(network.to_string());

    let result = run(executor, settings, ctx, argv).await?;
    if result.success() {
        info!(network, style = %style, "Created network");
        Ok(())
    } else if result.output_contains("already exists") {
        debug!(network, "Network already exists");
        Ok(())
    } else {
        Err(OrchestratorError::command_failed(style, "create network", result).with_resource(network))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::scripted::{Reply, ScriptedExecutor};
    use crate::status::InstanceState;
    use std::time::Duration;

    struct FakeBackend {
        settings: OrchestratorSettings,
        snapshots: std::sync::Mutex<Vec<Result<ServiceStatusSnapshot>>>,
    }

    #[async_trait]
    impl Backend for FakeBackend {
        fn style(&self) -> BackendStyle {
            BackendStyle::Compose
        }

        fn settings(&self) -> &OrchestratorSettings {
            &self.settings
        }

        async fn prepare_network(&self, _ctx: &RunContext) -> Result<()> {
            Ok(())
        }

        async fn deploy(&self, _ctx: &RunContext, _artifact: RenderedArtifact) -> Result<()> {
            Ok(())
        }

        async fn status(&self, ctx: &RunContext) -> Result<ServiceStatusSnapshot> {
            let mut queue = self.snapshots.lock().unwrap();
            if queue.is_empty() {
                return Ok(ServiceStatusSnapshot::aggregate(ctx.project(), &ctx.expected, Vec::new()));
            }
            queue.remove(0)
        }

        async fn logs(&self, _ctx: &RunContext, _service: &str, _tail: u32) -> Result<String> {
            Ok(String::new())
        }

        async fn down(&self, _ctx: &RunContext) -> Result<()> {
            Ok(())
        }
    }

    fn settings(attempts: u32) -> OrchestratorSettings {
        OrchestratorSettings {
            poll_interval_ms: 1,
            poll_max_interval_ms: 2,
            poll_max_attempts: attempts,
            ..Default::default()
        }
    }

    fn context() -> RunContext {
        let config = RunConfiguration::builder(0).build().unwrap();
        RunContext::new(&config, BTreeMap::from([("robomaker".to_string(), 1)]))
    }

    fn running(ctx: &RunContext) -> ServiceStatusSnapshot {
        ServiceStatusSnapshot::aggregate(
            ctx.project(),
            &ctx.expected,
            vec![("robomaker".to_string(), InstanceState::Running)],
        )
    }

    fn timed_out() -> OrchestratorError {
        OrchestratorError::timeout(CommandResult {
            argv: vec!["docker".into()],
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            elapsed: Duration::from_secs(1),
        })
    }

    #[tokio::test]
    async fn test_wait_tolerates_status_timeouts() {
        let ctx = context();
        let backend = FakeBackend {
            settings: settings(5),
            snapshots: std::sync::Mutex::new(vec![Err(timed_out()), Ok(running(&ctx))]),
        };

        let snapshot = wait_until_running(&backend, &ctx).await.unwrap();
        assert!(snapshot.all_running());
    }

    #[tokio::test]
    async fn test_wait_gives_up_after_max_attempts() {
        let ctx = context();
        let backend = FakeBackend {
            settings: settings(3),
            snapshots: std::sync::Mutex::new(Vec::new()),
        };

        let err = wait_until_running(&backend, &ctx).await.unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Compose);
        assert!(err.to_string().contains("after 3 status checks"));
        assert!(err.to_string().contains("robomaker (missing 0/1)"));
    }

    #[tokio::test]
    async fn test_wait_observes_cancellation() {
        let ctx = context();
        ctx.cancel.cancel();
        let backend = FakeBackend {
            settings: settings(3),
            snapshots: std::sync::Mutex::new(Vec::new()),
        };

        let err = wait_until_running(&backend, &ctx).await.unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Cancelled);
    }

    #[tokio::test]
    async fn test_non_timeout_status_error_is_fatal() {
        let ctx = context();
        let backend = FakeBackend {
            settings: settings(5),
            snapshots: std::sync::Mutex::new(vec![Err(OrchestratorError::backend(BackendStyle::Compose, "bad output"))]),
        };

        let err = wait_until_running(&backend, &ctx).await.unwrap_err();
        assert!(err.to_string().contains("bad output"));
    }

    #[tokio::test]
    async fn test_existing_network_is_tolerated() {
        let executor = ScriptedExecutor::new().on(
            &["network", "create"],
            Reply::fail(1, "Error response from daemon: network with name sagemaker-local already exists"),
        );
        let settings = OrchestratorSettings::default();
        let ctx = context();

        ensure_network(&executor, &settings, &ctx, BackendStyle::Swarm).await.unwrap();
        assert_eq!(
            executor.calls()[0],
            vec!["docker", "network", "create", "--driver", "overlay", "--attachable", "sagemaker-local"]
        );
    }

    #[tokio::test]
    async fn test_network_disabled() {
        let executor = ScriptedExecutor::new();
        let settings = OrchestratorSettings {
            network: None,
            ..Default::default()
        };

        ensure_network(&executor, &settings, &context(), BackendStyle::Compose).await.unwrap();
        assert!(executor.calls().is_empty());
    }
}
