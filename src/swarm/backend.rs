//! Docker Swarm stack backend

use super::task::Task;
use crate::artifact::RenderedArtifact;
use crate::backend::{self, Backend, RunContext};
use crate::config::{BackendStyle, OrchestratorSettings};
use crate::error::{OrchestratorError, PartialScale, Result};
use crate::exec::{CommandExecutor, CommandResult};
use crate::status::ServiceStatusSnapshot;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

const NOTHING_FOUND: &str = "nothing found in stack";

/// Runs a project as a `docker stack`
pub struct SwarmBackend {
    executor: Arc<dyn CommandExecutor>,
    settings: Arc<OrchestratorSettings>,
}

impl SwarmBackend {
    pub fn new(executor: Arc<dyn CommandExecutor>, settings: Arc<OrchestratorSettings>) -> Self {
        Self { executor, settings }
    }

    fn docker(&self, args: &[&str]) -> Vec<String> {
        let mut argv = vec![self.settings.docker_binary.clone()];
        argv.extend(args.iter().map(|a| a.to_string()));
        argv
    }

    /// Fully qualified service name inside the stack
    fn service_name(project: &str, service: &str) -> String {
        format!("{}_{}", project, service)
    }

    async fn run(&self, ctx: &RunContext, argv: Vec<String>) -> Result<CommandResult> {
        backend::run(self.executor.as_ref(), &self.settings, ctx, argv).await
    }
}

#[async_trait]
impl Backend for SwarmBackend {
    fn style(&self) -> BackendStyle {
        BackendStyle::Swarm
    }

    fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    async fn prepare_network(&self, ctx: &RunContext) -> Result<()> {
        backend::ensure_network(self.executor.as_ref(), &self.settings, ctx, BackendStyle::Swarm).await
    }

    async fn deploy(&self, ctx: &RunContext, artifact: RenderedArtifact) -> Result<()> {
        let file = artifact.path().display().to_string();
        let mut args = vec!["stack", "deploy", "--prune"];
        if self.settings.swarm_detach {
            args.push("--detach=true");
        }
        args.extend(["-c", file.as_str(), ctx.project()]);

        info!(project = %ctx.project(), "Deploying stack");
        let result = self.run(ctx, self.docker(&args)).await;
        let released = artifact.release();

        let result = result?;
        if !result.success() {
            return Err(OrchestratorError::command_failed(BackendStyle::Swarm, "deploy stack", result)
                .with_resource(ctx.project()));
        }
        released
    }

    fn scales_after_deploy(&self) -> bool {
        true
    }

    /// One `service scale` per service, in name order
    ///
    /// Failed calls do not stop the pass. When any fails, the error lists
    /// which services were scaled and which were not; nothing is undone.
    async fn scale(&self, ctx: &RunContext) -> Result<()> {
        let mut partial = PartialScale::default();
        let mut first_failure: Option<OrchestratorError> = None;

        for (service, replicas) in &ctx.expected {
            let target = format!("{}={}", Self::service_name(ctx.project(), service), replicas);
            let outcome = match self.run(ctx, self.docker(&["service", "scale", "--detach", &target])).await {
                Ok(result) if result.success() => Ok(()),
                Ok(result) => Err(OrchestratorError::command_failed(BackendStyle::Swarm, "scale service", result)),
                Err(err) => Err(err),
            };

            match outcome {
                Ok(()) => {
                    debug!(project = %ctx.project(), service = %service, replicas, "Scaled service");
                    partial.scaled.push(service.clone());
                }
                Err(err) => {
                    warn!(project = %ctx.project(), service = %service, error = %err, "Failed to scale service");
                    partial.unscaled.push(service.clone());
                    first_failure.get_or_insert(err);
                }
            }
        }

        let Some(failure) = first_failure else {
            return Ok(());
        };

        let message = format!(
            "Stack deployed but {} of {} services could not be scaled",
            partial.unscaled.len(),
            ctx.expected.len()
        );
        let mut err = OrchestratorError::backend(BackendStyle::Swarm, message)
            .with_resource(ctx.project())
            .with_partial(partial);
        if let Some(result) = failure.into_record().result {
            err = err.with_result(result);
        }
        Err(err)
    }

    async fn status(&self, ctx: &RunContext) -> Result<ServiceStatusSnapshot> {
        let argv = self.docker(&[
            "stack",
            "ps",
            ctx.project(),
            "--format",
            "{{json .}}",
            "--filter",
            "desired-state=running",
        ]);
        let result = self.run(ctx, argv).await?;

        let tasks: Vec<Task> = if result.success() {
            let parsed: std::result::Result<Vec<Task>, _> = result
                .stdout
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(serde_json::from_str)
                .collect();
            match parsed {
                Ok(tasks) => tasks,
                Err(e) => {
                    return Err(OrchestratorError::backend(
                        BackendStyle::Swarm,
                        format!("Unparsable task listing: {}", e),
                    )
                    .with_result(result))
                }
            }
        } else if result.output_contains(NOTHING_FOUND) {
            Vec::new()
        } else {
            return Err(OrchestratorError::command_failed(BackendStyle::Swarm, "list tasks", result));
        };

        for task in tasks.iter().filter(|t| !t.error.is_empty()) {
            debug!(task = %task.name, error = %task.error, "Task reported an error");
        }
        Ok(ServiceStatusSnapshot::aggregate(
            ctx.project(),
            &ctx.expected,
            tasks
                .iter()
                .map(|t| (t.service_name(ctx.project()), t.instance_state())),
        ))
    }

    async fn logs(&self, ctx: &RunContext, service: &str, tail: u32) -> Result<String> {
        let snapshot = self.status(ctx).await?;
        backend::require_service(BackendStyle::Swarm, &snapshot, service)?;

        let tail = tail.to_string();
        let qualified = Self::service_name(ctx.project(), service);
        let argv = self.docker(&["service", "logs", "--no-task-ids", "--tail", &tail, &qualified]);
        let result = self.run(ctx, argv).await?;
        if !result.success() {
            return Err(OrchestratorError::command_failed(BackendStyle::Swarm, "fetch logs", result)
                .with_resource(service));
        }
        Ok(format!("{}{}", result.stdout, result.stderr))
    }

    async fn down(&self, ctx: &RunContext) -> Result<()> {
        let result = self.run(ctx, self.docker(&["stack", "rm", ctx.project()])).await?;

        if result.success() {
            info!(project = %ctx.project(), "Stack removed");
            Ok(())
        } else if result.output_contains(NOTHING_FOUND) {
            debug!(project = %ctx.project(), "Stack already removed");
            Ok(())
        } else {
            Err(OrchestratorError::command_failed(BackendStyle::Swarm, "remove stack", result)
                .with_resource(ctx.project()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ArtifactRenderer;
    use crate::config::RunConfiguration;
    use crate::error::ErrorCategory;
    use crate::exec::scripted::{Reply, ScriptedExecutor};
    use crate::status::ServiceState;
    use std::collections::BTreeMap;
    use std::fs;
    use tempfile::{tempdir, TempDir};

    fn setup(executor: ScriptedExecutor) -> (TempDir, Arc<ScriptedExecutor>, SwarmBackend, RunContext, RunConfiguration) {
        let temp = tempdir().unwrap();
        let base = temp.path().join("base.yml");
        fs::write(
            &base,
            "services:\n  rl_coach:\n    image: rlcoach\n  robomaker:\n    image: robomaker\n",
        )
        .unwrap();

        let settings = Arc::new(OrchestratorSettings {
            artifact_dir: temp.path().join("artifacts"),
            ..Default::default()
        });
        let executor = Arc::new(executor);
        let backend = SwarmBackend::new(executor.clone(), settings);
        let config = RunConfiguration::builder(0)
            .style(BackendStyle::Swarm)
            .workers(2)
            .base_config(&base)
            .build()
            .unwrap();
        let expected = BTreeMap::from([("rl_coach".to_string(), 1), ("robomaker".to_string(), 2)]);
        let ctx = RunContext::new(&config, expected);
        (temp, executor, backend, ctx, config)
    }

    #[tokio::test]
    async fn test_deploy_command() {
        let (_temp, executor, backend, ctx, config) = setup(ScriptedExecutor::new());

        let artifact = ArtifactRenderer::new(backend.settings()).render(&config).unwrap();
        let file = artifact.path().display().to_string();
        backend.deploy(&ctx, artifact).await.unwrap();

        assert!(!std::path::Path::new(&file).exists());
        assert_eq!(
            executor.calls()[0],
            vec!["docker", "stack", "deploy", "--prune", "--detach=true", "-c", file.as_str(), "deepracer-0"]
        );
    }

    #[tokio::test]
    async fn test_scale_in_name_order() {
        let (_temp, executor, backend, ctx, _config) = setup(ScriptedExecutor::new());

        backend.scale(&ctx).await.unwrap();
        assert_eq!(
            executor.calls(),
            vec![
                vec!["docker", "service", "scale", "--detach", "deepracer-0_rl_coach=1"],
                vec!["docker", "service", "scale", "--detach", "deepracer-0_robomaker=2"],
            ]
        );
    }

    #[tokio::test]
    async fn test_partial_scale_names_unscaled_services() {
        let (_temp, executor, backend, ctx, _config) = setup(
            ScriptedExecutor::new().on(&["scale", "deepracer-0_robomaker=2"], Reply::fail(1, "service not found")),
        );

        let err = backend.scale(&ctx).await.unwrap_err();
        let partial = err.record().partial.clone().unwrap();

        assert_eq!(err.category(), ErrorCategory::Swarm);
        assert_eq!(partial.scaled, vec!["rl_coach"]);
        assert_eq!(partial.unscaled, vec!["robomaker"]);
        assert_eq!(err.record().stderr(), Some("service not found"));
        assert_eq!(executor.count_matching(&["stack", "rm"]), 0);
    }

    #[tokio::test]
    async fn test_status_from_tasks() {
        let ps = [
            r#"{"Name":"deepracer-0_robomaker.1","CurrentState":"Running 3 seconds ago","Error":""}"#,
            r#"{"Name":"deepracer-0_robomaker.2","CurrentState":"Preparing 3 seconds ago","Error":""}"#,
            r#"{"Name":"deepracer-0_rl_coach.1","CurrentState":"Running 9 seconds ago","Error":""}"#,
        ]
        .join("\n");
        let (_temp, _executor, backend, ctx, _config) = setup(ScriptedExecutor::new().on(&["stack", "ps"], Reply::ok(ps)));

        let snapshot = backend.status(&ctx).await.unwrap();
        assert_eq!(snapshot.get("rl_coach").unwrap().state, ServiceState::Running);
        let robomaker = snapshot.get("robomaker").unwrap();
        assert_eq!(robomaker.state, ServiceState::Starting);
        assert_eq!((robomaker.running, robomaker.expected), (1, 2));
    }

    #[tokio::test]
    async fn test_status_of_absent_stack() {
        let (_temp, _executor, backend, ctx, _config) = setup(
            ScriptedExecutor::new().on(&["stack", "ps"], Reply::fail(1, "nothing found in stack: deepracer-0")),
        );

        let snapshot = backend.status(&ctx).await.unwrap();
        assert!(snapshot.is_empty());
    }

    #[tokio::test]
    async fn test_logs_use_qualified_service() {
        let ps = r#"{"Name":"deepracer-0_robomaker.1","CurrentState":"Running","Error":""}"#;
        let (_temp, executor, backend, ctx, _config) = setup(
            ScriptedExecutor::new()
                .on(&["stack", "ps"], Reply::ok(ps))
                .on(&["service", "logs"], Reply::ok("step 10\n")),
        );

        assert_eq!(backend.logs(&ctx, "robomaker", 100).await.unwrap(), "step 10\n");
        assert_eq!(
            executor.calls().last().unwrap(),
            &vec!["docker", "service", "logs", "--no-task-ids", "--tail", "100", "deepracer-0_robomaker"]
        );

        let err = backend.logs(&ctx, "minio", 100).await.unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Swarm);
        assert_eq!(executor.count_matching(&["service", "logs"]), 1);
    }

    #[tokio::test]
    async fn test_down_tolerates_missing_stack() {
        let (_temp, _executor, backend, ctx, _config) = setup(
            ScriptedExecutor::new().on(&["stack", "rm"], Reply::fail(1, "Nothing found in stack: deepracer-0")),
        );
        backend.down(&ctx).await.unwrap();
    }
}
