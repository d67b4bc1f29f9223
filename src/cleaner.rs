//! Best-effort resource cleanup
//!
//! Every step runs regardless of earlier failures. Failures become
//! `ResourceError` records in the returned [`CleanupReport`]; the cleaner
//! itself never fails.

use crate::artifact::is_artifact_for;
use crate::backend::{self, Backend, RunContext};
use crate::config::{BackendStyle, OrchestratorSettings};
use crate::error::{ErrorCategory, ErrorRecord, OrchestratorError};
use crate::exec::CommandExecutor;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Which steps a cleanup pass runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupScope {
    /// Remove the project, prune its networks and volumes, sweep artifacts
    Full,
    /// Prune and sweep; for callers that already ran `down`
    Prune,
    /// Sweep artifacts only, leaving running services in place
    ArtifactsOnly,
}

/// Why a cleanup pass runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupTrigger {
    /// Before a new run starts
    Proactive,
    /// After a failed start
    Defensive,
    /// On stop or cancellation
    Teardown,
}

impl fmt::Display for CleanupTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CleanupTrigger::Proactive => "proactive",
            CleanupTrigger::Defensive => "defensive",
            CleanupTrigger::Teardown => "teardown",
        };
        f.write_str(s)
    }
}

/// Outcome of one cleanup pass
#[derive(Debug, Clone)]
pub struct CleanupReport {
    pub project: String,
    pub scope: CleanupScope,
    pub trigger: CleanupTrigger,
    /// Artifact files deleted by the sweep
    pub removed_artifacts: Vec<PathBuf>,
    /// Non-fatal step failures
    pub errors: Vec<ErrorRecord>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Removes leftovers of previous or failed runs
pub struct ResourceCleaner {
    executor: Arc<dyn CommandExecutor>,
    settings: Arc<OrchestratorSettings>,
}

impl ResourceCleaner {
    pub fn new(executor: Arc<dyn CommandExecutor>, settings: Arc<OrchestratorSettings>) -> Self {
        Self { executor, settings }
    }

    /// Full proactive cleanup of the project's previous run
    pub async fn cleanup_previous_run(&self, backend: &dyn Backend, ctx: &RunContext) -> CleanupReport {
        self.cleanup(backend, ctx, CleanupScope::Full, CleanupTrigger::Proactive).await
    }

    pub async fn cleanup(
        &self,
        backend: &dyn Backend,
        ctx: &RunContext,
        scope: CleanupScope,
        trigger: CleanupTrigger,
    ) -> CleanupReport {
        let project = ctx.project().to_string();
        info!(project = %project, trigger = %trigger, ?scope, "Cleaning up");

        let mut report = CleanupReport {
            project: project.clone(),
            scope,
            trigger,
            removed_artifacts: Vec::new(),
            errors: Vec::new(),
        };

        if scope == CleanupScope::Full {
            if let Err(err) = backend.down(ctx).await {
                report.errors.push(as_resource_error(err, &project));
            }
        }

        if scope != CleanupScope::ArtifactsOnly {
            let label = project_label(backend.style(), &project);
            for kind in ["network", "volume"] {
                if let Some(record) = self.prune(ctx, kind, &label).await {
                    report.errors.push(record);
                }
            }
        }

        let (removed, errors) = self.sweep_artifacts(&project);
        report.removed_artifacts = removed;
        report.errors.extend(errors);

        for record in &report.errors {
            warn!(project = %project, trigger = %trigger, "Cleanup step failed: {}", record.message);
        }
        report
    }

    async fn prune(&self, ctx: &RunContext, kind: &str, label: &str) -> Option<ErrorRecord> {
        let filter = format!("label={}", label);
        let argv = vec![
            self.settings.docker_binary.clone(),
            kind.to_string(),
            "prune".to_string(),
            "-f".to_string(),
            "--filter".to_string(),
            filter,
        ];

        match backend::run(self.executor.as_ref(), &self.settings, ctx, argv).await {
            Ok(result) if result.success() => {
                debug!(kind, label, "Pruned");
                None
            }
            Ok(result) => Some(
                OrchestratorError::resource(format!("Failed to prune {}s", kind))
                    .with_result(result)
                    .with_resource(label)
                    .into_record(),
            ),
            Err(err) => Some(as_resource_error(err, label)),
        }
    }

    /// Delete every artifact file belonging to `project`
    pub fn sweep_artifacts(&self, project: &str) -> (Vec<PathBuf>, Vec<ErrorRecord>) {
        let mut removed = Vec::new();
        let mut errors = Vec::new();
        let dir = &self.settings.artifact_dir;
        if !dir.is_dir() {
            return (removed, errors);
        }

        for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    errors.push(
                        OrchestratorError::resource(format!("Failed to scan artifact directory: {}", e))
                            .with_resource(dir.display().to_string())
                            .into_record(),
                    );
                    continue;
                }
            };
            let matches = entry.file_type().is_file()
                && entry
                    .file_name()
                    .to_str()
                    .map_or(false, |name| is_artifact_for(&self.settings.artifact_prefix, project, name));
            if !matches {
                continue;
            }

            match std::fs::remove_file(entry.path()) {
                Ok(()) => {
                    debug!(path = %entry.path().display(), "Removed leftover artifact");
                    removed.push(entry.path().to_path_buf());
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => errors.push(
                    OrchestratorError::resource(format!("Failed to remove artifact: {}", e))
                        .with_resource(entry.path().display().to_string())
                        .into_record(),
                ),
            }
        }

        (removed, errors)
    }
}

/// Label that scopes networks and volumes to one project
fn project_label(style: BackendStyle, project: &str) -> String {
    match style {
        BackendStyle::Compose => format!("com.docker.compose.project={}", project),
        BackendStyle::Swarm => format!("com.docker.stack.namespace={}", project),
    }
}

fn as_resource_error(err: OrchestratorError, resource: &str) -> ErrorRecord {
    let mut record = err.into_record();
    record.category = ErrorCategory::Resource;
    if record.resource.is_none() {
        record.resource = Some(resource.to_string());
    }
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunConfiguration;
    use crate::exec::scripted::{Reply, ScriptedExecutor};
    use std::collections::BTreeMap;
    use std::fs;
    use tempfile::{tempdir, TempDir};

    fn setup(executor: ScriptedExecutor, style: BackendStyle) -> (TempDir, Arc<ScriptedExecutor>, ResourceCleaner, Box<dyn Backend>, RunContext) {
        let temp = tempdir().unwrap();
        let settings = Arc::new(OrchestratorSettings {
            artifact_dir: temp.path().to_path_buf(),
            ..Default::default()
        });
        let executor = Arc::new(executor);
        let cleaner = ResourceCleaner::new(executor.clone(), settings.clone());
        let backend = backend::select(style, executor.clone(), settings);
        let config = RunConfiguration::builder(1).style(style).build().unwrap();
        let ctx = RunContext::new(&config, BTreeMap::new());
        (temp, executor, cleaner, backend, ctx)
    }

    #[tokio::test]
    async fn test_full_cleanup_order() {
        let (_temp, executor, cleaner, backend, ctx) = setup(ScriptedExecutor::new(), BackendStyle::Compose);

        let report = cleaner.cleanup_previous_run(backend.as_ref(), &ctx).await;
        assert!(report.is_clean());
        assert_eq!(
            executor.calls(),
            vec![
                vec!["docker", "compose", "-p", "deepracer-1", "down", "--remove-orphans", "--volumes"],
                vec!["docker", "network", "prune", "-f", "--filter", "label=com.docker.compose.project=deepracer-1"],
                vec!["docker", "volume", "prune", "-f", "--filter", "label=com.docker.compose.project=deepracer-1"],
            ]
        );
    }

    #[tokio::test]
    async fn test_failures_are_collected_not_raised() {
        let (_temp, executor, cleaner, backend, ctx) = setup(
            ScriptedExecutor::new()
                .on(&["stack", "rm"], Reply::fail(1, "daemon unavailable"))
                .on(&["network", "prune"], Reply::SpawnFailure),
            BackendStyle::Swarm,
        );

        let report = cleaner
            .cleanup(backend.as_ref(), &ctx, CleanupScope::Full, CleanupTrigger::Defensive)
            .await;

        assert_eq!(report.errors.len(), 2);
        assert!(report.errors.iter().all(|e| e.category == ErrorCategory::Resource));
        assert_eq!(report.errors[0].stderr(), Some("daemon unavailable"));
        assert_eq!(executor.count_matching(&["volume", "prune", "label=com.docker.stack.namespace=deepracer-1"]), 1);
    }

    #[tokio::test]
    async fn test_artifacts_only_runs_no_commands() {
        let (temp, executor, cleaner, backend, ctx) = setup(ScriptedExecutor::new(), BackendStyle::Swarm);
        let own = temp.path().join("drfc-deepracer-1-0123abcd.yml");
        let other = temp.path().join("drfc-deepracer-10-0123abcd.yml");
        fs::write(&own, "services: {}").unwrap();
        fs::write(&other, "services: {}").unwrap();

        let report = cleaner
            .cleanup(backend.as_ref(), &ctx, CleanupScope::ArtifactsOnly, CleanupTrigger::Defensive)
            .await;

        assert!(executor.calls().is_empty());
        assert_eq!(report.removed_artifacts, vec![own.clone()]);
        assert!(!own.exists());
        assert!(other.exists());
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent() {
        let (temp, _executor, cleaner, backend, ctx) = setup(ScriptedExecutor::new(), BackendStyle::Compose);
        fs::write(temp.path().join("drfc-deepracer-1-ffffffff.yml"), "").unwrap();

        let first = cleaner.cleanup_previous_run(backend.as_ref(), &ctx).await;
        let second = cleaner.cleanup_previous_run(backend.as_ref(), &ctx).await;
        assert_eq!(first.removed_artifacts.len(), 1);
        assert!(second.removed_artifacts.is_empty());
        assert!(second.is_clean());
    }

    #[test]
    fn test_sweep_missing_directory() {
        let settings = Arc::new(OrchestratorSettings {
            artifact_dir: PathBuf::from("/nonexistent/drfc-artifacts"),
            ..Default::default()
        });
        let cleaner = ResourceCleaner::new(Arc::new(ScriptedExecutor::new()), settings);
        let (removed, errors) = cleaner.sweep_artifacts("deepracer-1");
        assert!(removed.is_empty() && errors.is_empty());
    }
}
