//! Process-backed command executor

use super::{CommandExecutor, CommandRequest, CommandResult};
use crate::error::{OrchestratorError, Result};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Grace period for draining pipes after a child has been killed
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Executes commands as child processes of the current process
#[derive(Debug, Clone, Default)]
pub struct ProcessExecutor;

impl ProcessExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandExecutor for ProcessExecutor {
    async fn execute(&self, request: &CommandRequest) -> Result<CommandResult> {
        let (program, args) = request.argv.split_first().ok_or_else(|| {
            let io = std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command");
            OrchestratorError::execution(&request.argv, &io)
        })?;

        debug!(command = %request.display(), "Executing command");
        let started = Instant::now();

        let mut command = Command::new(program);
        command
            .args(args)
            .envs(&request.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| OrchestratorError::execution(&request.argv, &e))?;

        let stdout_task = tokio::spawn(drain(child.stdout.take()));
        let stderr_task = tokio::spawn(drain(child.stderr.take()));

        let (exit_code, timed_out) = tokio::select! {
            status = child.wait() => {
                let status = status.map_err(|e| OrchestratorError::execution(&request.argv, &e))?;
                (status.code(), false)
            }
            _ = tokio::time::sleep(request.timeout) => {
                warn!(command = %request.display(), timeout = ?request.timeout, "Command timed out, killing process");
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill timed out process: {}", e);
                }
                (None, true)
            }
        };

        let stdout = collect(stdout_task, timed_out).await;
        let stderr = collect(stderr_task, timed_out).await;

        let result = CommandResult {
            argv: request.argv.clone(),
            exit_code,
            stdout,
            stderr,
            elapsed: started.elapsed(),
        };

        if timed_out {
            return Err(OrchestratorError::timeout(result));
        }

        debug!(
            command = %request.display(),
            exit_code = ?result.exit_code,
            elapsed_ms = result.elapsed.as_millis() as u64,
            "Command finished"
        );
        Ok(result)
    }
}

async fn drain<R: AsyncRead + Unpin>(reader: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut reader) = reader {
        if let Err(e) = reader.read_to_end(&mut buf).await {
            debug!("Stopped reading child output: {}", e);
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

// A killed child can leave grandchildren holding the pipe open.
async fn collect(task: JoinHandle<String>, timed_out: bool) -> String {
    if timed_out {
        match tokio::time::timeout(DRAIN_GRACE, task).await {
            Ok(joined) => joined.unwrap_or_default(),
            Err(_) => String::new(),
        }
    } else {
        task.await.unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn test_execute_success() {
        let request = CommandRequest::new(["echo", "hello"], Duration::from_secs(5));
        let result = ProcessExecutor::new().execute(&request).await.unwrap();

        assert!(result.success());
        assert!(result.stdout.contains("hello"));
        assert_eq!(result.argv, vec!["echo", "hello"]);
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_a_result() {
        let request = CommandRequest::new(["sh", "-c", "echo oops >&2; exit 3"], Duration::from_secs(5));
        let result = ProcessExecutor::new().execute(&request).await.unwrap();

        assert_eq!(result.exit_code, Some(3));
        assert!(result.stderr.contains("oops"));
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let request = CommandRequest::new(["nonexistent_command_12345"], Duration::from_secs(5));
        let err = ProcessExecutor::new().execute(&request).await.unwrap_err();

        assert_eq!(err.category(), ErrorCategory::Execution);
    }

    #[tokio::test]
    async fn test_timeout_keeps_partial_output() {
        let request = CommandRequest::new(
            ["sh", "-c", "echo started; exec sleep 10"],
            Duration::from_millis(300),
        );
        let err = ProcessExecutor::new().execute(&request).await.unwrap_err();

        assert_eq!(err.category(), ErrorCategory::Timeout);
        let result = err.record().result.as_ref().unwrap();
        assert!(result.stdout.contains("started"));
        assert!(result.elapsed < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_environment_overlay() {
        let mut env = BTreeMap::new();
        env.insert("DR_RUN_ID".to_string(), "7".to_string());
        let request = CommandRequest::new(["sh", "-c", "echo $DR_RUN_ID"], Duration::from_secs(5)).env(&env);
        let result = ProcessExecutor::new().execute(&request).await.unwrap();

        assert_eq!(result.stdout.trim(), "7");
    }

    #[tokio::test]
    async fn test_empty_command() {
        let request = CommandRequest::new(Vec::<String>::new(), Duration::from_secs(1));
        let err = ProcessExecutor::new().execute(&request).await.unwrap_err();

        assert_eq!(err.category(), ErrorCategory::Execution);
    }
}
