//! External command execution
//!
//! Every interaction with the container tooling goes through the
//! [`CommandExecutor`] trait so that backends never spawn processes
//! directly.

pub mod process;
#[cfg(test)]
pub(crate) mod scripted;

use crate::error::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;

pub use process::ProcessExecutor;

/// One external command invocation
#[derive(Debug, Clone, PartialEq)]
pub struct CommandRequest {
    /// Program followed by its arguments
    pub argv: Vec<String>,
    /// Variables layered over the parent environment
    pub env: BTreeMap<String, String>,
    /// Hard limit on wall-clock time
    pub timeout: Duration,
}

impl CommandRequest {
    /// Create a request with an empty environment overlay
    pub fn new<I, S>(argv: I, timeout: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            env: BTreeMap::new(),
            timeout,
        }
    }

    /// Set the environment overlay
    pub fn env(mut self, env: &BTreeMap<String, String>) -> Self {
        self.env = env.clone();
        self
    }

    /// Command line as a single string, for logs
    pub fn display(&self) -> String {
        self.argv.join(" ")
    }
}

/// Captured outcome of a finished (or killed) process
#[derive(Debug, Clone, PartialEq)]
pub struct CommandResult {
    /// Argument vector that was executed
    pub argv: Vec<String>,
    /// Exit code; `None` when the process was terminated by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

impl CommandResult {
    /// Whether the process exited with code 0
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Case-insensitive search over stdout and stderr
    pub fn output_contains(&self, needle: &str) -> bool {
        let needle = needle.to_lowercase();
        self.stderr.to_lowercase().contains(&needle) || self.stdout.to_lowercase().contains(&needle)
    }
}

/// Runs external commands
///
/// Implementations spawn exactly one process per call and never retry.
/// A non-zero exit is returned as a [`CommandResult`]; only spawn failures
/// and timeouts are errors.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, request: &CommandRequest) -> Result<CommandResult>;
}
