//! Error types for the orchestration core

use crate::config::BackendStyle;
use crate::exec::CommandResult;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Result type for orchestration operations
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Failure category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// The external command could not be spawned
    Execution,
    /// The external command exceeded its allotted time
    Timeout,
    /// Compose backend failure (non-zero exit or unparsable output)
    Compose,
    /// Swarm backend failure (non-zero exit or unparsable output)
    Swarm,
    /// Invalid configuration or run-lock conflict
    Config,
    /// Cleanup step failure
    Resource,
    /// Caller-requested cancellation
    Cancelled,
}

impl ErrorCategory {
    /// Category name as shown to operators
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Execution => "ExecutionError",
            ErrorCategory::Timeout => "TimeoutError",
            ErrorCategory::Compose => "ComposeError",
            ErrorCategory::Swarm => "SwarmError",
            ErrorCategory::Config => "ConfigError",
            ErrorCategory::Resource => "ResourceError",
            ErrorCategory::Cancelled => "CancelledError",
        }
    }

    /// Whether an error of this category ends the current run
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ErrorCategory::Resource)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a post-deploy scale pass that did not fully succeed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartialScale {
    /// Services whose scale call succeeded
    pub scaled: Vec<String>,
    /// Services whose scale call failed
    pub unscaled: Vec<String>,
}

/// Structured context attached to every propagated failure
#[derive(Debug, Clone)]
pub struct ErrorRecord {
    /// Failure category
    pub category: ErrorCategory,
    /// Human readable message
    pub message: String,
    /// Argument vector, when the failure happened before a result existed
    pub command: Option<Vec<String>>,
    /// Originating command result
    pub result: Option<CommandResult>,
    /// Container, service, volume or file the failure concerns
    pub resource: Option<String>,
    /// Partial scaling report (Swarm)
    pub partial: Option<PartialScale>,
    /// Errors collected while cleaning up after this failure
    pub cleanup_errors: Vec<ErrorRecord>,
}

impl ErrorRecord {
    /// Create a bare record
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
            command: None,
            result: None,
            resource: None,
            partial: None,
            cleanup_errors: Vec::new(),
        }
    }

    /// The argument vector that failed, if known
    pub fn argv(&self) -> Option<&[String]> {
        self.result
            .as_ref()
            .map(|r| r.argv.as_slice())
            .or(self.command.as_deref())
    }

    /// Captured stderr of the failing command, if any
    pub fn stderr(&self) -> Option<&str> {
        self.result
            .as_ref()
            .map(|r| r.stderr.trim())
            .filter(|s| !s.is_empty())
    }
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(argv) = self.argv() {
            write!(f, "\nCommand: {}", argv.join(" "))?;
        }
        if let Some(code) = self.result.as_ref().and_then(|r| r.exit_code) {
            write!(f, "\nExit code: {}", code)?;
        }
        if let Some(stderr) = self.stderr() {
            write!(f, "\nStderr:\n{}", stderr)?;
        }
        if let Some(resource) = &self.resource {
            write!(f, "\nResource: {}", resource)?;
        }
        if let Some(partial) = &self.partial {
            write!(f, "\nScaled: [{}]", partial.scaled.join(", "))?;
            write!(f, "\nNot scaled: [{}]", partial.unscaled.join(", "))?;
        }
        if !self.cleanup_errors.is_empty() {
            write!(f, "\nCleanup errors:")?;
            for err in &self.cleanup_errors {
                write!(f, "\n  - {}", err.message)?;
            }
        }
        Ok(())
    }
}

/// Orchestration error types
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("ExecutionError: {0}")]
    Execution(ErrorRecord),

    #[error("TimeoutError: {0}")]
    Timeout(ErrorRecord),

    #[error("ComposeError: {0}")]
    Compose(ErrorRecord),

    #[error("SwarmError: {0}")]
    Swarm(ErrorRecord),

    #[error("ConfigError: {0}")]
    Config(ErrorRecord),

    #[error("ResourceError: {0}")]
    Resource(ErrorRecord),

    #[error("CancelledError: {0}")]
    Cancelled(ErrorRecord),
}

impl OrchestratorError {
    /// Build an error of the given category
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self::from_record(ErrorRecord::new(category, message))
    }

    /// Wrap an existing record in the variant matching its category
    pub fn from_record(record: ErrorRecord) -> Self {
        match record.category {
            ErrorCategory::Execution => OrchestratorError::Execution(record),
            ErrorCategory::Timeout => OrchestratorError::Timeout(record),
            ErrorCategory::Compose => OrchestratorError::Compose(record),
            ErrorCategory::Swarm => OrchestratorError::Swarm(record),
            ErrorCategory::Config => OrchestratorError::Config(record),
            ErrorCategory::Resource => OrchestratorError::Resource(record),
            ErrorCategory::Cancelled => OrchestratorError::Cancelled(record),
        }
    }

    /// Spawn failure for `command`
    pub fn execution(command: &[String], source: &std::io::Error) -> Self {
        let program = command.first().map(String::as_str).unwrap_or("<empty>");
        let mut err = Self::new(
            ErrorCategory::Execution,
            format!("Failed to execute {}: {}", program, source),
        );
        err.record_mut().command = Some(command.to_vec());
        err
    }

    /// Command timed out; `partial` holds the output captured until the kill
    pub fn timeout(partial: CommandResult) -> Self {
        let message = format!(
            "Command timed out after {:.1}s",
            partial.elapsed.as_secs_f64()
        );
        Self::new(ErrorCategory::Timeout, message).with_result(partial)
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Config, message)
    }

    pub fn resource(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Resource, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Cancelled, message)
    }

    /// Backend failure in the category matching `style`
    pub fn backend(style: BackendStyle, message: impl Into<String>) -> Self {
        let category = match style {
            BackendStyle::Compose => ErrorCategory::Compose,
            BackendStyle::Swarm => ErrorCategory::Swarm,
        };
        Self::new(category, message)
    }

    /// Non-zero exit of a backend command
    pub fn command_failed(style: BackendStyle, action: &str, result: CommandResult) -> Self {
        let code = result
            .exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        Self::backend(
            style,
            format!("Failed to {}: command exited with {}", action, code),
        )
        .with_result(result)
    }

    pub fn with_result(mut self, result: CommandResult) -> Self {
        self.record_mut().result = Some(result);
        self
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.record_mut().resource = Some(resource.into());
        self
    }

    pub fn with_partial(mut self, partial: PartialScale) -> Self {
        self.record_mut().partial = Some(partial);
        self
    }

    /// Attach cleanup-phase errors as context
    pub fn with_cleanup_errors(mut self, errors: Vec<ErrorRecord>) -> Self {
        self.record_mut().cleanup_errors.extend(errors);
        self
    }

    pub fn category(&self) -> ErrorCategory {
        self.record().category
    }

    pub fn record(&self) -> &ErrorRecord {
        match self {
            OrchestratorError::Execution(r)
            | OrchestratorError::Timeout(r)
            | OrchestratorError::Compose(r)
            | OrchestratorError::Swarm(r)
            | OrchestratorError::Config(r)
            | OrchestratorError::Resource(r)
            | OrchestratorError::Cancelled(r) => r,
        }
    }

    pub fn record_mut(&mut self) -> &mut ErrorRecord {
        match self {
            OrchestratorError::Execution(r)
            | OrchestratorError::Timeout(r)
            | OrchestratorError::Compose(r)
            | OrchestratorError::Swarm(r)
            | OrchestratorError::Config(r)
            | OrchestratorError::Resource(r)
            | OrchestratorError::Cancelled(r) => r,
        }
    }

    pub fn into_record(self) -> ErrorRecord {
        match self {
            OrchestratorError::Execution(r)
            | OrchestratorError::Timeout(r)
            | OrchestratorError::Compose(r)
            | OrchestratorError::Swarm(r)
            | OrchestratorError::Config(r)
            | OrchestratorError::Resource(r)
            | OrchestratorError::Cancelled(r) => r,
        }
    }
}
