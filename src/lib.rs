//! drfc-orchestrator - container orchestration core for DeepRacer training stacks
//!
//! Runs a training stack on either Docker Compose or Docker Swarm through
//! one lifecycle contract:
//!
//! - Layered compose file merging and per-run artifact rendering
//! - Start, stop, status and logs over both backends
//! - Best-effort cleanup before a run and after any failure
//! - A typed error taxonomy carrying command context and stderr

pub mod artifact;
pub mod backend;
pub mod cleaner;
pub mod compose;
pub mod config;
pub mod error;
pub mod exec;
pub mod orchestrator;
pub mod status;
pub mod swarm;

pub use config::{BackendStyle, OrchestratorSettings, RunConfiguration};
pub use error::{ErrorCategory, OrchestratorError, Result};
pub use orchestrator::{Orchestrator, RunRegistry, RunState};
pub use status::{ServiceState, ServiceStatusSnapshot};
