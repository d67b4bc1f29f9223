//! Run configuration and orchestrator settings
//!
//! [`RunConfiguration`] describes one orchestration run and is immutable
//! once built. [`OrchestratorSettings`] holds the process-level knobs
//! (timeouts, polling, artifact location, service roles).

pub mod run;
pub mod settings;

pub use run::{
    BackendStyle, RedisEndpoint, RunConfiguration, RunConfigurationBuilder, REQUIRED_ENV_KEYS,
};
pub use settings::OrchestratorSettings;
