//! Docker Compose backend and compose file handling
//!
//! The file model and layered parser are shared with the Swarm backend,
//! which consumes the same format.

pub mod backend;
pub mod config;
pub mod parser;

pub use backend::ComposeBackend;
pub use config::{ComposeConfig, ServiceConfig};
pub use parser::ComposeParser;
