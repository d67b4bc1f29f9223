//! Docker Swarm stack backend
//!
//! A run is deployed as one stack named after the project. Replica
//! counts are applied by a `docker service scale` pass after deploy.

pub mod backend;
pub mod task;

pub use backend::SwarmBackend;
pub use task::{Task, TaskState};
