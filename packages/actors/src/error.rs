use drivers::DriverConfigError;
use queue_core::{ConfigError, JobId};
use thiserror::Error;

/// Errors surfaced by the queue and its actor.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("invalid queue configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("invalid driver configuration: {0}")]
    Driver(#[from] DriverConfigError),

    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("queue actor error: {0}")]
    Actor(String),
}
