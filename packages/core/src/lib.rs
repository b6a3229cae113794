//! Core domain types for the job queue dispatcher.
//!
//! This crate contains the pure parts of the system:
//! - JobState and RemoteState for the status model
//! - JobSpec and JobNode for work items and their state machine
//! - QueueConfig and QueueSnapshot for queue settings and roll-ups
//! - Events for real-time updates

mod error;
mod events;
mod job;
mod node;
mod policy;
mod queue;
mod state;

pub use error::{ConfigError, SubmitError};
pub use events::JobEvent;
pub use job::{BackendToken, JobId, JobSpec};
pub use node::{AdvancePolicy, CallOutcome, FailureReason, JobNode, NodeCall, Transition};
pub use policy::{FailureClass, FailurePolicy};
pub use queue::{LongRunningPolicy, QueueConfig, QueueId, QueueSnapshot};
pub use state::{JobState, RemoteState, ReportedStatus};
