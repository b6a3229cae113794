//! Dispatch side of the job queue.
//!
//! - [`JobQueue`] - job nodes, concurrency ceiling and the tick loop
//! - [`DriverPool`] - bounded pool running driver calls off the coordinating task
//! - [`StatusAggregator`] - snapshot watch and per-job event stream
//! - [`QueueActor`] - ractor actor owning one queue and ticking it periodically
//!
//! # Usage
//!
//! ```ignore
//! use actors::{JobQueue, start_queue};
//! use drivers::DriverConfig;
//! use queue_core::{JobSpec, QueueConfig};
//!
//! let queue = JobQueue::from_driver_config(QueueConfig::from_env()?, &DriverConfig::from_env()?)?;
//! let (handle, _join) = start_queue(queue).await?;
//! handle.enqueue(JobSpec::new("real-0", "/bin/forward", "/scratch/real-0")).await?;
//! let snapshot = handle.wait_until_done().await?;
//! ```

mod error;
mod handle;
mod messages;
mod pool;
mod queue;
mod queue_actor;
mod status;

pub use error::QueueError;
pub use handle::{QueueHandle, start_queue};
pub use messages::QueueMessage;
pub use pool::{CallKind, CallResult, DriverPool};
pub use queue::JobQueue;
pub use queue_actor::{QueueActor, QueueActorState};
pub use status::StatusAggregator;

/// Re-export ractor types for convenience.
pub use ractor::{Actor, ActorRef, RpcReplyPort, concurrency};
