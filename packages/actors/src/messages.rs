//! Message types for actor communication.

use queue_core::{JobEvent, JobId, JobNode, JobSpec, JobState, QueueSnapshot};
use ractor::RpcReplyPort;
use tokio::sync::{broadcast, watch};

/// Messages for the QueueActor.
#[derive(Debug)]
pub enum QueueMessage {
    /// Enqueue a new job.
    Enqueue {
        spec: Box<JobSpec>,
        reply: RpcReplyPort<Result<JobId, String>>,
    },

    /// Request cancellation of every unfinished job; replies with the number newly marked.
    CancelAll { reply: RpcReplyPort<usize> },

    /// Request cancellation of one job.
    CancelJob {
        job_id: JobId,
        reply: RpcReplyPort<Result<bool, String>>,
    },

    /// Get the current per-state counts.
    GetSnapshot { reply: RpcReplyPort<QueueSnapshot> },

    /// Get a job by ID.
    GetJob {
        job_id: JobId,
        reply: RpcReplyPort<Option<JobNode>>,
    },

    /// List jobs in enqueue order.
    ListJobs {
        state_filter: Option<JobState>,
        limit: usize,
        reply: RpcReplyPort<Vec<JobNode>>,
    },

    /// Subscribe to job events.
    Subscribe {
        reply: RpcReplyPort<broadcast::Receiver<JobEvent>>,
    },

    /// Watch the snapshot; the receiver is woken only when the counts change.
    WatchSnapshot {
        reply: RpcReplyPort<watch::Receiver<QueueSnapshot>>,
    },

    /// Run one pass of the dispatch loop.
    Tick,

    /// Stop the actor. Jobs still running on the backend are left alone.
    Shutdown,
}
