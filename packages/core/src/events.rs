//! Event types for real-time updates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::node::{JobNode, Transition};
use crate::{JobId, JobState, QueueId, QueueSnapshot, ReportedStatus};

/// Events emitted by a queue for real-time updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    /// A new job was enqueued.
    JobEnqueued {
        job_id: JobId,
        name: String,
        timestamp: DateTime<Utc>,
    },
    /// A job's state changed.
    JobStatusChanged {
        job_id: JobId,
        old_state: JobState,
        new_state: JobState,
        status: ReportedStatus,
        attempt: u32,
        exit_code: Option<i32>,
        message: Option<String>,
        timestamp: DateTime<Utc>,
    },
    /// A failed attempt goes back for resubmission.
    JobRetrying {
        job_id: JobId,
        attempt: u32,
        max_submit: u32,
        timestamp: DateTime<Utc>,
    },
    /// Cancellation was requested for a number of jobs.
    CancelRequested {
        queue_id: QueueId,
        jobs: usize,
        timestamp: DateTime<Utc>,
    },
    /// Every job in the queue reached a terminal state.
    QueueDone {
        queue_id: QueueId,
        snapshot: QueueSnapshot,
        timestamp: DateTime<Utc>,
    },
}

impl JobEvent {
    /// Build the status-change event for a node that just went through `transition`.
    pub fn status_changed(node: &JobNode, transition: &Transition) -> Self {
        JobEvent::JobStatusChanged {
            job_id: node.id(),
            old_state: transition.from,
            new_state: transition.to,
            status: transition.to.reported(),
            attempt: node.attempts(),
            exit_code: node.exit_code(),
            message: node.message().map(str::to_owned),
            timestamp: transition.at,
        }
    }

    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            JobEvent::JobEnqueued { timestamp, .. } => *timestamp,
            JobEvent::JobStatusChanged { timestamp, .. } => *timestamp,
            JobEvent::JobRetrying { timestamp, .. } => *timestamp,
            JobEvent::CancelRequested { timestamp, .. } => *timestamp,
            JobEvent::QueueDone { timestamp, .. } => *timestamp,
        }
    }

    /// Get the job ID associated with this event, if any.
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            JobEvent::JobEnqueued { job_id, .. } => Some(*job_id),
            JobEvent::JobStatusChanged { job_id, .. } => Some(*job_id),
            JobEvent::JobRetrying { job_id, .. } => Some(*job_id),
            _ => None,
        }
    }

    /// Get the queue ID associated with this event.
    pub fn queue_id(&self) -> QueueId {
        match self {
            JobEvent::JobEnqueued { job_id, .. }
            | JobEvent::JobStatusChanged { job_id, .. }
            | JobEvent::JobRetrying { job_id, .. } => job_id.queue,
            JobEvent::CancelRequested { queue_id, .. } | JobEvent::QueueDone { queue_id, .. } => {
                *queue_id
            }
        }
    }

    /// Get a short description of this event for logging.
    pub fn description(&self) -> String {
        match self {
            JobEvent::JobEnqueued { job_id, name, .. } => {
                format!("Job {} ({}) enqueued", job_id, name)
            }
            JobEvent::JobStatusChanged {
                job_id,
                old_state,
                new_state,
                exit_code,
                ..
            } => match exit_code {
                Some(code) if new_state.is_terminal() => {
                    format!("Job {} {} -> {} (exit {})", job_id, old_state, new_state, code)
                }
                _ => format!("Job {} {} -> {}", job_id, old_state, new_state),
            },
            JobEvent::JobRetrying {
                job_id,
                attempt,
                max_submit,
                ..
            } => format!(
                "Job {} retrying (attempt {} of {})",
                job_id,
                attempt + 1,
                max_submit
            ),
            JobEvent::CancelRequested { queue_id, jobs, .. } => {
                format!("Queue {} cancelling {} jobs", queue_id, jobs)
            }
            JobEvent::QueueDone {
                queue_id, snapshot, ..
            } => format!(
                "Queue {} done: {} succeeded, {} failed",
                queue_id,
                snapshot.success,
                snapshot.failure + snapshot.timeout
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_are_tagged() {
        let event = JobEvent::CancelRequested {
            queue_id: QueueId::new(),
            jobs: 3,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "cancel_requested");
        assert_eq!(json["jobs"], 3);
        assert!(event.job_id().is_none());
    }

    #[test]
    fn terminal_description_includes_exit_code() {
        let job_id = JobId::new(QueueId::new(), 4);
        let event = JobEvent::JobStatusChanged {
            job_id,
            old_state: JobState::Running,
            new_state: JobState::Failure,
            status: ReportedStatus::Failure,
            attempt: 2,
            exit_code: Some(137),
            message: None,
            timestamp: Utc::now(),
        };
        assert!(event.description().ends_with("running -> failure (exit 137)"));
        assert_eq!(event.queue_id(), job_id.queue);
    }
}
