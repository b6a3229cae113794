//! Job lifecycle states and the transition table.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a job node inside a queue.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for a submission slot (first attempt or resubmission).
    #[default]
    NotSubmitted,
    /// Accepted by the backend, no status observed yet.
    Submitted,
    /// Queued by the backend.
    Pending,
    /// Executing on the backend.
    Running,
    /// Finished with a successful exit.
    Success,
    /// Failed permanently (attempts exhausted or non-retryable).
    Failure,
    /// Cancelled by request.
    Cancelled,
    /// Exceeded its maximum runtime and was cancelled.
    Timeout,
}

impl JobState {
    pub const ALL: [JobState; 8] = [
        JobState::NotSubmitted,
        JobState::Submitted,
        JobState::Pending,
        JobState::Running,
        JobState::Success,
        JobState::Failure,
        JobState::Cancelled,
        JobState::Timeout,
    ];

    /// Check if the job is in a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Success | JobState::Failure | JobState::Cancelled | JobState::Timeout
        )
    }

    /// Check if the job holds a backend submission that must be polled.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            JobState::Submitted | JobState::Pending | JobState::Running
        )
    }

    /// Whether `next` is a legal successor of `self`.
    ///
    /// Resubmission is expressed as a move back to `NotSubmitted` from an
    /// active state; terminal states have no successors.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        match self {
            NotSubmitted => matches!(next, Submitted | Failure | Cancelled),
            Submitted => matches!(
                next,
                Pending | Running | Success | Failure | Cancelled | NotSubmitted
            ),
            Pending => matches!(
                next,
                Running | Success | Failure | Cancelled | NotSubmitted
            ),
            Running => matches!(
                next,
                Pending | Success | Failure | Timeout | Cancelled | NotSubmitted
            ),
            Success | Failure | Cancelled | Timeout => false,
        }
    }

    /// Get a simple state string for display.
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::NotSubmitted => "not_submitted",
            JobState::Submitted => "submitted",
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Success => "success",
            JobState::Failure => "failure",
            JobState::Cancelled => "cancelled",
            JobState::Timeout => "timeout",
        }
    }

    /// Map onto the reporting vocabulary.
    pub fn reported(self) -> ReportedStatus {
        match self {
            JobState::NotSubmitted | JobState::Submitted | JobState::Pending => {
                ReportedStatus::Pending
            }
            JobState::Running => ReportedStatus::Running,
            JobState::Success => ReportedStatus::Success,
            JobState::Failure => ReportedStatus::Failure,
            JobState::Cancelled => ReportedStatus::Cancelled,
            JobState::Timeout => ReportedStatus::Timeout,
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status vocabulary consumed by the reporting layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportedStatus {
    Pending,
    Running,
    Success,
    Failure,
    Cancelled,
    Timeout,
    Unknown,
}

impl std::fmt::Display for ReportedStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ReportedStatus::Pending => "pending",
            ReportedStatus::Running => "running",
            ReportedStatus::Success => "success",
            ReportedStatus::Failure => "failure",
            ReportedStatus::Cancelled => "cancelled",
            ReportedStatus::Timeout => "timeout",
            ReportedStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Backend status normalized by a driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "remote", rename_all = "snake_case")]
pub enum RemoteState {
    Pending,
    Running,
    Done {
        exit_code: Option<i32>,
    },
    Failed {
        exit_code: Option<i32>,
        message: String,
    },
    /// The backend could not say; tolerated for a grace period.
    Unknown,
}

impl RemoteState {
    pub fn failed(exit_code: Option<i32>, message: impl Into<String>) -> Self {
        RemoteState::Failed {
            exit_code,
            message: message.into(),
        }
    }

    pub fn done() -> Self {
        RemoteState::Done { exit_code: Some(0) }
    }

    pub fn done_with(exit_code: i32) -> Self {
        RemoteState::Done {
            exit_code: Some(exit_code),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_have_no_successors() {
        for state in JobState::ALL.into_iter().filter(|s| s.is_terminal()) {
            for next in JobState::ALL {
                assert!(!state.can_transition_to(next), "{state} -> {next}");
            }
        }
    }

    #[test]
    fn cancel_reachable_from_every_live_state() {
        for state in JobState::ALL.into_iter().filter(|s| !s.is_terminal()) {
            assert!(state.can_transition_to(JobState::Cancelled));
        }
    }

    #[test]
    fn timeout_only_from_running() {
        let sources: Vec<_> = JobState::ALL
            .into_iter()
            .filter(|s| s.can_transition_to(JobState::Timeout))
            .collect();
        assert_eq!(sources, vec![JobState::Running]);
    }

    #[test]
    fn reported_vocabulary() {
        assert_eq!(JobState::Submitted.reported(), ReportedStatus::Pending);
        assert_eq!(JobState::Timeout.reported().to_string(), "timeout");
        let json = serde_json::to_string(&ReportedStatus::Unknown).unwrap();
        assert_eq!(json, "\"unknown\"");
    }
}
