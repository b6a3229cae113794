//! Per-job state machine.
//!
//! A [`JobNode`] never talks to a backend itself. The queue dispatches driver
//! calls on the node's behalf and feeds the results back through
//! [`JobNode::advance`]; every transition is a function of the current state,
//! the call outcome, the attempt counter and the `now` passed in.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SubmitError;
use crate::job::{BackendToken, JobId, JobSpec};
use crate::policy::{FailureClass, FailurePolicy};
use crate::queue::QueueConfig;
use crate::state::{JobState, RemoteState, ReportedStatus};

/// Why a node ended in [`JobState::Failure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The backend rejected the submission as malformed.
    SubmitRejected,
    /// Every attempt ended in a transient submit error.
    SubmitFailed,
    /// The job failed and was not (or no longer) eligible for resubmission.
    ExecutionFailed,
    /// The backend reported `unknown` for longer than the grace period.
    Stalled,
    /// The backend requeued the job after its attempts were used up.
    Requeued,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureReason::SubmitRejected => "submit rejected",
            FailureReason::SubmitFailed => "submit attempts exhausted",
            FailureReason::ExecutionFailed => "execution failed",
            FailureReason::Stalled => "status unknown/stalled",
            FailureReason::Requeued => "requeued by backend",
        };
        f.write_str(s)
    }
}

/// Result of one driver call made for a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome {
    Submit(Result<BackendToken, SubmitError>),
    Poll(RemoteState),
    Cancel(Result<(), String>),
}

/// Driver call a node needs next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeCall {
    Submit,
    Poll(BackendToken),
    Cancel(BackendToken),
}

/// Knobs that shape transitions.
#[derive(Debug, Clone, PartialEq)]
pub struct AdvancePolicy {
    pub unknown_grace: TimeDelta,
    pub failure: FailurePolicy,
}

impl AdvancePolicy {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            unknown_grace: secs(config.unknown_grace_secs),
            failure: config.failure_policy.clone(),
        }
    }
}

impl Default for AdvancePolicy {
    fn default() -> Self {
        Self::from_config(&QueueConfig::default())
    }
}

/// Seconds as a [`TimeDelta`], saturating at [`TimeDelta::MAX`].
fn secs(value: u64) -> TimeDelta {
    i64::try_from(value)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .unwrap_or(TimeDelta::MAX)
}

/// A state change produced by a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: JobState,
    pub to: JobState,
    pub at: DateTime<Utc>,
    /// Backend submission the queue should cancel as a consequence.
    pub cancel: Option<BackendToken>,
}

impl Transition {
    /// A failed attempt that goes back for resubmission.
    pub fn is_retry(&self) -> bool {
        self.to == JobState::NotSubmitted
    }
}

/// One job tracked by a queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobNode {
    id: JobId,
    spec: JobSpec,
    state: JobState,
    token: Option<BackendToken>,
    attempts: u32,
    max_submit: u32,
    max_runtime_secs: Option<u64>,
    submitted_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    exit_code: Option<i32>,
    message: Option<String>,
    failure: Option<FailureReason>,
    unknown_since: Option<DateTime<Utc>>,
    cancel_requested: bool,
}

impl JobNode {
    /// Create a node in `NotSubmitted`, resolving per-job limits against the queue defaults.
    pub fn new(id: JobId, spec: JobSpec, defaults: &QueueConfig) -> Self {
        let max_submit = spec.max_submit.unwrap_or(defaults.max_submit).max(1);
        let max_runtime_secs = spec.max_runtime_secs.or(defaults.max_runtime_secs);
        Self {
            id,
            spec,
            state: JobState::NotSubmitted,
            token: None,
            attempts: 0,
            max_submit,
            max_runtime_secs,
            submitted_at: None,
            started_at: None,
            ended_at: None,
            exit_code: None,
            message: None,
            failure: None,
            unknown_since: None,
            cancel_requested: false,
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn spec(&self) -> &JobSpec {
        &self.spec
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn token(&self) -> Option<&BackendToken> {
        self.token.as_ref()
    }

    /// Submit attempts started so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_submit(&self) -> u32 {
        self.max_submit
    }

    pub fn submitted_at(&self) -> Option<DateTime<Utc>> {
        self.submitted_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn failure(&self) -> Option<FailureReason> {
        self.failure
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested
    }

    /// The latest poll of an active job returned `unknown`.
    pub fn is_unknown(&self) -> bool {
        self.unknown_since.is_some() && self.state.is_active()
    }

    pub fn reported_status(&self) -> ReportedStatus {
        if self.is_unknown() {
            ReportedStatus::Unknown
        } else {
            self.state.reported()
        }
    }

    pub fn has_attempts_left(&self) -> bool {
        self.attempts < self.max_submit
    }

    /// Wall time spent running, up to `now` for jobs still running.
    pub fn runtime(&self, now: DateTime<Utc>) -> Option<TimeDelta> {
        let started = self.started_at?;
        Some(self.ended_at.unwrap_or(now) - started)
    }

    /// Whether the node is waiting for a submission slot.
    pub fn wants_submit(&self) -> bool {
        self.state == JobState::NotSubmitted && !self.cancel_requested && self.has_attempts_left()
    }

    /// What the node needs from the driver, if anything.
    ///
    /// A cancel request on a node without a backend submission yields `None`;
    /// the queue settles those with [`JobNode::confirm_cancel`].
    pub fn next_call(&self) -> Option<NodeCall> {
        if self.state.is_terminal() {
            return None;
        }
        if self.cancel_requested {
            return self.token.clone().map(NodeCall::Cancel);
        }
        if self.state == JobState::NotSubmitted {
            return self.wants_submit().then_some(NodeCall::Submit);
        }
        self.token.clone().map(NodeCall::Poll)
    }

    /// Consume one attempt for a submission the queue is about to dispatch.
    ///
    /// Returns the attempt number, or `None` if the node cannot be submitted.
    pub fn begin_submit(&mut self) -> Option<u32> {
        if !self.wants_submit() {
            return None;
        }
        self.attempts += 1;
        Some(self.attempts)
    }

    /// Mark the node for cancellation; returns `true` the first time.
    pub fn request_cancel(&mut self) -> bool {
        if self.state.is_terminal() || self.cancel_requested {
            return false;
        }
        self.cancel_requested = true;
        true
    }

    /// Finish a requested cancellation of a node that holds no backend submission.
    pub fn confirm_cancel(&mut self, now: DateTime<Utc>) -> Option<Transition> {
        if !self.cancel_requested || self.state.is_terminal() {
            return None;
        }
        self.ended_at = Some(now);
        Some(self.move_to(JobState::Cancelled, now, None))
    }

    /// Force `Running` jobs past their maximum runtime into `Timeout`.
    pub fn check_timeout(&mut self, now: DateTime<Utc>) -> Option<Transition> {
        if self.state != JobState::Running {
            return None;
        }
        let limit = self.max_runtime_secs?;
        let runtime = self.runtime(now)?;
        if runtime <= secs(limit) {
            return None;
        }
        self.ended_at = Some(now);
        self.message = Some(format!("exceeded maximum runtime of {limit}s"));
        let cancel = self.token.clone();
        Some(self.move_to(JobState::Timeout, now, cancel))
    }

    /// Apply the outcome of a driver call made on behalf of this node.
    pub fn advance(
        &mut self,
        outcome: CallOutcome,
        now: DateTime<Utc>,
        policy: &AdvancePolicy,
    ) -> Option<Transition> {
        match outcome {
            CallOutcome::Submit(result) => self.on_submit(result, now),
            CallOutcome::Poll(remote) => self.on_poll(remote, now, policy),
            CallOutcome::Cancel(result) => {
                if let Err(e) = result {
                    self.message = Some(format!("cancel failed: {e}"));
                }
                self.confirm_cancel(now)
            }
        }
    }

    fn on_submit(
        &mut self,
        result: Result<BackendToken, SubmitError>,
        now: DateTime<Utc>,
    ) -> Option<Transition> {
        if self.state != JobState::NotSubmitted {
            return None;
        }
        match result {
            Ok(token) => {
                self.token = Some(token);
                self.submitted_at = Some(now);
                self.started_at = None;
                self.ended_at = None;
                self.exit_code = None;
                self.unknown_since = None;
                Some(self.move_to(JobState::Submitted, now, None))
            }
            Err(SubmitError::Transient(message)) => {
                self.message = Some(message);
                if self.has_attempts_left() {
                    None
                } else {
                    Some(self.fail(FailureReason::SubmitFailed, now, None))
                }
            }
            Err(SubmitError::Permanent(message)) => {
                self.message = Some(message);
                Some(self.fail(FailureReason::SubmitRejected, now, None))
            }
        }
    }

    fn on_poll(
        &mut self,
        remote: RemoteState,
        now: DateTime<Utc>,
        policy: &AdvancePolicy,
    ) -> Option<Transition> {
        if !self.state.is_active() {
            return None;
        }
        if !matches!(remote, RemoteState::Unknown) {
            self.unknown_since = None;
        }

        match remote {
            RemoteState::Pending => match self.state {
                JobState::Submitted => Some(self.move_to(JobState::Pending, now, None)),
                JobState::Running => self.on_requeue(now),
                _ => None,
            },
            RemoteState::Running => match self.state {
                JobState::Submitted | JobState::Pending => {
                    self.started_at = Some(now);
                    Some(self.move_to(JobState::Running, now, None))
                }
                _ => None,
            },
            RemoteState::Done {
                exit_code: Some(code),
            } if code != 0 => self.on_failed(Some(code), format!("exit code {code}"), now, policy),
            RemoteState::Done { exit_code } => {
                self.exit_code = exit_code;
                self.started_at.get_or_insert(now);
                self.ended_at = Some(now);
                Some(self.move_to(JobState::Success, now, None))
            }
            RemoteState::Failed { exit_code, message } => {
                self.on_failed(exit_code, message, now, policy)
            }
            RemoteState::Unknown => {
                let since = *self.unknown_since.get_or_insert(now);
                if now - since > policy.unknown_grace {
                    self.message = Some(format!(
                        "no status from backend since {}",
                        since.to_rfc3339()
                    ));
                    let cancel = self.token.clone();
                    Some(self.fail(FailureReason::Stalled, now, cancel))
                } else {
                    None
                }
            }
        }
    }

    fn on_failed(
        &mut self,
        exit_code: Option<i32>,
        message: String,
        now: DateTime<Utc>,
        policy: &AdvancePolicy,
    ) -> Option<Transition> {
        self.exit_code = exit_code;
        self.message = Some(message);
        let retryable = policy.failure.classify(exit_code) == FailureClass::Retryable;
        if retryable && self.has_attempts_left() && !self.cancel_requested {
            self.token = None;
            self.started_at = None;
            self.ended_at = None;
            Some(self.move_to(JobState::NotSubmitted, now, None))
        } else {
            self.started_at.get_or_insert(now);
            Some(self.fail(FailureReason::ExecutionFailed, now, None))
        }
    }

    /// The backend moved a running job back to its queue: a fresh attempt on the same token.
    fn on_requeue(&mut self, now: DateTime<Utc>) -> Option<Transition> {
        if self.has_attempts_left() {
            self.attempts += 1;
            self.started_at = None;
            Some(self.move_to(JobState::Pending, now, None))
        } else {
            let cancel = self.token.clone();
            Some(self.fail(FailureReason::Requeued, now, cancel))
        }
    }

    fn fail(
        &mut self,
        reason: FailureReason,
        now: DateTime<Utc>,
        cancel: Option<BackendToken>,
    ) -> Transition {
        self.failure = Some(reason);
        self.ended_at = Some(now);
        self.move_to(JobState::Failure, now, cancel)
    }

    fn move_to(
        &mut self,
        to: JobState,
        now: DateTime<Utc>,
        cancel: Option<BackendToken>,
    ) -> Transition {
        debug_assert!(
            self.state.can_transition_to(to),
            "illegal transition {} -> {}",
            self.state,
            to
        );
        let from = self.state;
        self.state = to;
        Transition {
            from,
            to,
            at: now,
            cancel,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::QueueId;

    fn node(max_submit: u32) -> JobNode {
        let spec = JobSpec::new("real-0", "/bin/true", "/tmp").with_max_submit(max_submit);
        JobNode::new(JobId::new(QueueId::new(), 0), spec, &QueueConfig::default())
    }

    fn at(seconds: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + seconds, 0).unwrap()
    }

    fn submitted(node: &mut JobNode, token: &str, t: i64) {
        assert!(node.begin_submit().is_some());
        let tr = node
            .advance(
                CallOutcome::Submit(Ok(BackendToken::new(token))),
                at(t),
                &AdvancePolicy::default(),
            )
            .unwrap();
        assert_eq!(tr.to, JobState::Submitted);
    }

    fn poll(node: &mut JobNode, remote: RemoteState, t: i64) -> Option<Transition> {
        node.advance(CallOutcome::Poll(remote), at(t), &AdvancePolicy::default())
    }

    #[test]
    fn happy_path_records_timestamps() {
        let mut n = node(2);
        submitted(&mut n, "101", 0);
        assert_eq!(poll(&mut n, RemoteState::Pending, 1).unwrap().to, JobState::Pending);
        assert_eq!(poll(&mut n, RemoteState::Running, 2).unwrap().to, JobState::Running);
        let tr = poll(&mut n, RemoteState::done(), 5).unwrap();
        assert_eq!(tr.to, JobState::Success);
        assert_eq!(n.exit_code(), Some(0));
        assert_eq!(n.started_at(), Some(at(2)));
        assert!(n.ended_at().unwrap() >= n.started_at().unwrap());
        assert_eq!(n.attempts(), 1);
    }

    #[test]
    fn done_without_observed_running_still_has_start() {
        let mut n = node(1);
        submitted(&mut n, "1", 0);
        poll(&mut n, RemoteState::done(), 3).unwrap();
        assert_eq!(n.started_at(), Some(at(3)));
        assert_eq!(n.ended_at(), Some(at(3)));
    }

    #[test]
    fn transient_submit_error_keeps_node_waiting() {
        let mut n = node(2);
        n.begin_submit();
        let tr = n.advance(
            CallOutcome::Submit(Err(SubmitError::transient("bsub: daemon not responding"))),
            at(0),
            &AdvancePolicy::default(),
        );
        assert!(tr.is_none());
        assert_eq!(n.state(), JobState::NotSubmitted);
        assert!(n.wants_submit());

        n.begin_submit();
        let tr = n
            .advance(
                CallOutcome::Submit(Err(SubmitError::transient("again"))),
                at(1),
                &AdvancePolicy::default(),
            )
            .unwrap();
        assert_eq!(tr.to, JobState::Failure);
        assert_eq!(n.failure(), Some(FailureReason::SubmitFailed));
        assert_eq!(n.attempts(), 2);
        assert!(n.begin_submit().is_none());
    }

    #[test]
    fn permanent_submit_error_fails_immediately() {
        let mut n = node(5);
        n.begin_submit();
        let tr = n
            .advance(
                CallOutcome::Submit(Err(SubmitError::permanent("Bad resource requirement syntax"))),
                at(0),
                &AdvancePolicy::default(),
            )
            .unwrap();
        assert_eq!(tr.to, JobState::Failure);
        assert_eq!(n.failure(), Some(FailureReason::SubmitRejected));
        assert_eq!(n.attempts(), 1);
    }

    #[test]
    fn retryable_failure_resubmits_until_budget_spent() {
        let mut n = node(3);
        for attempt in 1..=3 {
            submitted(&mut n, &format!("tok-{attempt}"), attempt.into());
            poll(&mut n, RemoteState::Running, 10);
            let tr = poll(&mut n, RemoteState::failed(Some(1), "boom"), 20).unwrap();
            if attempt < 3 {
                assert!(tr.is_retry());
                assert_eq!(n.token(), None);
            } else {
                assert_eq!(tr.to, JobState::Failure);
            }
            assert!(n.attempts() <= n.max_submit());
        }
        assert_eq!(n.state(), JobState::Failure);
        assert_eq!(n.attempts(), 3);
        assert_eq!(n.failure(), Some(FailureReason::ExecutionFailed));
        assert!(n.begin_submit().is_none());
    }

    #[test]
    fn permanent_exit_code_is_not_retried() {
        let policy = AdvancePolicy {
            failure: FailurePolicy::retry_all().with_exit_code(2, FailureClass::Permanent),
            ..AdvancePolicy::default()
        };
        let mut n = node(3);
        submitted(&mut n, "1", 0);
        let tr = n
            .advance(CallOutcome::Poll(RemoteState::done_with(2)), at(1), &policy)
            .unwrap();
        assert_eq!(tr.to, JobState::Failure);
        assert_eq!(n.exit_code(), Some(2));
    }

    #[test]
    fn unknown_is_tolerated_within_grace() {
        let policy = AdvancePolicy {
            unknown_grace: TimeDelta::seconds(30),
            ..AdvancePolicy::default()
        };
        let mut n = node(2);
        submitted(&mut n, "1", 0);
        assert!(
            n.advance(CallOutcome::Poll(RemoteState::Unknown), at(1), &policy)
                .is_none()
        );
        assert_eq!(n.reported_status(), ReportedStatus::Unknown);
        assert!(
            n.advance(CallOutcome::Poll(RemoteState::Unknown), at(31), &policy)
                .is_none()
        );
        // A real answer resets the grace window.
        n.advance(CallOutcome::Poll(RemoteState::Running), at(32), &policy);
        assert!(!n.is_unknown());
        n.advance(CallOutcome::Poll(RemoteState::Unknown), at(40), &policy);
        let tr = n
            .advance(CallOutcome::Poll(RemoteState::Unknown), at(71), &policy)
            .unwrap();
        assert_eq!(tr.to, JobState::Failure);
        assert_eq!(tr.cancel, Some(BackendToken::new("1")));
        assert_eq!(n.failure(), Some(FailureReason::Stalled));
        assert_eq!(n.exit_code(), None);
        assert_eq!(n.attempts(), 1);
    }

    #[test]
    fn timeout_only_applies_to_running_jobs() {
        let spec = JobSpec::new("slow", "/bin/sleep", "/tmp").with_max_runtime(60);
        let mut n = JobNode::new(JobId::new(QueueId::new(), 1), spec, &QueueConfig::default());
        submitted(&mut n, "77", 0);
        assert!(n.check_timeout(at(1000)).is_none());
        poll(&mut n, RemoteState::Running, 10);
        assert!(n.check_timeout(at(70)).is_none());
        let tr = n.check_timeout(at(71)).unwrap();
        assert_eq!(tr.to, JobState::Timeout);
        assert_eq!(tr.cancel, Some(BackendToken::new("77")));
        assert!(n.check_timeout(at(80)).is_none());
        // Late poll results cannot resurrect the job.
        assert!(poll(&mut n, RemoteState::done(), 81).is_none());
        assert_eq!(n.state(), JobState::Timeout);
    }

    #[test]
    fn huge_limits_saturate_instead_of_overflowing() {
        let spec = JobSpec::new("slow", "/bin/sleep", "/tmp")
            .with_max_runtime(10_000_000_000_000_000);
        let mut n = JobNode::new(JobId::new(QueueId::new(), 1), spec, &QueueConfig::default());
        submitted(&mut n, "78", 0);
        poll(&mut n, RemoteState::Running, 1);
        assert!(n.check_timeout(at(100)).is_none());
        assert_eq!(n.state(), JobState::Running);

        let config = QueueConfig::default().with_unknown_grace(u64::MAX);
        let policy = AdvancePolicy::from_config(&config);
        assert_eq!(policy.unknown_grace, TimeDelta::MAX);
    }

    #[test]
    fn requeue_from_running_starts_new_attempt() {
        let mut n = node(2);
        submitted(&mut n, "5", 0);
        poll(&mut n, RemoteState::Running, 1);
        let tr = poll(&mut n, RemoteState::Pending, 2).unwrap();
        assert_eq!(tr.to, JobState::Pending);
        assert_eq!(n.attempts(), 2);
        poll(&mut n, RemoteState::Running, 3);
        let tr = poll(&mut n, RemoteState::Pending, 4).unwrap();
        assert_eq!(tr.to, JobState::Failure);
        assert_eq!(n.failure(), Some(FailureReason::Requeued));
        assert_eq!(n.attempts(), 2);
    }

    #[test]
    fn next_call_follows_state() {
        let mut n = node(2);
        assert_eq!(n.next_call(), Some(NodeCall::Submit));
        submitted(&mut n, "42", 0);
        assert_eq!(n.next_call(), Some(NodeCall::Poll(BackendToken::new("42"))));
        n.request_cancel();
        assert_eq!(n.next_call(), Some(NodeCall::Cancel(BackendToken::new("42"))));
        let mut fresh = node(1);
        fresh.request_cancel();
        assert_eq!(fresh.next_call(), None);
    }

    #[test]
    fn cancel_request_is_idempotent() {
        let mut n = node(1);
        assert!(n.request_cancel());
        assert!(!n.request_cancel());
        assert!(!n.wants_submit());
        let tr = n.confirm_cancel(at(0)).unwrap();
        assert_eq!(tr.to, JobState::Cancelled);
        assert!(!n.request_cancel());
        assert!(n.confirm_cancel(at(1)).is_none());
    }

    #[test]
    fn cancel_outcome_confirms_even_on_error() {
        let mut n = node(1);
        submitted(&mut n, "9", 0);
        n.request_cancel();
        let tr = n
            .advance(
                CallOutcome::Cancel(Err("bkill: timed out".into())),
                at(2),
                &AdvancePolicy::default(),
            )
            .unwrap();
        assert_eq!(tr.from, JobState::Submitted);
        assert_eq!(tr.to, JobState::Cancelled);
        assert!(n.message().unwrap().contains("timed out"));
    }
}
