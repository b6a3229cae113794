//! Queue identity, configuration and the aggregate snapshot.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::ConfigError;
use crate::node::JobNode;
use crate::policy::FailurePolicy;
use crate::state::JobState;

/// Unique identifier for a queue instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueId(pub Ulid);

impl QueueId {
    /// Create a new unique queue ID.
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parse a queue ID from a string.
    pub fn parse(s: &str) -> Result<Self, ulid::DecodeError> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

impl Default for QueueId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for QueueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Cancel stragglers once enough jobs have succeeded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LongRunningPolicy {
    /// Number of successful jobs required before stragglers are stopped.
    pub min_required_success: usize,
    /// Jobs running longer than `factor` times the average successful runtime are cancelled.
    #[serde(default = "default_long_running_factor")]
    pub factor: f64,
}

fn default_long_running_factor() -> f64 {
    1.25
}

impl LongRunningPolicy {
    pub fn new(min_required_success: usize) -> Self {
        Self {
            min_required_success,
            factor: default_long_running_factor(),
        }
    }
}

/// Configuration for queue behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Concurrency ceiling on submitted/pending/running jobs; 0 means unlimited.
    pub max_running: u32,
    /// Default maximum submit attempts per job.
    pub max_submit: u32,
    /// Default maximum runtime per job (seconds).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_runtime_secs: Option<u64>,
    /// How long a job may report `unknown` before it is failed (seconds).
    pub unknown_grace_secs: u64,
    /// Interval between ticks of the run loop (milliseconds).
    pub tick_interval_ms: u64,
    /// How long one tick waits for driver results (milliseconds).
    pub tick_timeout_ms: u64,
    /// Upper bound on a single driver call (seconds).
    pub call_timeout_secs: u64,
    /// Size of the driver worker pool.
    pub driver_workers: usize,
    /// Minimum spacing between two submissions (milliseconds).
    pub submit_sleep_ms: u64,
    /// Capacity of the per-job event channel.
    pub event_capacity: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub long_running: Option<LongRunningPolicy>,
    pub failure_policy: FailurePolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_running: 0,
            max_submit: 2,
            max_runtime_secs: None,
            unknown_grace_secs: 120,
            tick_interval_ms: 1000,
            tick_timeout_ms: 500,
            call_timeout_secs: 60,
            driver_workers: 8,
            submit_sleep_ms: 0,
            event_capacity: 1024,
            long_running: None,
            failure_policy: FailurePolicy::default(),
        }
    }
}

impl QueueConfig {
    /// Set the concurrency ceiling (0 = unlimited).
    pub fn with_max_running(mut self, max_running: u32) -> Self {
        self.max_running = max_running;
        self
    }

    pub fn with_max_submit(mut self, max_submit: u32) -> Self {
        self.max_submit = max_submit;
        self
    }

    pub fn with_max_runtime(mut self, secs: u64) -> Self {
        self.max_runtime_secs = Some(secs);
        self
    }

    pub fn with_unknown_grace(mut self, secs: u64) -> Self {
        self.unknown_grace_secs = secs;
        self
    }

    pub fn with_tick_interval(mut self, ms: u64) -> Self {
        self.tick_interval_ms = ms;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_long_running(mut self, policy: LongRunningPolicy) -> Self {
        self.long_running = Some(policy);
        self
    }

    /// Whether one more active job fits under the ceiling.
    pub fn admits(&self, active: usize) -> bool {
        self.max_running == 0 || active < self.max_running as usize
    }

    /// Reject values the run loop cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_submit == 0 {
            return Err(ConfigError::Invalid("max_submit must be at least 1".into()));
        }
        if self.driver_workers == 0 {
            return Err(ConfigError::Invalid(
                "driver_workers must be at least 1".into(),
            ));
        }
        if self.tick_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "tick_interval_ms must be positive".into(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::Invalid(
                "event_capacity must be positive".into(),
            ));
        }
        if let Some(policy) = &self.long_running
            && !(policy.factor.is_finite() && policy.factor > 0.0)
        {
            return Err(ConfigError::Invalid(format!(
                "long running factor must be positive, got {}",
                policy.factor
            )));
        }
        Ok(())
    }

    /// Build a config from environment variables.
    ///
    /// Recognised variables (all optional):
    /// - `QUEUE_MAX_RUNNING`, `QUEUE_MAX_SUBMIT`, `QUEUE_MAX_RUNTIME_SECS`
    /// - `QUEUE_UNKNOWN_GRACE_SECS`, `QUEUE_TICK_INTERVAL_MS`, `QUEUE_TICK_TIMEOUT_MS`
    /// - `QUEUE_CALL_TIMEOUT_SECS`, `QUEUE_DRIVER_WORKERS`, `QUEUE_SUBMIT_SLEEP_MS`
    /// - `QUEUE_MIN_REQUIRED_SUCCESS` (enables stopping long running jobs),
    ///   `QUEUE_LONG_RUNNING_FACTOR`
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`QueueConfig::from_env`] with an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(v) = parse_var(&lookup, "QUEUE_MAX_RUNNING")? {
            cfg.max_running = v;
        }
        if let Some(v) = parse_var(&lookup, "QUEUE_MAX_SUBMIT")? {
            cfg.max_submit = v;
        }
        if let Some(v) = parse_var(&lookup, "QUEUE_MAX_RUNTIME_SECS")? {
            cfg.max_runtime_secs = Some(v);
        }
        if let Some(v) = parse_var(&lookup, "QUEUE_UNKNOWN_GRACE_SECS")? {
            cfg.unknown_grace_secs = v;
        }
        if let Some(v) = parse_var(&lookup, "QUEUE_TICK_INTERVAL_MS")? {
            cfg.tick_interval_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "QUEUE_TICK_TIMEOUT_MS")? {
            cfg.tick_timeout_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "QUEUE_CALL_TIMEOUT_SECS")? {
            cfg.call_timeout_secs = v;
        }
        if let Some(v) = parse_var(&lookup, "QUEUE_DRIVER_WORKERS")? {
            cfg.driver_workers = v;
        }
        if let Some(v) = parse_var(&lookup, "QUEUE_SUBMIT_SLEEP_MS")? {
            cfg.submit_sleep_ms = v;
        }
        if let Some(min) = parse_var(&lookup, "QUEUE_MIN_REQUIRED_SUCCESS")? {
            let mut policy = LongRunningPolicy::new(min);
            if let Some(factor) = parse_var(&lookup, "QUEUE_LONG_RUNNING_FACTOR")? {
                policy.factor = factor;
            }
            cfg.long_running = Some(policy);
        }

        cfg.validate()?;
        Ok(cfg)
    }
}

fn parse_var<F, T>(lookup: &F, name: &str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    let Some(raw) = lookup(name) else {
        return Ok(None);
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    trimmed
        .parse()
        .map(Some)
        .map_err(|_| ConfigError::Invalid(format!("invalid value for {name}: {raw}")))
}

/// Point-in-time counts of jobs per state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSnapshot {
    pub not_submitted: usize,
    pub submitted: usize,
    pub pending: usize,
    pub running: usize,
    pub success: usize,
    pub failure: usize,
    pub cancelled: usize,
    pub timeout: usize,
    /// Active jobs whose latest poll came back `unknown`.
    pub unknown: usize,
}

impl QueueSnapshot {
    /// Roll up the given nodes.
    pub fn collect<'a>(nodes: impl IntoIterator<Item = &'a JobNode>) -> Self {
        let mut snapshot = Self::default();
        for node in nodes {
            snapshot.record(node.state());
            if node.is_unknown() {
                snapshot.unknown += 1;
            }
        }
        snapshot
    }

    /// Count one job in `state`.
    pub fn record(&mut self, state: JobState) {
        *self.slot(state) += 1;
    }

    fn slot(&mut self, state: JobState) -> &mut usize {
        match state {
            JobState::NotSubmitted => &mut self.not_submitted,
            JobState::Submitted => &mut self.submitted,
            JobState::Pending => &mut self.pending,
            JobState::Running => &mut self.running,
            JobState::Success => &mut self.success,
            JobState::Failure => &mut self.failure,
            JobState::Cancelled => &mut self.cancelled,
            JobState::Timeout => &mut self.timeout,
        }
    }

    /// Number of jobs in `state`.
    pub fn count(&self, state: JobState) -> usize {
        match state {
            JobState::NotSubmitted => self.not_submitted,
            JobState::Submitted => self.submitted,
            JobState::Pending => self.pending,
            JobState::Running => self.running,
            JobState::Success => self.success,
            JobState::Failure => self.failure,
            JobState::Cancelled => self.cancelled,
            JobState::Timeout => self.timeout,
        }
    }

    pub fn total(&self) -> usize {
        JobState::ALL.iter().map(|s| self.count(*s)).sum()
    }

    /// Jobs holding a backend submission.
    pub fn active(&self) -> usize {
        self.submitted + self.pending + self.running
    }

    pub fn terminal(&self) -> usize {
        self.success + self.failure + self.cancelled + self.timeout
    }

    /// True once every job is terminal.
    pub fn is_done(&self) -> bool {
        self.terminal() == self.total()
    }

    /// Success rate over finished jobs as a percentage.
    pub fn success_rate(&self) -> Option<f64> {
        let total = self.terminal();
        if total == 0 {
            None
        } else {
            Some((self.success as f64 / total as f64) * 100.0)
        }
    }
}
