//! The job queue: node collection, concurrency ceiling and the tick loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use drivers::{Driver, DriverConfig, JobDriver};
use queue_core::{
    AdvancePolicy, JobEvent, JobId, JobNode, JobSpec, JobState, NodeCall, QueueConfig, QueueId,
    QueueSnapshot, Transition,
};
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::QueueError;
use crate::pool::{CallKind, CallResult, DriverPool};
use crate::status::StatusAggregator;

/// A collection of jobs run against one driver.
///
/// The queue is owned by a single coordinating task. Driver calls run on the
/// [`DriverPool`]; every mutation of a node happens in [`JobQueue::tick_at`]
/// or in the request methods, never on a pool task.
pub struct JobQueue<D = Driver> {
    id: QueueId,
    config: QueueConfig,
    policy: AdvancePolicy,
    /// Indexed by `JobId::index`.
    nodes: Vec<JobNode>,
    /// Node-bound calls not yet applied; at most one per node.
    in_flight: HashMap<JobId, CallKind>,
    pool: DriverPool<D>,
    status: StatusAggregator,
    last_submit: Option<DateTime<Utc>>,
    done_announced: bool,
}

impl JobQueue<Driver> {
    /// Build the driver from `driver` and honour its `MAX_RUNNING` option.
    pub fn from_driver_config(
        mut config: QueueConfig,
        driver: &DriverConfig,
    ) -> Result<Self, QueueError> {
        if let Some(max_running) = driver.max_running()? {
            config.max_running = max_running;
        }
        let driver = Driver::from_config(driver)?;
        Self::new(config, driver)
    }
}

impl<D: JobDriver> JobQueue<D> {
    pub fn new(config: QueueConfig, driver: D) -> Result<Self, QueueError> {
        Self::with_shared_driver(config, Arc::new(driver))
    }

    pub fn with_shared_driver(config: QueueConfig, driver: Arc<D>) -> Result<Self, QueueError> {
        config.validate()?;
        let id = QueueId::new();
        let pool = DriverPool::new(
            driver,
            config.driver_workers,
            Duration::from_secs(config.call_timeout_secs),
        );
        info!(
            queue = %id,
            driver = %pool.driver().kind(),
            max_running = config.max_running,
            "Created job queue"
        );
        Ok(Self {
            id,
            policy: AdvancePolicy::from_config(&config),
            status: StatusAggregator::new(id, config.event_capacity),
            config,
            nodes: Vec::new(),
            in_flight: HashMap::new(),
            pool,
            last_submit: None,
            done_announced: false,
        })
    }

    pub fn id(&self) -> QueueId {
        self.id
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn driver(&self) -> &D {
        self.pool.driver()
    }

    /// Add a job; it is submitted by a later tick, in enqueue order.
    pub fn enqueue(&mut self, spec: JobSpec) -> JobId {
        let job_id = JobId::new(self.id, self.nodes.len() as u32);
        let name = spec.name.clone();
        self.nodes.push(JobNode::new(job_id, spec, &self.config));
        self.done_announced = false;
        self.status.publish(JobEvent::JobEnqueued {
            job_id,
            name,
            timestamp: Utc::now(),
        });
        self.status.refresh(&self.nodes, true);
        job_id
    }

    /// Request cancellation of every non-terminal job.
    ///
    /// Returns how many jobs were newly marked; calling it again returns 0.
    pub fn cancel_all(&mut self) -> usize {
        let marked = self
            .nodes
            .iter_mut()
            .map(JobNode::request_cancel)
            .filter(|marked| *marked)
            .count();
        if marked > 0 {
            info!(queue = %self.id, jobs = marked, "Cancelling jobs");
            self.status.publish(JobEvent::CancelRequested {
                queue_id: self.id,
                jobs: marked,
                timestamp: Utc::now(),
            });
        }
        marked
    }

    /// Request cancellation of one job; `Ok(false)` if it was already requested or finished.
    pub fn cancel_job(&mut self, job_id: JobId) -> Result<bool, QueueError> {
        let queue_id = self.id;
        let node = self
            .node_mut(job_id)
            .ok_or(QueueError::JobNotFound(job_id))?;
        if !node.request_cancel() {
            return Ok(false);
        }
        info!(job = %job_id, "Cancelling job");
        self.status.publish(JobEvent::CancelRequested {
            queue_id,
            jobs: 1,
            timestamp: Utc::now(),
        });
        Ok(true)
    }

    pub fn job(&self, job_id: JobId) -> Option<&JobNode> {
        if job_id.queue != self.id {
            return None;
        }
        self.nodes.get(job_id.index as usize)
    }

    fn node_mut(&mut self, job_id: JobId) -> Option<&mut JobNode> {
        if job_id.queue != self.id {
            return None;
        }
        self.nodes.get_mut(job_id.index as usize)
    }

    pub fn jobs(&self) -> &[JobNode] {
        &self.nodes
    }

    /// Counts computed from the current node states.
    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot::collect(&self.nodes)
    }

    /// True when every job is terminal.
    pub fn is_done(&self) -> bool {
        self.nodes.iter().all(|node| node.state().is_terminal())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.status.subscribe()
    }

    pub fn watch_snapshot(&self) -> watch::Receiver<QueueSnapshot> {
        self.status.watch()
    }

    /// Driver calls dispatched by this queue and not yet collected.
    pub fn in_flight(&self) -> usize {
        self.pool.in_flight()
    }

    /// Tick until every job is terminal and return the final counts.
    pub async fn run_until_done(&mut self) -> QueueSnapshot {
        let interval = Duration::from_millis(self.config.tick_interval_ms);
        loop {
            self.tick().await;
            if self.is_done() {
                return self.snapshot();
            }
            tokio::time::sleep(interval).await;
        }
    }

    pub async fn tick(&mut self) -> bool {
        self.tick_at(Utc::now()).await
    }

    /// One pass of the run loop, with `now` as the clock for every transition.
    ///
    /// Returns whether any node changed state.
    pub async fn tick_at(&mut self, now: DateTime<Utc>) -> bool {
        let mut changed = false;

        while let Some(result) = self.pool.try_next() {
            changed |= self.apply(result, now);
        }

        changed |= self.dispatch_cancels(now);
        self.dispatch_submits(now);
        changed |= self.dispatch_polls(now);

        let deadline = Instant::now() + Duration::from_millis(self.config.tick_timeout_ms);
        while !self.in_flight.is_empty() {
            match self.pool.next_before(deadline).await {
                Some(result) => changed |= self.apply(result, now),
                None => break,
            }
        }

        self.stop_long_running(now);

        self.status.refresh(&self.nodes, changed);
        if self.is_done() && !self.nodes.is_empty() && !self.done_announced {
            self.done_announced = true;
            let snapshot = self.status.current();
            info!(
                queue = %self.id,
                success = snapshot.success,
                failure = snapshot.failure,
                cancelled = snapshot.cancelled,
                timeout = snapshot.timeout,
                "Queue finished"
            );
            self.status.publish(JobEvent::QueueDone {
                queue_id: self.id,
                snapshot,
                timestamp: now,
            });
        }
        changed
    }

    /// Cancel marked nodes; those without a backend submission end right away.
    fn dispatch_cancels(&mut self, now: DateTime<Utc>) -> bool {
        let mut changed = false;
        for index in 0..self.nodes.len() {
            let node = &mut self.nodes[index];
            if !node.cancel_requested() || self.in_flight.contains_key(&node.id()) {
                continue;
            }
            match node.next_call() {
                Some(NodeCall::Cancel(token)) => {
                    let (job_id, attempt) = (node.id(), node.attempts());
                    self.in_flight.insert(job_id, CallKind::Cancel);
                    self.pool.cancel(job_id, attempt, token, CallKind::Cancel);
                }
                _ => {
                    if let Some(transition) = node.confirm_cancel(now) {
                        self.record(index, transition);
                        changed = true;
                    }
                }
            }
        }
        changed
    }

    /// Submit waiting nodes in enqueue order while the ceiling admits them.
    fn dispatch_submits(&mut self, now: DateTime<Utc>) {
        let mut active = self
            .nodes
            .iter()
            .filter(|node| node.state().is_active())
            .count()
            + self
                .in_flight
                .values()
                .filter(|kind| **kind == CallKind::Submit)
                .count();
        let spacing = i64::try_from(self.config.submit_sleep_ms)
            .ok()
            .and_then(TimeDelta::try_milliseconds)
            .unwrap_or(TimeDelta::MAX);

        for node in &mut self.nodes {
            if !node.wants_submit() || self.in_flight.contains_key(&node.id()) {
                continue;
            }
            if !self.config.admits(active) {
                break;
            }
            if !spacing.is_zero()
                && let Some(last) = self.last_submit
                && last.checked_add_signed(spacing).is_none_or(|next| now < next)
            {
                break;
            }
            let Some(attempt) = node.begin_submit() else {
                continue;
            };
            info!(
                job = %node.id(),
                name = %node.spec().name,
                attempt,
                max_submit = node.max_submit(),
                "Submitting job"
            );
            self.in_flight.insert(node.id(), CallKind::Submit);
            self.pool.submit(node.id(), attempt, node.spec().clone());
            self.last_submit = Some(now);
            active += 1;
            if !spacing.is_zero() {
                break;
            }
        }
    }

    /// Enforce runtime limits and poll every active node without a call in flight.
    fn dispatch_polls(&mut self, now: DateTime<Utc>) -> bool {
        let mut changed = false;
        for index in 0..self.nodes.len() {
            let node = &mut self.nodes[index];
            if !node.state().is_active() || self.in_flight.contains_key(&node.id()) {
                continue;
            }
            if let Some(transition) = node.check_timeout(now) {
                self.record(index, transition);
                changed = true;
                continue;
            }
            if let Some(NodeCall::Poll(token)) = node.next_call() {
                let ok_file = node
                    .spec()
                    .ok_file
                    .as_ref()
                    .map(|file| node.spec().run_path.join(file));
                let (job_id, attempt) = (node.id(), node.attempts());
                self.in_flight.insert(job_id, CallKind::Poll);
                self.pool.poll(job_id, attempt, token, ok_file);
            }
        }
        changed
    }

    fn apply(&mut self, result: CallResult, now: DateTime<Utc>) -> bool {
        let CallResult {
            job_id,
            attempt,
            kind,
            outcome,
        } = result;

        if kind == CallKind::Cleanup {
            debug!(job = %job_id, ?outcome, "Cleanup cancel finished");
            return false;
        }
        self.in_flight.remove(&job_id);

        let Some(index) = self.job(job_id).map(|node| node.id().index as usize) else {
            warn!(job = %job_id, "Discarding result for unknown job");
            return false;
        };
        let node = &mut self.nodes[index];
        if kind != CallKind::Cancel && attempt != node.attempts() {
            debug!(
                job = %job_id,
                attempt,
                current = node.attempts(),
                "Discarding stale result"
            );
            return false;
        }

        match node.advance(outcome, now, &self.policy) {
            Some(transition) => {
                self.record(index, transition);
                true
            }
            None => false,
        }
    }

    /// Report a transition and cancel the submission it left behind.
    fn record(&mut self, index: usize, transition: Transition) {
        let node = &self.nodes[index];
        let job_id = node.id();
        match transition.to {
            JobState::Failure => warn!(
                job = %job_id,
                from = %transition.from,
                reason = ?node.failure(),
                message = node.message().unwrap_or_default(),
                "Job failed"
            ),
            _ => info!(job = %job_id, "Job {} -> {}", transition.from, transition.to),
        }

        self.status.publish(JobEvent::status_changed(node, &transition));
        if transition.is_retry() {
            self.status.publish(JobEvent::JobRetrying {
                job_id,
                attempt: node.attempts(),
                max_submit: node.max_submit(),
                timestamp: transition.at,
            });
        }
        if let Some(token) = transition.cancel {
            self.pool
                .cancel(job_id, node.attempts(), token, CallKind::Cleanup);
        }
    }

    /// Cancel running jobs far slower than the average successful one.
    fn stop_long_running(&mut self, now: DateTime<Utc>) {
        let Some(policy) = &self.config.long_running else {
            return;
        };
        let runtimes: Vec<TimeDelta> = self
            .nodes
            .iter()
            .filter(|node| node.state() == JobState::Success)
            .filter_map(|node| node.runtime(now))
            .collect();
        if runtimes.is_empty() || runtimes.len() < policy.min_required_success {
            return;
        }
        let total: TimeDelta = runtimes.iter().copied().sum();
        let average = seconds(total) / runtimes.len() as f64;
        let limit = average * policy.factor;

        let mut stopped = 0;
        for node in &mut self.nodes {
            if node.state() != JobState::Running {
                continue;
            }
            let Some(runtime) = node.runtime(now) else {
                continue;
            };
            if seconds(runtime) > limit && node.request_cancel() {
                info!(
                    job = %node.id(),
                    runtime_secs = seconds(runtime),
                    limit_secs = limit,
                    "Stopping long running job"
                );
                stopped += 1;
            }
        }
        if stopped > 0 {
            self.status.publish(JobEvent::CancelRequested {
                queue_id: self.id,
                jobs: stopped,
                timestamp: now,
            });
        }
    }
}

fn seconds(delta: TimeDelta) -> f64 {
    delta.num_milliseconds() as f64 / 1000.0
}
