//! Bounded pool executing driver calls off the coordinating task.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use drivers::JobDriver;
use queue_core::{BackendToken, CallOutcome, JobId, JobSpec, RemoteState, SubmitError};
use tokio::sync::Semaphore;
use tokio::task::{Id, JoinError, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// What a dispatched call does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Submit,
    Poll,
    Cancel,
    /// Cancel of a submission whose node already reached a terminal state.
    Cleanup,
}

/// Outcome of one call, tagged with the job and attempt it was made for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallResult {
    pub job_id: JobId,
    pub attempt: u32,
    pub kind: CallKind,
    pub outcome: CallOutcome,
}

#[derive(Debug, Clone, Copy)]
struct CallTag {
    job_id: JobId,
    attempt: u32,
    kind: CallKind,
}

/// Worker pool for driver calls.
///
/// Calls never block the dispatcher; each runs on its own task, at most
/// `workers` of them talk to the backend at once, and each is bounded by
/// `call_timeout`.
pub struct DriverPool<D> {
    driver: Arc<D>,
    semaphore: Arc<Semaphore>,
    tasks: JoinSet<CallResult>,
    tags: HashMap<Id, CallTag>,
    call_timeout: Duration,
}

impl<D: JobDriver> DriverPool<D> {
    pub fn new(driver: Arc<D>, workers: usize, call_timeout: Duration) -> Self {
        Self {
            driver,
            semaphore: Arc::new(Semaphore::new(workers.max(1))),
            tasks: JoinSet::new(),
            tags: HashMap::new(),
            call_timeout,
        }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Calls dispatched and not yet collected.
    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    pub fn submit(&mut self, job_id: JobId, attempt: u32, spec: JobSpec) {
        let driver = self.driver.clone();
        let limit = self.call_timeout;
        self.spawn(job_id, attempt, CallKind::Submit, async move {
            let result = match tokio::time::timeout(limit, driver.submit(&spec)).await {
                Ok(result) => result,
                Err(_) => Err(SubmitError::transient(format!(
                    "submit timed out after {limit:?}"
                ))),
            };
            CallOutcome::Submit(result)
        });
    }

    /// Poll `token`; a finished job only counts as done once `ok_file` exists.
    pub fn poll(
        &mut self,
        job_id: JobId,
        attempt: u32,
        token: BackendToken,
        ok_file: Option<PathBuf>,
    ) {
        let driver = self.driver.clone();
        let limit = self.call_timeout;
        self.spawn(job_id, attempt, CallKind::Poll, async move {
            let state = match tokio::time::timeout(limit, driver.poll(&token)).await {
                Ok(Ok(state)) => state,
                Ok(Err(e)) => {
                    warn!(job = %job_id, token = %token, "Status query failed: {}", e);
                    RemoteState::Unknown
                }
                Err(_) => {
                    warn!(job = %job_id, token = %token, "Status query timed out");
                    RemoteState::Unknown
                }
            };
            CallOutcome::Poll(check_ok_file(state, ok_file).await)
        });
    }

    /// Cancel `token`; `kind` is [`CallKind::Cancel`] or [`CallKind::Cleanup`].
    pub fn cancel(&mut self, job_id: JobId, attempt: u32, token: BackendToken, kind: CallKind) {
        let driver = self.driver.clone();
        let limit = self.call_timeout;
        self.spawn(job_id, attempt, kind, async move {
            let result = match tokio::time::timeout(limit, driver.cancel(&token)).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err(format!("cancel timed out after {limit:?}")),
            };
            CallOutcome::Cancel(result)
        });
    }

    fn spawn<F>(&mut self, job_id: JobId, attempt: u32, kind: CallKind, call: F)
    where
        F: Future<Output = CallOutcome> + Send + 'static,
    {
        let semaphore = self.semaphore.clone();
        let handle = self.tasks.spawn(async move {
            // The semaphore is never closed.
            let _permit = semaphore.acquire_owned().await.ok();
            CallResult {
                job_id,
                attempt,
                kind,
                outcome: call.await,
            }
        });
        debug!(job = %job_id, attempt, ?kind, "Dispatched driver call");
        self.tags.insert(
            handle.id(),
            CallTag {
                job_id,
                attempt,
                kind,
            },
        );
    }

    /// A result that is already available, without waiting.
    pub fn try_next(&mut self) -> Option<CallResult> {
        loop {
            let joined = self.tasks.try_join_next_with_id()?;
            if let Some(result) = self.collect(joined) {
                return Some(result);
            }
        }
    }

    /// Wait for the next result until `deadline`.
    pub async fn next_before(&mut self, deadline: Instant) -> Option<CallResult> {
        while !self.tasks.is_empty() {
            let joined = tokio::time::timeout_at(deadline, self.tasks.join_next_with_id())
                .await
                .ok()??;
            if let Some(result) = self.collect(joined) {
                return Some(result);
            }
        }
        None
    }

    fn collect(&mut self, joined: Result<(Id, CallResult), JoinError>) -> Option<CallResult> {
        match joined {
            Ok((id, result)) => {
                self.tags.remove(&id);
                Some(result)
            }
            Err(e) => {
                error!("Driver call task failed: {}", e);
                let tag = self.tags.remove(&e.id())?;
                Some(lost_call(tag, &e))
            }
        }
    }
}

/// Result standing in for a call whose task panicked or was aborted.
fn lost_call(tag: CallTag, error: &JoinError) -> CallResult {
    let outcome = match tag.kind {
        CallKind::Submit => CallOutcome::Submit(Err(SubmitError::transient(format!(
            "submit call failed: {error}"
        )))),
        CallKind::Poll => CallOutcome::Poll(RemoteState::Unknown),
        CallKind::Cancel | CallKind::Cleanup => {
            CallOutcome::Cancel(Err(format!("cancel call failed: {error}")))
        }
    };
    CallResult {
        job_id: tag.job_id,
        attempt: tag.attempt,
        kind: tag.kind,
        outcome,
    }
}

async fn check_ok_file(state: RemoteState, ok_file: Option<PathBuf>) -> RemoteState {
    let (RemoteState::Done { exit_code }, Some(path)) = (&state, ok_file) else {
        return state;
    };
    let exit_code = *exit_code;
    if exit_code.is_some_and(|code| code != 0) {
        return state;
    }
    match tokio::fs::try_exists(&path).await {
        Ok(true) => state,
        _ => RemoteState::failed(
            exit_code,
            format!("finished without creating {}", path.display()),
        ),
    }
}
