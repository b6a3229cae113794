//! Runs jobs as child processes of the current host.

use std::collections::HashMap;
use std::fs::File;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use queue_core::{BackendToken, JobSpec, RemoteState, SubmitError};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::{BackendOptions, DriverConfig, DriverKind};
use crate::driver::JobDriver;
use crate::error::{DriverConfigError, DriverError};

#[derive(Debug, Clone, Default)]
struct LocalOptions;

impl BackendOptions for LocalOptions {
    const KIND: DriverKind = DriverKind::Local;

    fn set(&mut self, name: &str, _value: &str) -> Result<(), DriverConfigError> {
        Err(Self::unknown(name))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum LocalStatus {
    Running,
    Exited(Option<i32>),
    Killed,
    WaitFailed(String),
}

#[derive(Debug)]
struct LocalJob {
    status: LocalStatus,
    cancel: CancellationToken,
}

type JobTable = Arc<Mutex<HashMap<String, LocalJob>>>;

/// Local-process backend.
#[derive(Debug, Default)]
pub struct LocalDriver {
    options: LocalOptions,
    next_id: AtomicU64,
    jobs: JobTable,
}

impl LocalDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &DriverConfig) -> Result<Self, DriverConfigError> {
        Ok(Self {
            options: LocalOptions::from_config(config)?,
            ..Self::default()
        })
    }

    fn spawn(&self, spec: &JobSpec) -> Result<Child, SubmitError> {
        if !spec.run_path.is_dir() {
            return Err(SubmitError::permanent(format!(
                "run path {} is not a directory",
                spec.run_path.display()
            )));
        }
        let stdout = create_log(spec, "stdout")?;
        let stderr = create_log(spec, "stderr")?;

        Command::new(&spec.executable)
            .args(&spec.args)
            .current_dir(&spec.run_path)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                let message = format!("failed to start {}: {e}", spec.executable.display());
                match e.kind() {
                    std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                        SubmitError::permanent(message)
                    }
                    _ => SubmitError::transient(message),
                }
            })
    }
}

fn create_log(spec: &JobSpec, stream: &str) -> Result<File, SubmitError> {
    let path = spec.run_path.join(format!("{}.{stream}", spec.name));
    File::create(&path).map_err(|e| {
        SubmitError::transient(format!("cannot create {}: {e}", path.display()))
    })
}

fn lock(jobs: &JobTable) -> std::sync::MutexGuard<'_, HashMap<String, LocalJob>> {
    jobs.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Wait for `child` in the background and record its fate in `jobs`.
fn spawn_process_waiter(
    mut child: Child,
    token: String,
    cancellation_token: CancellationToken,
    jobs: JobTable,
) {
    tokio::spawn(async move {
        let status = tokio::select! {
            _ = cancellation_token.cancelled() => {
                if let Err(e) = child.kill().await {
                    warn!(token = %token, "Failed to kill local job: {}", e);
                }
                LocalStatus::Killed
            }
            status = child.wait() => match status {
                Ok(exit_status) => {
                    let code = exit_status.code();
                    if code != Some(0) {
                        debug!(token = %token, exit_code = ?code, "Local job exited unsuccessfully");
                    }
                    LocalStatus::Exited(code)
                }
                Err(e) => {
                    error!(token = %token, "Error waiting for local job: {}", e);
                    LocalStatus::WaitFailed(e.to_string())
                }
            }
        };
        if let Some(job) = lock(&jobs).get_mut(&token) {
            job.status = status;
        }
    });
}

impl JobDriver for LocalDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Local
    }

    async fn submit(&self, spec: &JobSpec) -> Result<BackendToken, SubmitError> {
        self.options.for_job(spec)?;
        let child = self.spawn(spec)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = match child.id() {
            Some(pid) => format!("local-{id}-{pid}"),
            None => format!("local-{id}"),
        };

        let cancel = CancellationToken::new();
        lock(&self.jobs).insert(
            token.clone(),
            LocalJob {
                status: LocalStatus::Running,
                cancel: cancel.clone(),
            },
        );
        spawn_process_waiter(child, token.clone(), cancel, self.jobs.clone());
        debug!(token = %token, job = %spec.name, "Started local job");
        Ok(BackendToken::new(token))
    }

    /// A finished job is reported once and then forgotten.
    async fn poll(&self, token: &BackendToken) -> Result<RemoteState, DriverError> {
        let mut jobs = lock(&self.jobs);
        let Some(job) = jobs.get(token.as_str()) else {
            return Ok(RemoteState::Unknown);
        };
        let state = match &job.status {
            LocalStatus::Running => return Ok(RemoteState::Running),
            LocalStatus::Exited(Some(0)) => RemoteState::done(),
            LocalStatus::Exited(Some(code)) => {
                RemoteState::failed(Some(*code), format!("exited with code {code}"))
            }
            LocalStatus::Exited(None) => RemoteState::failed(None, "terminated by signal"),
            LocalStatus::Killed => RemoteState::failed(None, "killed"),
            LocalStatus::WaitFailed(e) => RemoteState::failed(None, e.clone()),
        };
        jobs.remove(token.as_str());
        Ok(state)
    }

    async fn cancel(&self, token: &BackendToken) -> Result<(), DriverError> {
        if let Some(job) = lock(&self.jobs).get(token.as_str())
            && job.status == LocalStatus::Running
        {
            job.cancel.cancel();
        }
        Ok(())
    }
}
