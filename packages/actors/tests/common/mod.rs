#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, Once};
use std::time::Duration;

use drivers::{DriverError, DriverKind, JobDriver};
use queue_core::{BackendToken, JobSpec, QueueConfig, RemoteState, SubmitError};

static TRACING: Once = Once::new();

pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "actors=debug".into()),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Queue config with short ticks and no surprises from the environment.
pub fn config() -> QueueConfig {
    let mut config = QueueConfig::default().with_tick_interval(10);
    config.tick_timeout_ms = 1000;
    config
}

pub fn spec(name: &str) -> JobSpec {
    JobSpec::new(name, "/bin/forward", std::env::temp_dir())
}

pub fn spec_in(name: &str, run_path: &Path) -> JobSpec {
    JobSpec::new(name, "/bin/forward", run_path)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Submit(String),
    Poll(String),
    Cancel(String),
}

/// In-memory backend answering from per-job scripts.
///
/// Each submission of a job gets a token `<name>#<n>`. Polls of that token
/// walk through the script for submission `n` (the last script is reused for
/// later submissions), repeating the final state once exhausted. Jobs without
/// a script run once and finish successfully.
#[derive(Clone, Default)]
pub struct ScriptedDriver {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    submit_errors: HashMap<String, VecDeque<SubmitError>>,
    scripts: HashMap<String, Vec<Vec<RemoteState>>>,
    poll_delay: Option<Duration>,
    submissions: HashMap<String, usize>,
    tokens: HashMap<String, (String, usize, usize)>,
    calls: Vec<Call>,
}

impl ScriptedDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    /// Fail the next submissions of `name` with `errors`, in order.
    pub fn fail_submits(self, name: &str, errors: impl IntoIterator<Item = SubmitError>) -> Self {
        self.inner()
            .submit_errors
            .entry(name.to_string())
            .or_default()
            .extend(errors);
        self
    }

    /// Same poll script for every submission of `name`.
    pub fn script(self, name: &str, states: Vec<RemoteState>) -> Self {
        self.scripts(name, vec![states])
    }

    /// One poll script per submission of `name`.
    pub fn scripts(self, name: &str, scripts: Vec<Vec<RemoteState>>) -> Self {
        self.inner().scripts.insert(name.to_string(), scripts);
        self
    }

    pub fn poll_delay(self, delay: Duration) -> Self {
        self.inner().poll_delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.inner().calls.clone()
    }

    /// Job names in submission order, one entry per submit call.
    pub fn submit_order(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Submit(name) => Some(name),
                _ => None,
            })
            .collect()
    }

    pub fn submits(&self, name: &str) -> usize {
        self.submit_order().iter().filter(|n| *n == name).count()
    }

    pub fn polls(&self, name: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, Call::Poll(token) if job_of(token) == name))
            .count()
    }

    pub fn cancels(&self, name: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, Call::Cancel(token) if job_of(token) == name))
            .count()
    }
}

fn job_of(token: &str) -> &str {
    token.split('#').next().unwrap_or(token)
}

impl JobDriver for ScriptedDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Local
    }

    async fn submit(&self, spec: &JobSpec) -> Result<BackendToken, SubmitError> {
        let mut inner = self.inner();
        inner.calls.push(Call::Submit(spec.name.clone()));
        if let Some(err) = inner
            .submit_errors
            .get_mut(&spec.name)
            .and_then(VecDeque::pop_front)
        {
            return Err(err);
        }
        let submission = inner.submissions.entry(spec.name.clone()).or_default();
        let index = *submission;
        *submission += 1;
        let token = format!("{}#{}", spec.name, index + 1);
        inner
            .tokens
            .insert(token.clone(), (spec.name.clone(), index, 0));
        Ok(BackendToken::new(token))
    }

    async fn poll(&self, token: &BackendToken) -> Result<RemoteState, DriverError> {
        let delay = self.inner().poll_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut inner = self.inner();
        inner.calls.push(Call::Poll(token.to_string()));
        let Some((name, index, polled)) = inner.tokens.get(token.as_str()).cloned() else {
            return Ok(RemoteState::Unknown);
        };
        let default = vec![RemoteState::Running, RemoteState::done()];
        let script = inner
            .scripts
            .get(&name)
            .and_then(|scripts| scripts.get(index).or(scripts.last()))
            .cloned()
            .unwrap_or(default);
        let state = script
            .get(polled)
            .or(script.last())
            .cloned()
            .unwrap_or(RemoteState::Unknown);
        if let Some(entry) = inner.tokens.get_mut(token.as_str()) {
            entry.2 += 1;
        }
        Ok(state)
    }

    async fn cancel(&self, token: &BackendToken) -> Result<(), DriverError> {
        self.inner().calls.push(Call::Cancel(token.to_string()));
        Ok(())
    }
}
