//! Job identity and the job specification handed over by the configuration layer.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::QueueId;

/// Identity of a job: the owning queue plus the enqueue sequence index.
///
/// Assigned at enqueue time and never reused within a queue instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId {
    pub queue: QueueId,
    pub index: u32,
}

impl JobId {
    pub fn new(queue: QueueId, index: u32) -> Self {
        Self { queue, index }
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.queue, self.index)
    }
}

/// Opaque handle a backend returned for one submission.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackendToken(pub String);

impl BackendToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BackendToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything a driver needs to run one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Job name, used for scheduler job names and output files.
    pub name: String,
    /// Executable to run.
    pub executable: PathBuf,
    /// Arguments passed to the executable.
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory of the job.
    pub run_path: PathBuf,
    /// Number of CPUs requested from the backend.
    #[serde(default = "default_num_cpu")]
    pub num_cpu: u32,
    /// Per-job backend options, using the driver's option names.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resources: BTreeMap<String, String>,
    /// Maximum submit attempts; falls back to the queue default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_submit: Option<u32>,
    /// Maximum runtime in seconds; falls back to the queue default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_runtime_secs: Option<u64>,
    /// Marker file (relative to `run_path`) that must exist for a finished job to count as a success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ok_file: Option<String>,
}

fn default_num_cpu() -> u32 {
    1
}

impl JobSpec {
    /// Create a spec running `executable` inside `run_path`.
    pub fn new(
        name: impl Into<String>,
        executable: impl Into<PathBuf>,
        run_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            executable: executable.into(),
            args: Vec::new(),
            run_path: run_path.into(),
            num_cpu: default_num_cpu(),
            resources: BTreeMap::new(),
            max_submit: None,
            max_runtime_secs: None,
            ok_file: None,
        }
    }

    /// Set the arguments for this job.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_num_cpu(mut self, num_cpu: u32) -> Self {
        self.num_cpu = num_cpu;
        self
    }

    /// Override one backend option for this job only.
    pub fn with_resource(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.resources.insert(key.into(), value.into());
        self
    }

    pub fn with_max_submit(mut self, max_submit: u32) -> Self {
        self.max_submit = Some(max_submit);
        self
    }

    pub fn with_max_runtime(mut self, secs: u64) -> Self {
        self.max_runtime_secs = Some(secs);
        self
    }

    pub fn with_ok_file(mut self, file: impl Into<String>) -> Self {
        self.ok_file = Some(file.into());
        self
    }

    /// The full command line as the backend will see it.
    pub fn command_line(&self) -> Vec<String> {
        std::iter::once(self.executable.to_string_lossy().into_owned())
            .chain(self.args.iter().cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_id_display_is_queue_scoped() {
        let queue = QueueId::new();
        let id = JobId::new(queue, 7);
        assert_eq!(id.to_string(), format!("{queue}/7"));
    }

    #[test]
    fn spec_defaults_from_json() {
        let spec: JobSpec = serde_json::from_str(
            r#"{"name":"real-0","executable":"/bin/forward","run_path":"/scratch/real-0"}"#,
        )
        .unwrap();
        assert_eq!(spec.num_cpu, 1);
        assert!(spec.args.is_empty());
        assert_eq!(spec.max_submit, None);
    }

    #[test]
    fn command_line_puts_executable_first() {
        let spec = JobSpec::new("job", "/bin/echo", "/tmp").with_args(["a", "b"]);
        assert_eq!(spec.command_line(), vec!["/bin/echo", "a", "b"]);
    }
}
