//! Torque/PBS backend: writes a submit script and drives `qsub`, `qstat` and `qdel`.

use std::fmt::Write as _;
use std::path::PathBuf;
use std::time::Duration;

use queue_core::{BackendToken, JobSpec, RemoteState, SubmitError};
use tracing::{debug, warn};

use crate::command::{CommandLine, CommandOutput, shell_quote};
use crate::config::{
    BackendOptions, DEFAULT_COMMAND_TIMEOUT, DriverConfig, DriverKind, non_empty, parse_bool,
    parse_list, parse_positive, parse_timeout,
};
use crate::driver::JobDriver;
use crate::error::{DriverConfigError, DriverError};

#[derive(Debug, Clone)]
struct TorqueOptions {
    qsub_cmd: String,
    qstat_cmd: String,
    qdel_cmd: String,
    qstat_options: Vec<String>,
    queue: Option<String>,
    num_nodes: u32,
    num_cpus_per_node: u32,
    memory_per_job: Option<String>,
    cluster_label: Option<String>,
    keep_qsub_output: bool,
    job_prefix: Option<String>,
    project_code: Option<String>,
    timeout: Duration,
}

impl Default for TorqueOptions {
    fn default() -> Self {
        Self {
            qsub_cmd: "qsub".into(),
            qstat_cmd: "qstat".into(),
            qdel_cmd: "qdel".into(),
            qstat_options: vec!["-x".into()],
            queue: None,
            num_nodes: 1,
            num_cpus_per_node: 1,
            memory_per_job: None,
            cluster_label: None,
            keep_qsub_output: false,
            job_prefix: None,
            project_code: None,
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }
}

impl BackendOptions for TorqueOptions {
    const KIND: DriverKind = DriverKind::Torque;

    fn set(&mut self, name: &str, value: &str) -> Result<(), DriverConfigError> {
        match name {
            "QSUB_CMD" => self.qsub_cmd = non_empty(name, value)?,
            "QSTAT_CMD" => self.qstat_cmd = non_empty(name, value)?,
            "QDEL_CMD" => self.qdel_cmd = non_empty(name, value)?,
            "QSTAT_OPTIONS" => self.qstat_options = parse_list(value),
            "QUEUE" => self.queue = Some(non_empty(name, value)?),
            "NUM_NODES" => self.num_nodes = parse_positive(name, value)?,
            "NUM_CPUS_PER_NODE" => self.num_cpus_per_node = parse_positive(name, value)?,
            "MEMORY_PER_JOB" => self.memory_per_job = Some(non_empty(name, value)?),
            "CLUSTER_LABEL" => self.cluster_label = Some(non_empty(name, value)?),
            "KEEP_QSUB_OUTPUT" => self.keep_qsub_output = parse_bool(name, value)?,
            "JOB_PREFIX" => self.job_prefix = Some(non_empty(name, value)?),
            "PROJECT_CODE" => self.project_code = Some(non_empty(name, value)?),
            "QUEUE_QUERY_TIMEOUT" => self.timeout = parse_timeout(name, value)?,
            _ => return Err(Self::unknown(name)),
        }
        Ok(())
    }
}

impl TorqueOptions {
    fn job_name(&self, spec: &JobSpec) -> String {
        match &self.job_prefix {
            Some(prefix) => format!("{prefix}{}", spec.name),
            None => spec.name.clone(),
        }
    }

    /// Processors per node, raised when the job asks for more CPUs than the default layout holds.
    fn ppn(&self, spec: &JobSpec) -> u32 {
        self.num_cpus_per_node
            .max(spec.num_cpu.div_ceil(self.num_nodes))
    }

    /// Render the PBS submit script for `spec`.
    fn script(&self, spec: &JobSpec) -> String {
        let name = self.job_name(spec);
        let mut s = String::from("#!/bin/sh\n");
        let _ = writeln!(s, "#PBS -N {name}");
        let mut nodes = format!("nodes={}:ppn={}", self.num_nodes, self.ppn(spec));
        if let Some(label) = &self.cluster_label {
            let _ = write!(nodes, ":{label}");
        }
        let _ = writeln!(s, "#PBS -l {nodes}");
        if let Some(mem) = &self.memory_per_job {
            let _ = writeln!(s, "#PBS -l mem={mem}");
        }
        if let Some(queue) = &self.queue {
            let _ = writeln!(s, "#PBS -q {queue}");
        }
        if let Some(project) = &self.project_code {
            let _ = writeln!(s, "#PBS -A {project}");
        }
        if self.keep_qsub_output {
            let _ = writeln!(s, "#PBS -o {}.stdout", spec.name);
            let _ = writeln!(s, "#PBS -e {}.stderr", spec.name);
        } else {
            s.push_str("#PBS -o /dev/null\n#PBS -e /dev/null\n");
        }
        let _ = writeln!(s, "cd {}", shell_quote(&spec.run_path.to_string_lossy()));
        let command = spec
            .command_line()
            .iter()
            .map(|a| shell_quote(a))
            .collect::<Vec<_>>()
            .join(" ");
        let _ = writeln!(s, "exec {command}");
        s
    }

    fn script_path(&self, spec: &JobSpec) -> PathBuf {
        spec.run_path.join(format!("{}.qsub.sh", self.job_name(spec)))
    }
}

/// Parse the job id `qsub` prints, e.g. `4711.pbs-server`.
pub fn parse_submit_output(stdout: &str) -> Option<String> {
    let id = stdout.lines().map(str::trim).find(|l| !l.is_empty())?;
    id.starts_with(|c: char| c.is_ascii_digit())
        .then(|| id.to_string())
}

/// Parse `qstat -f <id>` output.
pub fn parse_qstat(stdout: &str) -> RemoteState {
    let field = |key: &str| {
        stdout.lines().find_map(|line| {
            let (k, v) = line.split_once('=')?;
            (k.trim() == key).then(|| v.trim().to_string())
        })
    };
    let Some(state) = field("job_state") else {
        return RemoteState::Unknown;
    };
    let exit_code = field("Exit_status").and_then(|v| v.parse::<i32>().ok());
    match state.as_str() {
        "Q" | "H" | "W" | "T" => RemoteState::Pending,
        "R" | "E" | "S" => RemoteState::Running,
        "C" | "F" => match exit_code {
            Some(0) | None => RemoteState::Done { exit_code },
            Some(code) => RemoteState::failed(Some(code), format!("exit status {code}")),
        },
        _ => RemoteState::Unknown,
    }
}

/// Decide whether a failed `qsub` is worth another attempt.
pub fn classify_submit_failure(output: &str) -> SubmitError {
    const PERMANENT: &[&str] = &[
        "Unknown queue",
        "Illegal attribute or resource value",
        "Job exceeds queue resource limits",
        "Unauthorized Request",
        "Bad UID for job execution",
        "illegal -l value",
    ];
    let message = output.trim().to_string();
    if PERMANENT.iter().any(|p| output.contains(p)) {
        SubmitError::permanent(message)
    } else {
        SubmitError::transient(message)
    }
}

fn unknown_job(output: &CommandOutput) -> bool {
    output.combined().contains("Unknown Job Id")
}

/// Torque/PBS backend.
#[derive(Debug)]
pub struct TorqueDriver {
    options: TorqueOptions,
}

impl TorqueDriver {
    pub fn from_config(config: &DriverConfig) -> Result<Self, DriverConfigError> {
        Ok(Self {
            options: TorqueOptions::from_config(config)?,
        })
    }
}

impl JobDriver for TorqueDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Torque
    }

    async fn submit(&self, spec: &JobSpec) -> Result<BackendToken, SubmitError> {
        let options = self.options.for_job(spec)?;
        let path = options.script_path(spec);
        tokio::fs::write(&path, options.script(spec))
            .await
            .map_err(|e| {
                let message = format!("cannot write {}: {e}", path.display());
                if e.kind() == std::io::ErrorKind::NotFound {
                    SubmitError::permanent(message)
                } else {
                    SubmitError::transient(message)
                }
            })?;

        let cmd = CommandLine::new(&options.qsub_cmd).arg(path.display().to_string());
        let output = cmd
            .output(Some(&spec.run_path), options.timeout)
            .await
            .map_err(DriverError::into_submit_error)?;
        if !output.success() {
            warn!(job = %spec.name, status = ?output.status, "qsub failed");
            return Err(classify_submit_failure(&output.combined()));
        }
        parse_submit_output(&output.stdout)
            .map(BackendToken::new)
            .ok_or_else(|| {
                SubmitError::transient(format!(
                    "could not read job id from qsub output: {}",
                    output.stdout.trim()
                ))
            })
    }

    async fn poll(&self, token: &BackendToken) -> Result<RemoteState, DriverError> {
        let cmd = CommandLine::new(&self.options.qstat_cmd)
            .arg("-f")
            .args(self.options.qstat_options.iter().cloned())
            .arg(token.as_str());
        let output = cmd.output(None, self.options.timeout).await?;
        if output.success() {
            Ok(parse_qstat(&output.stdout))
        } else if unknown_job(&output) {
            debug!(job = %token, "qstat has no record of job");
            Ok(RemoteState::Unknown)
        } else {
            Err(cmd.failed(&output))
        }
    }

    async fn cancel(&self, token: &BackendToken) -> Result<(), DriverError> {
        let cmd = CommandLine::new(&self.options.qdel_cmd).arg(token.as_str());
        let output = cmd.output(None, self.options.timeout).await?;
        if output.success()
            || unknown_job(&output)
            || output.combined().contains("Request invalid for state of job")
        {
            Ok(())
        } else {
            Err(cmd.failed(&output))
        }
    }
}
