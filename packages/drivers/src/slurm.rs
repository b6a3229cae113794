//! Slurm backend driven through `sbatch`, `squeue`, `scontrol` and `scancel`.

use std::time::Duration;

use queue_core::{BackendToken, JobSpec, RemoteState, SubmitError};
use tracing::{debug, warn};

use crate::command::{CommandLine, CommandOutput, shell_quote};
use crate::config::{
    BackendOptions, DEFAULT_COMMAND_TIMEOUT, DriverConfig, DriverKind, non_empty, parse_list,
    parse_timeout, parse_value,
};
use crate::driver::JobDriver;
use crate::error::{DriverConfigError, DriverError};

#[derive(Debug, Clone)]
struct SlurmOptions {
    sbatch: String,
    squeue: String,
    scontrol: String,
    scancel: String,
    partition: Option<String>,
    memory: Option<String>,
    memory_per_cpu: Option<String>,
    exclude_hosts: Vec<String>,
    include_hosts: Vec<String>,
    max_runtime_secs: Option<u64>,
    project_code: Option<String>,
    timeout: Duration,
}

impl Default for SlurmOptions {
    fn default() -> Self {
        Self {
            sbatch: "sbatch".into(),
            squeue: "squeue".into(),
            scontrol: "scontrol".into(),
            scancel: "scancel".into(),
            partition: None,
            memory: None,
            memory_per_cpu: None,
            exclude_hosts: Vec::new(),
            include_hosts: Vec::new(),
            max_runtime_secs: None,
            project_code: None,
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }
}

impl BackendOptions for SlurmOptions {
    const KIND: DriverKind = DriverKind::Slurm;

    fn set(&mut self, name: &str, value: &str) -> Result<(), DriverConfigError> {
        match name {
            "SBATCH" => self.sbatch = non_empty(name, value)?,
            "SQUEUE" => self.squeue = non_empty(name, value)?,
            "SCONTROL" => self.scontrol = non_empty(name, value)?,
            "SCANCEL" => self.scancel = non_empty(name, value)?,
            "PARTITION" => self.partition = Some(non_empty(name, value)?),
            "MEMORY" => self.memory = Some(memory(name, value)?),
            "MEMORY_PER_CPU" => self.memory_per_cpu = Some(memory(name, value)?),
            "EXCLUDE_HOST" => self.exclude_hosts.extend(parse_list(value)),
            "INCLUDE_HOST" => self.include_hosts.extend(parse_list(value)),
            "MAX_RUNTIME" => match parse_value::<u64>(name, value)? {
                0 => self.max_runtime_secs = None,
                secs => self.max_runtime_secs = Some(secs),
            },
            "PROJECT_CODE" => self.project_code = Some(non_empty(name, value)?),
            "SQUEUE_TIMEOUT" => self.timeout = parse_timeout(name, value)?,
            _ => return Err(Self::unknown(name)),
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), DriverConfigError> {
        if let (Some(mem), Some(_)) = (&self.memory, &self.memory_per_cpu) {
            return Err(DriverConfigError::invalid(
                "MEMORY",
                mem,
                "MEMORY and MEMORY_PER_CPU are mutually exclusive",
            ));
        }
        Ok(())
    }
}

/// Memory amounts as sbatch accepts them: digits with an optional K/M/G/T suffix.
fn memory(name: &str, value: &str) -> Result<String, DriverConfigError> {
    let value = value.trim();
    let digits = value.trim_end_matches(['K', 'M', 'G', 'T', 'k', 'm', 'g', 't']);
    let suffix_len = value.len() - digits.len();
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) || suffix_len > 1 {
        return Err(DriverConfigError::invalid(
            name,
            value,
            "expected an amount like 4000M or 16G",
        ));
    }
    Ok(value.to_string())
}

/// Format seconds as a Slurm time limit (`[D-]HH:MM:SS`).
pub fn format_time_limit(secs: u64) -> String {
    let (days, rest) = (secs / 86_400, secs % 86_400);
    let (h, m, s) = (rest / 3600, (rest % 3600) / 60, rest % 60);
    if days > 0 {
        format!("{days}-{h:02}:{m:02}:{s:02}")
    } else {
        format!("{h:02}:{m:02}:{s:02}")
    }
}

impl SlurmOptions {
    fn sbatch(&self, spec: &JobSpec) -> CommandLine {
        let mut args = vec![
            "--parsable".to_string(),
            format!("--job-name={}", spec.name),
            format!("--chdir={}", spec.run_path.display()),
            format!("--output={}.stdout", spec.name),
            format!("--error={}.stderr", spec.name),
            format!("--ntasks={}", spec.num_cpu),
        ];
        if let Some(partition) = &self.partition {
            args.push(format!("--partition={partition}"));
        }
        if let Some(mem) = &self.memory {
            args.push(format!("--mem={mem}"));
        }
        if let Some(mem) = &self.memory_per_cpu {
            args.push(format!("--mem-per-cpu={mem}"));
        }
        if !self.exclude_hosts.is_empty() {
            args.push(format!("--exclude={}", self.exclude_hosts.join(",")));
        }
        if !self.include_hosts.is_empty() {
            args.push(format!("--nodelist={}", self.include_hosts.join(",")));
        }
        if let Some(secs) = self.max_runtime_secs {
            args.push(format!("--time={}", format_time_limit(secs)));
        }
        if let Some(account) = &self.project_code {
            args.push(format!("--account={account}"));
        }
        let wrapped = spec
            .command_line()
            .iter()
            .map(|a| shell_quote(a))
            .collect::<Vec<_>>()
            .join(" ");
        args.push("--wrap".to_string());
        args.push(wrapped);
        CommandLine::new(&self.sbatch).args(args)
    }
}

/// Parse `sbatch --parsable` output: `<jobid>` or `<jobid>;<cluster>`.
pub fn parse_submit_output(stdout: &str) -> Option<String> {
    let line = stdout.lines().map(str::trim).find(|l| !l.is_empty())?;
    let id = line.split(';').next()?.trim();
    (!id.is_empty() && id.chars().all(|c| c.is_ascii_digit() || c == '_')).then(|| id.to_string())
}

/// Map a Slurm job state name onto the remote state vocabulary.
pub fn map_state(state: &str, exit_code: Option<i32>) -> RemoteState {
    // scontrol may append flags, e.g. "CANCELLED by 1000".
    let state = state.split_whitespace().next().unwrap_or_default();
    match state {
        "PENDING" | "CONFIGURING" | "REQUEUED" | "REQUEUE_HOLD" | "REQUEUE_FED"
        | "RESV_DEL_HOLD" => RemoteState::Pending,
        "RUNNING" | "COMPLETING" | "SUSPENDED" | "STOPPED" | "SIGNALING" | "STAGE_OUT"
        | "RESIZING" => RemoteState::Running,
        "COMPLETED" => match exit_code {
            Some(code) if code != 0 => {
                RemoteState::failed(Some(code), format!("exit code {code}"))
            }
            _ => RemoteState::done(),
        },
        "FAILED" | "CANCELLED" | "TIMEOUT" | "NODE_FAIL" | "OUT_OF_MEMORY" | "PREEMPTED"
        | "BOOT_FAIL" | "DEADLINE" | "REVOKED" => {
            RemoteState::failed(exit_code, format!("Slurm job {}", state.to_lowercase()))
        }
        _ => RemoteState::Unknown,
    }
}

/// Parse `squeue -h -o "%i %T"` output for `id`.
pub fn parse_squeue(stdout: &str, id: &str) -> Option<RemoteState> {
    stdout.lines().find_map(|line| {
        let (job, state) = line.trim().split_once(char::is_whitespace)?;
        (job == id).then(|| map_state(state.trim(), None))
    })
}

/// Parse `scontrol show job <id>` output (`JobState=...`, `ExitCode=<code>:<signal>`).
pub fn parse_scontrol(stdout: &str) -> RemoteState {
    let field = |key: &str| {
        stdout
            .split_whitespace()
            .find_map(|kv| kv.strip_prefix(key))
            .map(str::to_string)
    };
    let Some(state) = field("JobState=") else {
        return RemoteState::Unknown;
    };
    let exit_code = field("ExitCode=").and_then(|ec| {
        let (code, signal) = ec.split_once(':').unwrap_or((ec.as_str(), "0"));
        let code: i32 = code.parse().ok()?;
        let signal: i32 = signal.parse().unwrap_or(0);
        Some(if code == 0 && signal != 0 { 128 + signal } else { code })
    });
    map_state(&state, exit_code)
}

/// Decide whether a failed `sbatch` is worth another attempt.
pub fn classify_submit_failure(output: &str) -> SubmitError {
    const PERMANENT: &[&str] = &[
        "Invalid partition name",
        "invalid partition specified",
        "Invalid account",
        "Invalid qos",
        "Invalid generic resource",
        "Requested node configuration is not available",
        "Node count specification invalid",
        "invalid --mem",
        "unrecognized option",
        "Invalid node name specified",
    ];
    let message = output.trim().to_string();
    if PERMANENT
        .iter()
        .any(|p| output.to_lowercase().contains(&p.to_lowercase()))
    {
        SubmitError::permanent(message)
    } else {
        SubmitError::transient(message)
    }
}

fn invalid_job_id(output: &CommandOutput) -> bool {
    output.combined().contains("Invalid job id specified")
}

/// Slurm backend.
#[derive(Debug)]
pub struct SlurmDriver {
    options: SlurmOptions,
}

impl SlurmDriver {
    pub fn from_config(config: &DriverConfig) -> Result<Self, DriverConfigError> {
        Ok(Self {
            options: SlurmOptions::from_config(config)?,
        })
    }

    /// Jobs leave `squeue` shortly after finishing; `scontrol` remembers them a while longer.
    async fn scontrol(&self, id: &str) -> Result<RemoteState, DriverError> {
        let cmd = CommandLine::new(&self.options.scontrol).args(["show", "job", id]);
        let output = cmd.output(None, self.options.timeout).await?;
        if output.success() {
            Ok(parse_scontrol(&output.stdout))
        } else if invalid_job_id(&output) {
            debug!(job = id, "scontrol has no record of job");
            Ok(RemoteState::Unknown)
        } else {
            Err(cmd.failed(&output))
        }
    }
}

impl JobDriver for SlurmDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Slurm
    }

    async fn submit(&self, spec: &JobSpec) -> Result<BackendToken, SubmitError> {
        let options = self.options.for_job(spec)?;
        let cmd = options.sbatch(spec);
        let output = cmd
            .output(Some(&spec.run_path), options.timeout)
            .await
            .map_err(DriverError::into_submit_error)?;
        if !output.success() {
            warn!(job = %spec.name, status = ?output.status, "sbatch failed");
            return Err(classify_submit_failure(&output.combined()));
        }
        parse_submit_output(&output.stdout)
            .map(BackendToken::new)
            .ok_or_else(|| {
                SubmitError::transient(format!(
                    "could not read job id from sbatch output: {}",
                    output.stdout.trim()
                ))
            })
    }

    async fn poll(&self, token: &BackendToken) -> Result<RemoteState, DriverError> {
        let id = token.as_str();
        let cmd = CommandLine::new(&self.options.squeue).args(["-h", "-j", id, "-o", "%i %T"]);
        let output = cmd.output(None, self.options.timeout).await?;
        if output.success() {
            if let Some(state) = parse_squeue(&output.stdout, id) {
                return Ok(state);
            }
        } else if !invalid_job_id(&output) {
            return Err(cmd.failed(&output));
        }
        self.scontrol(id).await
    }

    async fn cancel(&self, token: &BackendToken) -> Result<(), DriverError> {
        let cmd = CommandLine::new(&self.options.scancel).arg(token.as_str());
        let output = cmd.output(None, self.options.timeout).await?;
        if output.success()
            || invalid_job_id(&output)
            || output.combined().contains("already completing or completed")
        {
            Ok(())
        } else {
            Err(cmd.failed(&output))
        }
    }
}
