//! IBM Spectrum LSF backend driven through `bsub`, `bjobs`, `bhist` and `bkill`.

use std::time::Duration;

use queue_core::{BackendToken, JobSpec, RemoteState, SubmitError};
use tracing::{debug, warn};

use crate::command::{CommandLine, CommandOutput};
use crate::config::{
    BackendOptions, DEFAULT_COMMAND_TIMEOUT, DriverConfig, DriverKind, non_empty, parse_list,
    parse_timeout,
};
use crate::driver::JobDriver;
use crate::error::{DriverConfigError, DriverError};

#[derive(Debug, Clone)]
struct LsfOptions {
    queue: Option<String>,
    resource: Option<String>,
    project_code: Option<String>,
    exclude_hosts: Vec<String>,
    bsub_cmd: String,
    bjobs_cmd: String,
    bkill_cmd: String,
    bhist_cmd: String,
    server: Option<String>,
    rsh_cmd: String,
    timeout: Duration,
}

impl Default for LsfOptions {
    fn default() -> Self {
        Self {
            queue: None,
            resource: None,
            project_code: None,
            exclude_hosts: Vec::new(),
            bsub_cmd: "bsub".into(),
            bjobs_cmd: "bjobs".into(),
            bkill_cmd: "bkill".into(),
            bhist_cmd: "bhist".into(),
            server: None,
            rsh_cmd: "ssh".into(),
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }
}

impl BackendOptions for LsfOptions {
    const KIND: DriverKind = DriverKind::Lsf;

    fn set(&mut self, name: &str, value: &str) -> Result<(), DriverConfigError> {
        match name {
            "LSF_QUEUE" => self.queue = Some(non_empty(name, value)?),
            "LSF_RESOURCE" => self.resource = Some(non_empty(name, value)?),
            "PROJECT_CODE" => self.project_code = Some(non_empty(name, value)?),
            "EXCLUDE_HOST" => self.exclude_hosts.extend(parse_list(value)),
            "BSUB_CMD" => self.bsub_cmd = non_empty(name, value)?,
            "BJOBS_CMD" => self.bjobs_cmd = non_empty(name, value)?,
            "BKILL_CMD" => self.bkill_cmd = non_empty(name, value)?,
            "BHIST_CMD" => self.bhist_cmd = non_empty(name, value)?,
            "LSF_SERVER" => self.server = Some(non_empty(name, value)?),
            "LSF_RSH_CMD" => self.rsh_cmd = non_empty(name, value)?,
            "SUBMIT_TIMEOUT" => self.timeout = parse_timeout(name, value)?,
            _ => return Err(Self::unknown(name)),
        }
        Ok(())
    }
}

impl LsfOptions {
    /// Send `line` through the remote shell when a submit server is configured.
    fn route(&self, line: CommandLine) -> CommandLine {
        match &self.server {
            Some(server) => line.via_remote_shell(&self.rsh_cmd, server),
            None => line,
        }
    }

    fn command<I, S>(&self, program: &str, args: I) -> CommandLine
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.route(CommandLine::new(program).args(args))
    }

    fn bsub(&self, spec: &JobSpec) -> CommandLine {
        let mut args = vec![
            "-o".to_string(),
            format!("{}.LSF-stdout", spec.name),
            "-e".to_string(),
            format!("{}.LSF-stderr", spec.name),
            "-J".to_string(),
            spec.name.clone(),
            "-n".to_string(),
            spec.num_cpu.to_string(),
            "-cwd".to_string(),
            spec.run_path.display().to_string(),
        ];
        if let Some(queue) = &self.queue {
            args.extend(["-q".to_string(), queue.clone()]);
        }
        if let Some(resource) = &self.resource {
            args.extend(["-R".to_string(), resource.clone()]);
        }
        if let Some(select) = exclude_hosts_select(&self.exclude_hosts) {
            args.extend(["-R".to_string(), select]);
        }
        if let Some(project) = &self.project_code {
            args.extend(["-P".to_string(), project.clone()]);
        }
        args.extend(spec.command_line());
        self.command(&self.bsub_cmd, args)
    }
}

fn exclude_hosts_select(hosts: &[String]) -> Option<String> {
    if hosts.is_empty() {
        return None;
    }
    let clauses = hosts
        .iter()
        .map(|h| format!("hname!='{h}'"))
        .collect::<Vec<_>>()
        .join(" && ");
    Some(format!("select[{clauses}]"))
}

/// Parse `Job <12345> is submitted to queue <normal>.`
pub fn parse_submit_output(stdout: &str) -> Option<String> {
    stdout.lines().find_map(|line| {
        let rest = line.trim().strip_prefix("Job <")?;
        let (id, tail) = rest.split_once('>')?;
        (tail.contains("submitted") && !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()))
            .then(|| id.to_string())
    })
}

/// Map an LSF job status code onto the remote state vocabulary.
pub fn map_stat(stat: &str, exit_code: Option<i32>) -> RemoteState {
    match stat {
        "PEND" | "PSUSP" | "WAIT" => RemoteState::Pending,
        "RUN" | "USUSP" | "SSUSP" | "PROV" => RemoteState::Running,
        "DONE" | "PDONE" => RemoteState::Done {
            exit_code: Some(exit_code.unwrap_or(0)),
        },
        "EXIT" => RemoteState::failed(
            exit_code,
            match exit_code {
                Some(code) => format!("LSF job exited with code {code}"),
                None => "LSF job exited".to_string(),
            },
        ),
        _ => RemoteState::Unknown,
    }
}

/// Parse `bjobs -noheader -o "jobid stat exit_code"` output for `id`.
///
/// Returns `None` when the job is not listed.
pub fn parse_bjobs(stdout: &str, id: &str) -> Option<RemoteState> {
    stdout.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        if fields.next()? != id {
            return None;
        }
        let stat = fields.next()?;
        let exit_code = fields.next().and_then(|f| f.parse().ok());
        Some(map_stat(stat, exit_code))
    })
}

/// Parse the event history printed by `bhist -l` for a job that left `bjobs`.
pub fn parse_bhist(stdout: &str) -> RemoteState {
    // Long output wraps lines; join them before matching.
    let text = stdout
        .lines()
        .map(str::trim)
        .collect::<Vec<_>>()
        .join("");
    if let Some(pos) = text.rfind("Exited with exit code") {
        let code = text[pos + "Exited with exit code".len()..]
            .trim_start()
            .split(|c: char| !c.is_ascii_digit())
            .next()
            .and_then(|s| s.parse().ok());
        return map_stat("EXIT", code);
    }
    if text.contains("Done successfully") || text.contains("Completed <done>") {
        return RemoteState::done();
    }
    if text.contains("Completed <exit>") || text.contains("Exited") {
        return map_stat("EXIT", None);
    }
    if text.contains("Starting") || text.contains("Dispatched") {
        return RemoteState::Running;
    }
    if text.contains("Submitted from host") {
        return RemoteState::Pending;
    }
    RemoteState::Unknown
}

/// Decide whether a failed `bsub` is worth another attempt.
pub fn classify_submit_failure(output: &str) -> SubmitError {
    const PERMANENT: &[&str] = &[
        "Bad resource requirement syntax",
        "Queue does not exist",
        "No such queue",
        "not a valid project",
        "User permission denied",
        "Request aborted by esub",
        "Bad argument",
    ];
    let message = output.trim().to_string();
    if PERMANENT.iter().any(|p| output.contains(p)) {
        SubmitError::permanent(message)
    } else {
        SubmitError::transient(message)
    }
}

fn not_found(output: &CommandOutput) -> bool {
    let text = output.combined();
    text.contains("is not found") || text.contains("No matching job found")
}

/// LSF backend.
#[derive(Debug)]
pub struct LsfDriver {
    options: LsfOptions,
}

impl LsfDriver {
    pub fn from_config(config: &DriverConfig) -> Result<Self, DriverConfigError> {
        Ok(Self {
            options: LsfOptions::from_config(config)?,
        })
    }

    async fn bhist(&self, id: &str) -> Result<RemoteState, DriverError> {
        let cmd = self.options.command(&self.options.bhist_cmd, ["-l", id]);
        let output = cmd.output(None, self.options.timeout).await?;
        if !output.success() {
            debug!(job = id, "bhist has no record of job");
            return Ok(RemoteState::Unknown);
        }
        Ok(parse_bhist(&output.stdout))
    }
}

impl JobDriver for LsfDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Lsf
    }

    async fn submit(&self, spec: &JobSpec) -> Result<BackendToken, SubmitError> {
        let options = self.options.for_job(spec)?;
        let cmd = options.bsub(spec);
        let output = cmd
            .output(Some(&spec.run_path), options.timeout)
            .await
            .map_err(DriverError::into_submit_error)?;
        if !output.success() {
            warn!(job = %spec.name, status = ?output.status, "bsub failed");
            return Err(classify_submit_failure(&output.combined()));
        }
        parse_submit_output(&output.stdout)
            .map(BackendToken::new)
            .ok_or_else(|| {
                SubmitError::transient(format!(
                    "could not read job id from bsub output: {}",
                    output.stdout.trim()
                ))
            })
    }

    async fn poll(&self, token: &BackendToken) -> Result<RemoteState, DriverError> {
        let id = token.as_str();
        let cmd = self.options.command(
            &self.options.bjobs_cmd,
            ["-a", "-noheader", "-o", "jobid stat exit_code", id],
        );
        let output = cmd.output(None, self.options.timeout).await?;
        if let Some(state) = parse_bjobs(&output.stdout, id) {
            return Ok(state);
        }
        if output.success() || not_found(&output) {
            return self.bhist(id).await;
        }
        Err(cmd.failed(&output))
    }

    async fn cancel(&self, token: &BackendToken) -> Result<(), DriverError> {
        let cmd = self.options.command(&self.options.bkill_cmd, [token.as_str()]);
        let output = cmd.output(None, self.options.timeout).await?;
        let text = output.combined();
        if output.success() || not_found(&output) || text.contains("already finished") {
            Ok(())
        } else {
            Err(cmd.failed(&output))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(pairs: &[(&str, &str)]) -> LsfOptions {
        let mut config = DriverConfig::new(DriverKind::Lsf);
        for (k, v) in pairs {
            config = config.with_option(*k, *v);
        }
        LsfOptions::from_config(&config).unwrap()
    }

    #[test]
    fn submit_output() {
        assert_eq!(
            parse_submit_output("Job <8412> is submitted to queue <normal>.\n").as_deref(),
            Some("8412")
        );
        assert_eq!(
            parse_submit_output("Job <8412> is submitted to default queue <normal>.").as_deref(),
            Some("8412")
        );
        assert_eq!(parse_submit_output("Request aborted by esub."), None);
        assert_eq!(parse_submit_output("Job <abc> is submitted"), None);
    }

    #[test]
    fn bjobs_states() {
        let out = "8411 DONE -\n8412 EXIT 3\n8413 RUN -\n8414 PEND -\n8415 UNKWN -\n";
        assert_eq!(parse_bjobs(out, "8411"), Some(RemoteState::done()));
        assert_eq!(
            parse_bjobs(out, "8412"),
            Some(RemoteState::failed(Some(3), "LSF job exited with code 3"))
        );
        assert_eq!(parse_bjobs(out, "8413"), Some(RemoteState::Running));
        assert_eq!(parse_bjobs(out, "8414"), Some(RemoteState::Pending));
        assert_eq!(parse_bjobs(out, "8415"), Some(RemoteState::Unknown));
        assert_eq!(parse_bjobs(out, "9999"), None);
        assert_eq!(map_stat("SSUSP", None), RemoteState::Running);
        assert_eq!(map_stat("PSUSP", None), RemoteState::Pending);
    }

    #[test]
    fn bhist_history() {
        let done = "Job <8411>, User <me>, Project <default>\n\
                    Thu Oct 16 10:00:00: Submitted from host <login1>;\n\
                    Thu Oct 16 10:00:05: Dispatched to <node3>;\n\
                    Thu Oct 16 10:05:00: Done successfully. The CPU time used is 2.0 seconds;";
        assert_eq!(parse_bhist(done), RemoteState::done());

        let exited = "Thu Oct 16 10:05:00: Exited with exit code 137. The CPU time used is 1 s;";
        assert!(matches!(
            parse_bhist(exited),
            RemoteState::Failed {
                exit_code: Some(137),
                ..
            }
        ));
        assert_eq!(
            parse_bhist("Thu Oct 16: Submitted from host <login1>;"),
            RemoteState::Pending
        );
        assert_eq!(parse_bhist(""), RemoteState::Unknown);
    }

    #[test]
    fn submit_failure_classes() {
        assert!(!classify_submit_failure("Bad resource requirement syntax. Job not submitted.")
            .is_transient());
        assert!(!classify_submit_failure("mr: No such queue. Job not submitted.").is_transient());
        assert!(
            classify_submit_failure("LSF is processing your request. Please wait ...")
                .is_transient()
        );
    }

    #[test]
    fn bsub_command_line() {
        let opts = options(&[
            ("LSF_QUEUE", "mr"),
            ("LSF_RESOURCE", "span[hosts=1]"),
            ("EXCLUDE_HOST", "bad1,bad2"),
            ("PROJECT_CODE", "ert"),
        ]);
        let spec = JobSpec::new("real-3", "/bin/forward", "/scratch/real-3")
            .with_args(["--iens", "3"])
            .with_num_cpu(4);
        let cmd = opts.bsub(&spec);
        assert_eq!(cmd.program(), "bsub");
        let args = cmd.arguments().join(" ");
        assert!(args.contains("-J real-3 -n 4 -cwd /scratch/real-3"));
        assert!(args.contains("-q mr"));
        assert!(args.contains("-R span[hosts=1]"));
        assert!(args.contains("-R select[hname!='bad1' && hname!='bad2']"));
        assert!(args.contains("-P ert"));
        assert!(args.ends_with("/bin/forward --iens 3"));
    }

    #[test]
    fn remote_submission_uses_rsh() {
        let opts = options(&[("LSF_SERVER", "lsf-login"), ("LSF_RSH_CMD", "/usr/bin/rsh")]);
        let cmd = opts.bsub(&JobSpec::new("j", "/bin/true", "/tmp"));
        assert_eq!(cmd.program(), "/usr/bin/rsh");
        assert_eq!(cmd.arguments()[0], "lsf-login");
        assert!(cmd.arguments()[1].starts_with("bsub -o j.LSF-stdout"));
    }

    #[test]
    fn job_override_rejects_foreign_option() {
        let opts = options(&[]);
        let spec = JobSpec::new("j", "/bin/true", "/tmp").with_resource("PARTITION", "x");
        assert!(!opts.for_job(&spec).unwrap_err().is_transient());
        let spec = JobSpec::new("j", "/bin/true", "/tmp").with_resource("LSF_QUEUE", "short");
        assert_eq!(opts.for_job(&spec).unwrap().queue.as_deref(), Some("short"));
    }
}
