//! Running scheduler command-line tools.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use crate::error::DriverError;

/// Captured result of one command invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Stdout and stderr together, for matching scheduler diagnostics.
    pub fn combined(&self) -> String {
        format!("{}\n{}", self.stdout, self.stderr)
    }
}

/// A scheduler command line, optionally routed through a remote shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    program: String,
    args: Vec<String>,
}

impl CommandLine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    /// Run this command on `server` through `rsh`, as one quoted shell string.
    pub fn via_remote_shell(self, rsh: &str, server: &str) -> Self {
        let remote = std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .map(shell_quote)
            .collect::<Vec<_>>()
            .join(" ");
        CommandLine::new(rsh).arg(server).arg(remote)
    }

    /// Run to completion, bounded by `timeout`.
    ///
    /// A non-zero exit is not an error here; callers inspect the output.
    pub async fn output(
        &self,
        cwd: Option<&Path>,
        timeout: Duration,
    ) -> Result<CommandOutput, DriverError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        debug!(command = %self, "running scheduler command");
        let output = match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DriverError::MissingCommand(self.program.clone()));
            }
            Ok(Err(e)) => return Err(DriverError::Io(e)),
            Err(_) => {
                return Err(DriverError::Timeout {
                    command: self.program.clone(),
                    timeout,
                });
            }
        };

        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Like [`CommandLine::output`], turning a non-zero exit into [`DriverError::CommandFailed`].
    pub async fn checked_output(
        &self,
        cwd: Option<&Path>,
        timeout: Duration,
    ) -> Result<CommandOutput, DriverError> {
        let output = self.output(cwd, timeout).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(self.failed(&output))
        }
    }

    pub fn failed(&self, output: &CommandOutput) -> DriverError {
        let stderr = output.stderr.trim();
        let stderr = if stderr.is_empty() {
            output.stdout.trim()
        } else {
            stderr
        };
        DriverError::CommandFailed {
            command: self.program.clone(),
            status: output.status,
            stderr: stderr.to_string(),
        }
    }
}

impl std::fmt::Display for CommandLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {}", shell_quote(arg))?;
        }
        Ok(())
    }
}

/// Quote `s` for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    let plain = !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,@%+".contains(c));
    if plain {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}
