use std::time::Duration;

use queue_core::SubmitError;

use crate::config::DriverKind;

/// Failure of a single scheduler command or driver lookup.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("command not found: {0}")]
    MissingCommand(String),

    #[error("{command} timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("{command} failed (exit {status:?}): {stderr}")]
    CommandFailed {
        command: String,
        status: Option<i32>,
        stderr: String,
    },

    #[error("unexpected output from {command}: {output:?}")]
    Parse { command: String, output: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DriverError {
    /// Submission-side view of a command error that carries no scheduler diagnostic.
    ///
    /// A missing scheduler binary will not appear on a retry; everything else might.
    pub fn into_submit_error(self) -> SubmitError {
        match self {
            DriverError::MissingCommand(_) => SubmitError::permanent(self.to_string()),
            other => SubmitError::transient(other.to_string()),
        }
    }
}

/// Rejected driver configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DriverConfigError {
    #[error("unsupported driver {0:?} (expected local|lsf|slurm|torque)")]
    UnknownKind(String),

    #[error("option {option} is not supported by the {kind} driver")]
    UnknownOption { kind: DriverKind, option: String },

    #[error("invalid value {value:?} for {option}: {reason}")]
    InvalidValue {
        option: String,
        value: String,
        reason: String,
    },
}

impl DriverConfigError {
    pub(crate) fn invalid(option: &str, value: &str, reason: impl Into<String>) -> Self {
        DriverConfigError::InvalidValue {
            option: option.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}
