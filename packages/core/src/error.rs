//! Error taxonomy shared by drivers and the queue.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a submission did not produce a backend token.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum SubmitError {
    /// Expected to succeed on a later attempt (scheduler unreachable, quota burst).
    #[error("transient submit error: {0}")]
    Transient(String),
    /// Configuration defect; never succeeds on retry.
    #[error("permanent submit error: {0}")]
    Permanent(String),
}

impl SubmitError {
    pub fn transient(message: impl Into<String>) -> Self {
        SubmitError::Transient(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        SubmitError::Permanent(message.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, SubmitError::Transient(_))
    }

    pub fn message(&self) -> &str {
        match self {
            SubmitError::Transient(m) | SubmitError::Permanent(m) => m,
        }
    }
}

/// Invalid queue configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid queue config: {0}")]
    Invalid(String),
}
