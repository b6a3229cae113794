//! Exit-code policy deciding whether an execution failure is worth another attempt.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Resubmit while attempts remain.
    #[default]
    Retryable,
    /// Fail the job immediately.
    Permanent,
}

/// Mapping from process exit codes to failure classes.
///
/// Codes missing from the table fall back to `default_class`; failures
/// without any exit code (killed, lost by the scheduler) use `no_exit_code`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailurePolicy {
    pub default_class: FailureClass,
    pub no_exit_code: FailureClass,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub exit_codes: BTreeMap<i32, FailureClass>,
}

impl FailurePolicy {
    /// Every failure is retryable.
    pub fn retry_all() -> Self {
        Self::default()
    }

    /// Classify `code` explicitly.
    pub fn with_exit_code(mut self, code: i32, class: FailureClass) -> Self {
        self.exit_codes.insert(code, class);
        self
    }

    pub fn with_default(mut self, class: FailureClass) -> Self {
        self.default_class = class;
        self
    }

    pub fn classify(&self, exit_code: Option<i32>) -> FailureClass {
        match exit_code {
            Some(code) => self
                .exit_codes
                .get(&code)
                .copied()
                .unwrap_or(self.default_class),
            None => self.no_exit_code,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_overrides_default() {
        let policy = FailurePolicy::retry_all().with_exit_code(2, FailureClass::Permanent);
        assert_eq!(policy.classify(Some(1)), FailureClass::Retryable);
        assert_eq!(policy.classify(Some(2)), FailureClass::Permanent);
        assert_eq!(policy.classify(None), FailureClass::Retryable);
    }

    #[test]
    fn policy_from_json() {
        let policy: FailurePolicy = serde_json::from_str(
            r#"{"default_class":"permanent","exit_codes":{"137":"retryable"}}"#,
        )
        .unwrap();
        assert_eq!(policy.classify(Some(137)), FailureClass::Retryable);
        assert_eq!(policy.classify(Some(1)), FailureClass::Permanent);
    }
}
