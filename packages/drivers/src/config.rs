//! Driver selection and option handling.
//!
//! Options are plain `NAME=value` strings, the same names a user puts in a
//! queue configuration file. Each backend owns a typed options struct and
//! rejects names it does not know, both when the driver is built and when a
//! job carries per-job overrides.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use queue_core::{JobSpec, SubmitError};
use serde::{Deserialize, Serialize};

use crate::error::DriverConfigError;

/// Option understood by every driver: the concurrency ceiling, 0 meaning unlimited.
pub const MAX_RUNNING: &str = "MAX_RUNNING";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    Local,
    Lsf,
    Slurm,
    Torque,
}

impl DriverKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DriverKind::Local => "local",
            DriverKind::Lsf => "lsf",
            DriverKind::Slurm => "slurm",
            DriverKind::Torque => "torque",
        }
    }
}

impl std::fmt::Display for DriverKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DriverKind {
    type Err = DriverConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(DriverKind::Local),
            "lsf" => Ok(DriverKind::Lsf),
            "slurm" => Ok(DriverKind::Slurm),
            "torque" | "pbs" => Ok(DriverKind::Torque),
            other => Err(DriverConfigError::UnknownKind(other.to_string())),
        }
    }
}

/// Backend kind plus its raw options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverConfig {
    pub kind: DriverKind,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, String>,
}

impl DriverConfig {
    pub fn new(kind: DriverKind) -> Self {
        Self {
            kind,
            options: BTreeMap::new(),
        }
    }

    pub fn local() -> Self {
        Self::new(DriverKind::Local)
    }

    pub fn with_option(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(name.into(), value.into());
        self
    }

    /// The generic `MAX_RUNNING` option, if set.
    pub fn max_running(&self) -> Result<Option<u32>, DriverConfigError> {
        match self.options.get(MAX_RUNNING) {
            Some(raw) => parse_value::<u32>(MAX_RUNNING, raw).map(Some),
            None => Ok(None),
        }
    }

    /// Options meant for the backend itself.
    pub(crate) fn backend_options(&self) -> impl Iterator<Item = (&str, &str)> {
        self.options
            .iter()
            .filter(|(name, _)| name.as_str() != MAX_RUNNING)
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Build a config from environment variables.
    ///
    /// - `QUEUE_SYSTEM` selects the backend (`local`, `lsf`, `slurm`, `torque`; default `local`)
    /// - `QUEUE_OPTION_<NAME>` sets driver option `<NAME>`, e.g. `QUEUE_OPTION_LSF_QUEUE=mr`
    pub fn from_env() -> Result<Self, DriverConfigError> {
        Self::from_vars(std::env::vars())
    }

    /// Same as [`DriverConfig::from_env`] over an explicit variable list.
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self, DriverConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut kind = DriverKind::Local;
        let mut options = BTreeMap::new();
        for (key, value) in vars {
            let (key, value) = (key.as_ref(), value.as_ref().trim());
            if key == "QUEUE_SYSTEM" {
                kind = value.parse()?;
            } else if let Some(name) = key.strip_prefix("QUEUE_OPTION_")
                && !name.is_empty()
                && !value.is_empty()
            {
                options.insert(name.to_string(), value.to_string());
            }
        }
        Ok(Self { kind, options })
    }
}

/// Typed option set of one backend.
pub(crate) trait BackendOptions: Default + Clone {
    const KIND: DriverKind;

    /// Apply one named option.
    fn set(&mut self, name: &str, value: &str) -> Result<(), DriverConfigError>;

    /// Cross-option checks run after every option has been applied.
    fn validate(&self) -> Result<(), DriverConfigError> {
        Ok(())
    }

    fn from_config(config: &DriverConfig) -> Result<Self, DriverConfigError> {
        let mut options = Self::default();
        for (name, value) in config.backend_options() {
            options.set(name, value)?;
        }
        options.validate()?;
        Ok(options)
    }

    /// Driver options with the job's resource overrides applied on top.
    fn for_job(&self, spec: &JobSpec) -> Result<Self, SubmitError> {
        if spec.resources.is_empty() {
            return Ok(self.clone());
        }
        let mut options = self.clone();
        for (name, value) in &spec.resources {
            options
                .set(name, value)
                .map_err(|e| SubmitError::permanent(e.to_string()))?;
        }
        options
            .validate()
            .map_err(|e| SubmitError::permanent(e.to_string()))?;
        Ok(options)
    }

    fn unknown(name: &str) -> DriverConfigError {
        DriverConfigError::UnknownOption {
            kind: Self::KIND,
            option: name.to_string(),
        }
    }
}

pub(crate) fn parse_value<T: FromStr>(name: &str, value: &str) -> Result<T, DriverConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| DriverConfigError::invalid(name, value, "not a valid number"))
}

pub(crate) fn parse_positive(name: &str, value: &str) -> Result<u32, DriverConfigError> {
    match parse_value::<u32>(name, value)? {
        0 => Err(DriverConfigError::invalid(name, value, "must be positive")),
        n => Ok(n),
    }
}

pub(crate) fn parse_bool(name: &str, value: &str) -> Result<bool, DriverConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(DriverConfigError::invalid(name, value, "expected a boolean")),
    }
}

/// Timeout given in (possibly fractional) seconds.
pub(crate) fn parse_timeout(name: &str, value: &str) -> Result<Duration, DriverConfigError> {
    let secs: f64 = value
        .trim()
        .parse()
        .map_err(|_| DriverConfigError::invalid(name, value, "expected seconds"))?;
    if !(secs.is_finite() && secs > 0.0) {
        return Err(DriverConfigError::invalid(name, value, "must be positive"));
    }
    Ok(Duration::from_secs_f64(secs))
}

/// Host lists are accepted comma or whitespace separated.
pub(crate) fn parse_list(value: &str) -> Vec<String> {
    value
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

pub(crate) fn non_empty(name: &str, value: &str) -> Result<String, DriverConfigError> {
    let value = value.trim();
    if value.is_empty() {
        Err(DriverConfigError::invalid(name, value, "must not be empty"))
    } else {
        Ok(value.to_string())
    }
}

pub(crate) const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_parsing() {
        assert_eq!("LSF".parse::<DriverKind>().unwrap(), DriverKind::Lsf);
        assert_eq!("pbs".parse::<DriverKind>().unwrap(), DriverKind::Torque);
        assert!(matches!(
            "condor".parse::<DriverKind>(),
            Err(DriverConfigError::UnknownKind(_))
        ));
    }

    #[test]
    fn config_from_vars() {
        let cfg = DriverConfig::from_vars([
            ("QUEUE_SYSTEM", "slurm"),
            ("QUEUE_OPTION_PARTITION", "short"),
            ("QUEUE_OPTION_MAX_RUNNING", "12"),
            ("QUEUE_OPTION_EMPTY", " "),
            ("HOME", "/root"),
        ])
        .unwrap();
        assert_eq!(cfg.kind, DriverKind::Slurm);
        assert_eq!(cfg.options.get("PARTITION").map(String::as_str), Some("short"));
        assert!(!cfg.options.contains_key("EMPTY"));
        assert_eq!(cfg.max_running().unwrap(), Some(12));
        assert_eq!(cfg.backend_options().count(), 1);
    }

    #[test]
    fn value_helpers() {
        assert_eq!(parse_list("a, b,,c d"), vec!["a", "b", "c", "d"]);
        assert!(parse_bool("KEEP", "maybe").is_err());
        assert!(parse_bool("KEEP", "True").unwrap());
        assert_eq!(
            parse_timeout("T", "1.5").unwrap(),
            Duration::from_millis(1500)
        );
        assert!(parse_timeout("T", "0").is_err());
        assert!(parse_positive("N", "0").is_err());
    }

    #[test]
    fn config_json_shape() {
        let cfg: DriverConfig =
            serde_json::from_str(r#"{"kind":"torque","options":{"QUEUE":"batch"}}"#).unwrap();
        assert_eq!(cfg.kind, DriverKind::Torque);
        assert_eq!(cfg.options.len(), 1);
    }
}
