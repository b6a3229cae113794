use std::future::Future;

use queue_core::{BackendToken, JobSpec, RemoteState, SubmitError};
use tracing::info;

use crate::config::{DriverConfig, DriverKind};
use crate::error::{DriverConfigError, DriverError};
use crate::local::LocalDriver;
use crate::lsf::LsfDriver;
use crate::slurm::SlurmDriver;
use crate::torque::TorqueDriver;

/// Submit, poll and cancel primitives of one batch backend.
///
/// Implementations are shared across every job of a queue and may be called
/// concurrently.
pub trait JobDriver: Send + Sync + 'static {
    fn kind(&self) -> DriverKind;

    /// Start one submission; every successful call yields a fresh token.
    fn submit(
        &self,
        spec: &JobSpec,
    ) -> impl Future<Output = Result<BackendToken, SubmitError>> + Send;

    /// Current backend view of a submission.
    fn poll(
        &self,
        token: &BackendToken,
    ) -> impl Future<Output = Result<RemoteState, DriverError>> + Send;

    /// Best-effort cancel; tokens the backend no longer knows are not an error.
    fn cancel(&self, token: &BackendToken) -> impl Future<Output = Result<(), DriverError>> + Send;
}

/// The closed set of supported backends.
#[derive(Debug)]
pub enum Driver {
    Local(LocalDriver),
    Lsf(LsfDriver),
    Slurm(SlurmDriver),
    Torque(TorqueDriver),
}

impl Driver {
    /// Build and validate a driver; fails before any job is touched.
    pub fn from_config(config: &DriverConfig) -> Result<Self, DriverConfigError> {
        config.max_running()?;
        let driver = match config.kind {
            DriverKind::Local => Driver::Local(LocalDriver::from_config(config)?),
            DriverKind::Lsf => Driver::Lsf(LsfDriver::from_config(config)?),
            DriverKind::Slurm => Driver::Slurm(SlurmDriver::from_config(config)?),
            DriverKind::Torque => Driver::Torque(TorqueDriver::from_config(config)?),
        };
        info!(
            driver = %config.kind,
            options = config.options.len(),
            "Driver configured"
        );
        Ok(driver)
    }

    pub fn local() -> Self {
        Driver::Local(LocalDriver::new())
    }
}

impl JobDriver for Driver {
    fn kind(&self) -> DriverKind {
        match self {
            Driver::Local(_) => DriverKind::Local,
            Driver::Lsf(_) => DriverKind::Lsf,
            Driver::Slurm(_) => DriverKind::Slurm,
            Driver::Torque(_) => DriverKind::Torque,
        }
    }

    async fn submit(&self, spec: &JobSpec) -> Result<BackendToken, SubmitError> {
        match self {
            Driver::Local(d) => d.submit(spec).await,
            Driver::Lsf(d) => d.submit(spec).await,
            Driver::Slurm(d) => d.submit(spec).await,
            Driver::Torque(d) => d.submit(spec).await,
        }
    }

    async fn poll(&self, token: &BackendToken) -> Result<RemoteState, DriverError> {
        match self {
            Driver::Local(d) => d.poll(token).await,
            Driver::Lsf(d) => d.poll(token).await,
            Driver::Slurm(d) => d.poll(token).await,
            Driver::Torque(d) => d.poll(token).await,
        }
    }

    async fn cancel(&self, token: &BackendToken) -> Result<(), DriverError> {
        match self {
            Driver::Local(d) => d.cancel(token).await,
            Driver::Lsf(d) => d.cancel(token).await,
            Driver::Slurm(d) => d.cancel(token).await,
            Driver::Torque(d) => d.cancel(token).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_config_selects_backend() {
        let driver = Driver::from_config(
            &DriverConfig::new(DriverKind::Slurm).with_option("PARTITION", "short"),
        )
        .unwrap();
        assert_eq!(driver.kind(), DriverKind::Slurm);
    }

    #[test]
    fn unknown_option_rejected_up_front() {
        let err = Driver::from_config(
            &DriverConfig::new(DriverKind::Lsf).with_option("PARTITION", "short"),
        )
        .unwrap_err();
        assert_eq!(
            err,
            DriverConfigError::UnknownOption {
                kind: DriverKind::Lsf,
                option: "PARTITION".into()
            }
        );
    }

    #[test]
    fn generic_max_running_is_checked() {
        let err = Driver::from_config(&DriverConfig::local().with_option("MAX_RUNNING", "-1"))
            .unwrap_err();
        assert!(matches!(err, DriverConfigError::InvalidValue { .. }));
        assert!(
            Driver::from_config(&DriverConfig::local().with_option("MAX_RUNNING", "0")).is_ok()
        );
    }
}
