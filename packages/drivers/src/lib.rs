//! Batch-scheduler backends for the job queue.
//!
//! Every backend implements [`JobDriver`]; the queue holds the closed
//! [`Driver`] enum built once from a [`DriverConfig`]:
//! - `local`: child processes on this host
//! - `lsf`: `bsub` / `bjobs` / `bhist` / `bkill`
//! - `slurm`: `sbatch` / `squeue` / `scontrol` / `scancel`
//! - `torque`: generated PBS script, `qsub` / `qstat` / `qdel`

pub mod command;
mod config;
mod driver;
mod error;
pub mod local;
pub mod lsf;
pub mod slurm;
pub mod torque;

pub use config::{DriverConfig, DriverKind, MAX_RUNNING};
pub use driver::{Driver, JobDriver};
pub use error::{DriverConfigError, DriverError};
pub use local::LocalDriver;
pub use lsf::LsfDriver;
pub use slurm::SlurmDriver;
pub use torque::TorqueDriver;
