#![cfg(unix)]
#![allow(clippy::disallowed_methods)]

mod common;

use std::error::Error;

use common::{calls, fake_command, path_str};
use drivers::{Driver, DriverConfig, DriverKind, JobDriver};
use queue_core::{BackendToken, JobSpec, RemoteState};

#[tokio::test]
async fn lsf_submit_poll_cancel() -> Result<(), Box<dyn Error>> {
    let _guard = common::lock().await;
    let bin = tempfile::tempdir()?;
    let run = tempfile::tempdir()?;
    let bsub = fake_command(bin.path(), "bsub", "echo 'Job <8411> is submitted to queue <mr>.'")?;
    let bjobs = fake_command(bin.path(), "bjobs", "echo '8411 RUN -'")?;
    let bkill = fake_command(bin.path(), "bkill", "echo 'Job <8411> is being terminated'")?;

    let driver = Driver::from_config(
        &DriverConfig::new(DriverKind::Lsf)
            .with_option("BSUB_CMD", path_str(&bsub))
            .with_option("BJOBS_CMD", path_str(&bjobs))
            .with_option("BKILL_CMD", path_str(&bkill))
            .with_option("LSF_QUEUE", "mr"),
    )?;
    let spec = JobSpec::new("real-0", "/bin/forward", run.path());

    let token = driver.submit(&spec).await?;
    assert_eq!(token.as_str(), "8411");
    assert_eq!(driver.poll(&token).await?, RemoteState::Running);
    driver.cancel(&token).await?;

    let submitted = calls(bin.path(), "bsub");
    assert_eq!(submitted.len(), 1);
    assert!(submitted[0].contains("-q mr"));
    assert_eq!(calls(bin.path(), "bkill"), vec!["8411"]);
    Ok(())
}

#[tokio::test]
async fn lsf_falls_back_to_bhist() -> Result<(), Box<dyn Error>> {
    let _guard = common::lock().await;
    let bin = tempfile::tempdir()?;
    let bjobs = fake_command(bin.path(), "bjobs", "echo 'Job <8411> is not found' >&2; exit 255")?;
    let bhist = fake_command(
        bin.path(),
        "bhist",
        "echo 'Thu Oct 16 10:05:00: Exited with exit code 3. The CPU time used is 1.0 seconds;'",
    )?;

    let driver = Driver::from_config(
        &DriverConfig::new(DriverKind::Lsf)
            .with_option("BJOBS_CMD", path_str(&bjobs))
            .with_option("BHIST_CMD", path_str(&bhist)),
    )?;
    let state = driver.poll(&BackendToken::new("8411")).await?;
    assert!(matches!(
        state,
        RemoteState::Failed {
            exit_code: Some(3),
            ..
        }
    ));
    assert_eq!(calls(bin.path(), "bhist"), vec!["-l 8411"]);
    Ok(())
}

#[tokio::test]
async fn lsf_rejected_submit_is_permanent() -> Result<(), Box<dyn Error>> {
    let _guard = common::lock().await;
    let bin = tempfile::tempdir()?;
    let run = tempfile::tempdir()?;
    let bsub = fake_command(
        bin.path(),
        "bsub",
        "echo 'Bad resource requirement syntax. Job not submitted.' >&2; exit 255",
    )?;
    let driver = Driver::from_config(
        &DriverConfig::new(DriverKind::Lsf).with_option("BSUB_CMD", path_str(&bsub)),
    )?;
    let err = driver
        .submit(&JobSpec::new("real-0", "/bin/forward", run.path()))
        .await
        .unwrap_err();
    assert!(!err.is_transient());
    Ok(())
}

#[tokio::test]
async fn slurm_scontrol_fallback_after_squeue_forgets() -> Result<(), Box<dyn Error>> {
    let _guard = common::lock().await;
    let bin = tempfile::tempdir()?;
    let run = tempfile::tempdir()?;
    let sbatch = fake_command(bin.path(), "sbatch", "echo '4242;cluster'")?;
    let squeue = fake_command(bin.path(), "squeue", "exit 0")?;
    let scontrol = fake_command(
        bin.path(),
        "scontrol",
        "echo 'JobId=4242 JobName=real-0'; echo '   JobState=COMPLETED Reason=None ExitCode=0:0'",
    )?;

    let driver = Driver::from_config(
        &DriverConfig::new(DriverKind::Slurm)
            .with_option("SBATCH", path_str(&sbatch))
            .with_option("SQUEUE", path_str(&squeue))
            .with_option("SCONTROL", path_str(&scontrol))
            .with_option("PARTITION", "short"),
    )?;
    let spec = JobSpec::new("real-0", "/bin/forward", run.path())
        .with_resource("PARTITION", "long");
    let token = driver.submit(&spec).await?;
    assert_eq!(token.as_str(), "4242");
    assert_eq!(driver.poll(&token).await?, RemoteState::done());

    let submitted = calls(bin.path(), "sbatch");
    assert!(submitted[0].contains("--partition=long"));
    assert!(!submitted[0].contains("--partition=short"));
    assert_eq!(calls(bin.path(), "scontrol"), vec!["show job 4242"]);
    Ok(())
}

#[tokio::test]
async fn slurm_transient_submit_failure() -> Result<(), Box<dyn Error>> {
    let _guard = common::lock().await;
    let bin = tempfile::tempdir()?;
    let run = tempfile::tempdir()?;
    let sbatch = fake_command(
        bin.path(),
        "sbatch",
        "echo 'sbatch: error: Batch job submission failed: Socket timed out on send/recv' >&2; exit 1",
    )?;
    let driver = Driver::from_config(
        &DriverConfig::new(DriverKind::Slurm).with_option("SBATCH", path_str(&sbatch)),
    )?;
    let err = driver
        .submit(&JobSpec::new("real-0", "/bin/forward", run.path()))
        .await
        .unwrap_err();
    assert!(err.is_transient());
    Ok(())
}

#[tokio::test]
async fn torque_writes_script_and_reads_exit_status() -> Result<(), Box<dyn Error>> {
    let _guard = common::lock().await;
    let bin = tempfile::tempdir()?;
    let run = tempfile::tempdir()?;
    let qsub = fake_command(bin.path(), "qsub", "echo '4711.pbs-server'")?;
    let qstat = fake_command(
        bin.path(),
        "qstat",
        "echo 'Job Id: 4711.pbs-server'; echo '    job_state = C'; echo '    Exit_status = 3'",
    )?;
    let qdel = fake_command(bin.path(), "qdel", "echo 'qdel: Unknown Job Id 4711.pbs-server' >&2; exit 153")?;

    let driver = Driver::from_config(
        &DriverConfig::new(DriverKind::Torque)
            .with_option("QSUB_CMD", path_str(&qsub))
            .with_option("QSTAT_CMD", path_str(&qstat))
            .with_option("QDEL_CMD", path_str(&qdel))
            .with_option("QUEUE", "batch"),
    )?;
    let spec = JobSpec::new("real-5", "/bin/forward", run.path());
    let token = driver.submit(&spec).await?;
    assert_eq!(token.as_str(), "4711.pbs-server");

    let script = std::fs::read_to_string(run.path().join("real-5.qsub.sh"))?;
    assert!(script.contains("#PBS -q batch"));
    assert!(script.contains("exec /bin/forward"));

    let state = driver.poll(&token).await?;
    assert!(matches!(
        state,
        RemoteState::Failed {
            exit_code: Some(3),
            ..
        }
    ));
    assert_eq!(calls(bin.path(), "qstat"), vec!["-f -x 4711.pbs-server"]);

    // Unknown ids are already gone; cancelling them is not an error.
    driver.cancel(&token).await?;
    Ok(())
}

#[tokio::test]
async fn missing_scheduler_binary() -> Result<(), Box<dyn Error>> {
    let run = tempfile::tempdir()?;
    let driver = Driver::from_config(
        &DriverConfig::new(DriverKind::Slurm)
            .with_option("SBATCH", "/nonexistent/sbatch")
            .with_option("SQUEUE", "/nonexistent/squeue"),
    )?;
    let err = driver
        .submit(&JobSpec::new("real-0", "/bin/forward", run.path()))
        .await
        .unwrap_err();
    assert!(!err.is_transient());
    assert!(driver.poll(&BackendToken::new("1")).await.is_err());
    Ok(())
}
