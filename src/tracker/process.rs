//! Spawning and supervising operating-system processes for jobs.

use std::fs::File;
use std::os::fd::AsFd;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};

use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::resource::{UsageWho, getrusage};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{Id, WaitPidFlag, waitid};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, info, warn};

use super::pubsub::{JobEvent, PubSub};
use super::{JobInfo, JobState};
use crate::error::TrackerError;
use crate::template::JobTemplate;

/// Everything needed to start one process.
pub(crate) struct Launch<'a> {
    pub job_id: &'a str,
    /// Set for array tasks.
    pub task_index: Option<i64>,
    pub template: &'a JobTemplate,
    pub submission_time: DateTime<Utc>,
}

/// Validate the template, spawn the process in its own process group, publish
/// `running`, and hand the child to a supervising task. Returns the pid.
pub(crate) async fn start_process(launch: Launch<'_>, bus: &PubSub) -> Result<u32, TrackerError> {
    let template = launch.template;
    template
        .validate()
        .map_err(|e| TrackerError::InvalidArgument(e.to_string()))?;

    let mut command = build_command(&launch)?;
    let child = command.spawn().map_err(|e| {
        TrackerError::Internal(format!(
            "failed to start {}: {e}",
            template.remote_command
        ))
    })?;
    let pid = child.id().ok_or_else(|| {
        TrackerError::Internal(format!("process of job {} exited before it was tracked", launch.job_id))
    })?;

    let dispatch_time = Utc::now();
    let host = hostname();
    info!(
        job_id = %launch.job_id,
        pid,
        command = %template.remote_command,
        "Job process started"
    );
    bus.notify_and_wait(JobEvent::new(
        launch.job_id,
        JobState::Running,
        JobInfo {
            id: launch.job_id.to_string(),
            state: JobState::Running,
            allocated_machines: vec![host.clone()],
            submission_machine: host,
            job_owner: job_owner(),
            slots: Some(1),
            submission_time: Some(launch.submission_time),
            dispatch_time: Some(dispatch_time),
            ..Default::default()
        },
    ))
    .await;

    tokio::spawn(supervise(
        child,
        launch.job_id.to_string(),
        launch.submission_time,
        dispatch_time,
        bus.clone(),
    ));
    Ok(pid)
}

fn build_command(launch: &Launch<'_>) -> Result<Command, TrackerError> {
    let template = launch.template;
    let mut command = Command::new(&template.remote_command);
    command
        .args(&template.args)
        .envs(&template.job_environment)
        .env("JOB_ID", launch.job_id)
        .process_group(0);
    if let Some(index) = launch.task_index {
        command
            .env("TASK_ID", index.to_string())
            .env("DRMAA2_INDEX", index.to_string());
    }
    if !template.working_directory.is_empty() {
        command.current_dir(&template.working_directory);
    }

    let redirect_err = |path: &str, e: std::io::Error| {
        TrackerError::Internal(format!("cannot redirect to {path}: {e}"))
    };
    command.stdin(input_stdio(&template.input_path).map_err(|e| redirect_err(&template.input_path, e))?);
    command.stdout(
        output_stdio(&template.output_path).map_err(|e| redirect_err(&template.output_path, e))?,
    );
    let stderr = if template.join_files && template.error_path.is_empty() {
        output_stdio(&template.output_path).map_err(|e| redirect_err(&template.output_path, e))?
    } else {
        output_stdio(&template.error_path).map_err(|e| redirect_err(&template.error_path, e))?
    };
    command.stderr(stderr);
    Ok(command)
}

fn input_stdio(path: &str) -> std::io::Result<Stdio> {
    match path {
        "" | "/dev/null" => Ok(Stdio::null()),
        path => File::open(path).map(Stdio::from),
    }
}

/// Reserved paths map onto this process's own streams; anything else is
/// created or truncated.
fn output_stdio(path: &str) -> std::io::Result<Stdio> {
    match path {
        "" => Ok(Stdio::inherit()),
        "/dev/null" => Ok(Stdio::null()),
        "/dev/stdout" => Ok(Stdio::from(std::io::stdout().as_fd().try_clone_to_owned()?)),
        "/dev/stderr" => Ok(Stdio::from(std::io::stderr().as_fd().try_clone_to_owned()?)),
        path => File::options()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map(Stdio::from),
    }
}

async fn supervise(
    mut child: Child,
    job_id: String,
    submission_time: DateTime<Utc>,
    dispatch_time: DateTime<Utc>,
    bus: PubSub,
) {
    let (status, cpu_time) = wait_with_cpu_time(&mut child).await;
    let finish_time = Utc::now();
    let host = hostname();

    let mut info = JobInfo {
        id: job_id.clone(),
        allocated_machines: vec![host.clone()],
        submission_machine: host,
        job_owner: job_owner(),
        slots: Some(1),
        submission_time: Some(submission_time),
        dispatch_time: Some(dispatch_time),
        finish_time: Some(finish_time),
        wallclock_time: (finish_time - dispatch_time).to_std().ok(),
        cpu_time,
        ..Default::default()
    };

    match status {
        Ok(status) => {
            let (exit_status, terminating_signal) = exit_details(status);
            info.exit_status = exit_status;
            info.terminating_signal = terminating_signal;
            info.state = if status.success() {
                JobState::Done
            } else {
                JobState::Failed
            };
            info!(
                job_id = %job_id,
                state = %info.state,
                exit_status,
                signal = %info.terminating_signal,
                "Job process finished"
            );
        }
        Err(e) => {
            warn!(job_id = %job_id, error = %e, "Waiting for job process failed");
            info.exit_status = -1;
            info.state = JobState::Failed;
        }
    }

    bus.publish(JobEvent::new(job_id, info.state, info));
}

/// Held around every reap so the growth of the children's resource usage
/// belongs to the one child being reaped.
static REAP_LOCK: Mutex<()> = Mutex::const_new(());

/// Wait for `child` and report the CPU seconds (user plus system) it used.
///
/// The child is first waited for without being reaped, then reaped under
/// [`REAP_LOCK`] with `getrusage(RUSAGE_CHILDREN)` sampled on both sides.
/// Children reaped outside this module during that window are counted too.
async fn wait_with_cpu_time(child: &mut Child) -> (std::io::Result<ExitStatus>, Option<i64>) {
    let Some(pid) = child.id() else {
        return (child.wait().await, None);
    };
    let pid = Pid::from_raw(pid as i32);

    // waitid blocks; a plain thread keeps long-running jobs off the blocking pool
    let (tx, rx) = oneshot::channel();
    std::thread::spawn(move || {
        let exited = loop {
            match waitid(Id::Pid(pid), WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT) {
                Err(Errno::EINTR) => continue,
                other => break other.is_ok(),
            }
        };
        let _ = tx.send(exited);
    });
    if !rx.await.unwrap_or(false) {
        debug!(pid = %pid, "Child exit not observable, skipping CPU time");
        return (child.wait().await, None);
    }

    let _guard = REAP_LOCK.lock().await;
    let before = children_cpu_micros();
    let status = child.wait().await;
    let after = children_cpu_micros();
    let cpu_time = match (before, after) {
        (Some(before), Some(after)) => Some(((after - before).max(0) + 500_000) / 1_000_000),
        _ => None,
    };
    (status, cpu_time)
}

/// User plus system time of all reaped children, in microseconds.
fn children_cpu_micros() -> Option<i64> {
    let usage = getrusage(UsageWho::RUSAGE_CHILDREN).ok()?;
    let micros = |t: nix::sys::time::TimeVal| t.tv_sec() as i64 * 1_000_000 + t.tv_usec() as i64;
    Some(micros(usage.user_time()) + micros(usage.system_time()))
}

/// Exit code (or -1 when signalled) and the name of the terminating signal.
fn exit_details(status: ExitStatus) -> (i32, String) {
    let signal = status
        .signal()
        .map(|sig| {
            Signal::try_from(sig)
                .map(|s| s.as_str().to_string())
                .unwrap_or_else(|_| sig.to_string())
        })
        .unwrap_or_default();
    (status.code().unwrap_or(-1), signal)
}

/// Send `sig` to the process group led by `pid`.
pub(crate) fn signal_group(job_id: &str, pid: u32, sig: Signal) -> Result<(), TrackerError> {
    let pgid = i32::try_from(pid)
        .map_err(|_| TrackerError::Internal(format!("pid {pid} of job {job_id} out of range")))?;
    debug!(job_id = %job_id, pid, signal = %sig, "Signalling job process group");
    signal::killpg(Pid::from_raw(pgid), sig).map_err(|e| {
        TrackerError::Internal(format!("failed to send {sig} to job {job_id}: {e}"))
    })
}

fn hostname() -> String {
    nix::unistd::gethostname()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn job_owner() -> String {
    nix::unistd::getuid().to_string()
}
