//! One slot of a job chain.

use std::time::Duration;

use tokio::time::Instant;
use tracing::warn;

use crate::error::{ChainError, Error, TrackerError};
use crate::session::{ArrayJobHandle, JobHandle, aggregate_state};
use crate::template::JobTemplate;
use crate::tracker::{JobInfo, JobState};

/// What a successful submission produced.
#[derive(Debug, Clone)]
pub(crate) enum TaskBackend {
    Single(JobHandle),
    Array(ArrayJobHandle),
}

#[derive(Debug, Clone)]
pub(crate) struct TaskElement {
    /// As handed to the backend, placeholders expanded.
    pub(crate) template: JobTemplate,
    /// Before placeholder expansion; resubmissions start from here.
    pub(crate) blueprint: JobTemplate,
    /// `None` when the submission failed.
    pub(crate) backend: Option<TaskBackend>,
    pub(crate) submit_error: Option<Error>,
    pub(crate) terminated: bool,
    pub(crate) termination_error: Option<Error>,
    /// Snapshot taken once the task reached a terminal state.
    pub(crate) job_info: Option<JobInfo>,
    pub(crate) retry: u32,
}

impl TaskElement {
    pub(crate) fn submitted(template: JobTemplate, blueprint: JobTemplate, backend: TaskBackend) -> Self {
        Self {
            template,
            blueprint,
            backend: Some(backend),
            submit_error: None,
            terminated: false,
            termination_error: None,
            job_info: None,
            retry: 0,
        }
    }

    pub(crate) fn failed(template: JobTemplate, blueprint: JobTemplate, error: Error) -> Self {
        Self {
            template,
            blueprint,
            backend: None,
            submit_error: Some(error),
            terminated: false,
            termination_error: None,
            job_info: None,
            retry: 0,
        }
    }

    /// Swap in a fresh incarnation of this task.
    pub(crate) fn replace(&mut self, template: JobTemplate, job: JobHandle) {
        self.template = template;
        self.backend = Some(TaskBackend::Single(job));
        self.submit_error = None;
        self.terminated = false;
        self.termination_error = None;
        self.job_info = None;
        self.retry += 1;
    }

    /// Block until the task is finished. A zero timeout waits forever.
    ///
    /// Tasks without a backend job count as finished.
    pub(crate) async fn wait(&mut self, timeout: Duration) -> Result<(), Error> {
        if self.terminated {
            return Ok(());
        }
        let Some(backend) = self.backend.clone() else {
            return Ok(());
        };
        let result = match &backend {
            TaskBackend::Single(job) => job.wait_terminated(timeout).await.map_err(Error::from),
            TaskBackend::Array(array) => wait_array(array, timeout).await,
        };
        if let Err(e) = result {
            self.termination_error = Some(e.clone());
            if e.is_timeout() {
                return Err(ChainError::Timeout.into());
            }
            return Err(e);
        }

        self.terminated = true;
        let info = match &backend {
            TaskBackend::Single(job) => job.info().await.map_err(Error::from),
            TaskBackend::Array(array) => array_job_info(array).await,
        };
        match info {
            Ok(info) => self.job_info = Some(info),
            Err(e) => warn!(error = %e, "Collecting job info after wait failed"),
        }
        Ok(())
    }

    /// Cached terminal state when known, the backend's view otherwise.
    pub(crate) async fn state(&self) -> JobState {
        if self.terminated
            && let Some(info) = &self.job_info
        {
            return info.state;
        }
        match &self.backend {
            None => JobState::Undetermined,
            Some(TaskBackend::Single(job)) => job.state().await,
            Some(TaskBackend::Array(array)) => array.state().await,
        }
    }

    /// Every backend job of this slot: the job itself or the array's tasks.
    pub(crate) async fn handles(&self) -> Vec<JobHandle> {
        match &self.backend {
            None => Vec::new(),
            Some(TaskBackend::Single(job)) => vec![job.clone()],
            Some(TaskBackend::Array(array)) => array_tasks(array).await,
        }
    }
}

pub(crate) async fn array_tasks(array: &ArrayJobHandle) -> Vec<JobHandle> {
    match array.jobs().await {
        Ok(jobs) => jobs,
        Err(e) => {
            warn!(array_id = %array.id(), error = %e, "Listing array tasks failed");
            Vec::new()
        }
    }
}

/// Wait for every task of `array` under one shared deadline.
async fn wait_array(array: &ArrayJobHandle, timeout: Duration) -> Result<(), Error> {
    let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);
    for job in array.jobs().await? {
        let remaining = match deadline {
            None => Duration::ZERO,
            Some(deadline) => {
                let left = deadline.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    return Err(TrackerError::Timeout {
                        id: array.id().to_string(),
                    }
                    .into());
                }
                left
            }
        };
        job.wait_terminated(remaining).await?;
    }
    Ok(())
}

/// Summary of an array job: aggregated state, the first non-zero exit
/// status, the earliest submission and the latest finish.
pub(crate) async fn array_job_info(array: &ArrayJobHandle) -> Result<JobInfo, Error> {
    let mut summary = JobInfo {
        id: array.id().to_string(),
        ..Default::default()
    };
    let mut states = Vec::new();
    for job in array.jobs().await? {
        let info = job.info().await?;
        states.push(info.state);
        if summary.exit_status == 0 {
            summary.exit_status = info.exit_status;
        }
        summary.submission_time = match (summary.submission_time, info.submission_time) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        summary.dispatch_time = match (summary.dispatch_time, info.dispatch_time) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        summary.finish_time = summary.finish_time.max(info.finish_time);
    }
    summary.state = aggregate_state(&states);
    Ok(summary)
}
