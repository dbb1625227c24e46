//! Handles to jobs and array jobs running in a job session.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::error::TrackerError;
use crate::template::JobTemplate;
use crate::tracker::{ControlAction, JobInfo, JobState, JobTracker};

/// A job submitted through a [`super::JobSession`].
#[derive(Clone)]
pub struct JobHandle {
    id: String,
    session_name: String,
    tracker: Arc<dyn JobTracker>,
}

impl JobHandle {
    pub(crate) fn new(
        id: impl Into<String>,
        session_name: impl Into<String>,
        tracker: Arc<dyn JobTracker>,
    ) -> Self {
        Self {
            id: id.into(),
            session_name: session_name.into(),
            tracker,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn session_name(&self) -> &str {
        &self.session_name
    }

    pub async fn template(&self) -> Result<JobTemplate, TrackerError> {
        self.tracker.job_template(&self.id).await
    }

    pub async fn state(&self) -> JobState {
        self.tracker.job_state(&self.id).await
    }

    pub async fn info(&self) -> Result<JobInfo, TrackerError> {
        self.tracker.job_info(&self.id).await
    }

    pub async fn suspend(&self) -> Result<(), TrackerError> {
        self.tracker
            .job_control(&self.id, ControlAction::Suspend)
            .await
    }

    pub async fn resume(&self) -> Result<(), TrackerError> {
        self.tracker
            .job_control(&self.id, ControlAction::Resume)
            .await
    }

    pub async fn hold(&self) -> Result<(), TrackerError> {
        self.tracker.job_control(&self.id, ControlAction::Hold).await
    }

    pub async fn release(&self) -> Result<(), TrackerError> {
        self.tracker
            .job_control(&self.id, ControlAction::Release)
            .await
    }

    pub async fn terminate(&self) -> Result<(), TrackerError> {
        self.tracker
            .job_control(&self.id, ControlAction::Terminate)
            .await
    }

    pub(crate) async fn control(&self, action: ControlAction) -> Result<(), TrackerError> {
        self.tracker.job_control(&self.id, action).await
    }

    /// Wait until the job runs or has already finished.
    pub async fn wait_started(&self, timeout: Duration) -> Result<(), TrackerError> {
        self.tracker
            .wait(
                &self.id,
                timeout,
                &[JobState::Running, JobState::Done, JobState::Failed],
            )
            .await
    }

    /// Wait until the job is done or failed. A zero timeout waits forever.
    pub async fn wait_terminated(&self, timeout: Duration) -> Result<(), TrackerError> {
        self.tracker
            .wait(&self.id, timeout, &[JobState::Done, JobState::Failed])
            .await
    }

    /// Remove a finished job from the backend.
    pub async fn reap(&self) -> Result<(), TrackerError> {
        let state = self.state().await;
        if !state.is_terminal() {
            return Err(TrackerError::NotTerminal {
                id: self.id.clone(),
                state,
            });
        }
        debug!(job_id = %self.id, "Reaping job");
        self.tracker.delete_job(&self.id).await
    }
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.id)
            .field("session_name", &self.session_name)
            .finish()
    }
}

/// An array job submitted through a [`super::JobSession`].
#[derive(Clone)]
pub struct ArrayJobHandle {
    id: String,
    session_name: String,
    tracker: Arc<dyn JobTracker>,
}

impl ArrayJobHandle {
    pub(crate) fn new(
        id: impl Into<String>,
        session_name: impl Into<String>,
        tracker: Arc<dyn JobTracker>,
    ) -> Self {
        Self {
            id: id.into(),
            session_name: session_name.into(),
            tracker,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn session_name(&self) -> &str {
        &self.session_name
    }

    /// One handle per task, in task order.
    pub async fn jobs(&self) -> Result<Vec<JobHandle>, TrackerError> {
        Ok(self
            .tracker
            .list_array_jobs(&self.id)
            .await?
            .into_iter()
            .map(|id| JobHandle::new(id, &self.session_name, Arc::clone(&self.tracker)))
            .collect())
    }

    pub async fn template(&self) -> Result<JobTemplate, TrackerError> {
        self.tracker.job_template(&self.id).await
    }

    /// Aggregated state: `failed` if any task failed, else `undetermined` if
    /// any task is unknown, else the first unfinished task's state, else
    /// `done`.
    pub async fn state(&self) -> JobState {
        let Ok(jobs) = self.jobs().await else {
            return JobState::Undetermined;
        };
        let mut states = Vec::with_capacity(jobs.len());
        for job in &jobs {
            states.push(job.state().await);
        }
        aggregate_state(&states)
    }

    pub async fn suspend(&self) -> Result<(), TrackerError> {
        self.control_all(ControlAction::Suspend).await
    }

    pub async fn resume(&self) -> Result<(), TrackerError> {
        self.control_all(ControlAction::Resume).await
    }

    pub async fn hold(&self) -> Result<(), TrackerError> {
        self.control_all(ControlAction::Hold).await
    }

    pub async fn release(&self) -> Result<(), TrackerError> {
        self.control_all(ControlAction::Release).await
    }

    pub async fn terminate(&self) -> Result<(), TrackerError> {
        self.control_all(ControlAction::Terminate).await
    }

    /// Apply `action` to every task; the last failure is reported.
    pub(crate) async fn control_all(&self, action: ControlAction) -> Result<(), TrackerError> {
        let mut result = Ok(());
        for task in self.tracker.list_array_jobs(&self.id).await? {
            if let Err(e) = self.tracker.job_control(&task, action).await {
                debug!(job_id = %task, action = %action, error = %e, "Task control failed");
                result = Err(e);
            }
        }
        result
    }
}

impl std::fmt::Debug for ArrayJobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArrayJobHandle")
            .field("id", &self.id)
            .field("session_name", &self.session_name)
            .finish()
    }
}

pub(crate) fn aggregate_state(states: &[JobState]) -> JobState {
    if states.contains(&JobState::Failed) {
        JobState::Failed
    } else if states.contains(&JobState::Undetermined) || states.is_empty() {
        JobState::Undetermined
    } else {
        states
            .iter()
            .copied()
            .find(|s| !s.is_terminal())
            .unwrap_or(JobState::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::ProcessTracker;

    #[test]
    fn test_aggregate_state() {
        use JobState::*;
        assert_eq!(aggregate_state(&[Done, Failed, Running]), Failed);
        assert_eq!(aggregate_state(&[Done, Undetermined]), Undetermined);
        assert_eq!(aggregate_state(&[Done, Running, Queued]), Running);
        assert_eq!(aggregate_state(&[Done, Done]), Done);
        assert_eq!(aggregate_state(&[]), Undetermined);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_job_handle_lifecycle() {
        let tracker: Arc<dyn JobTracker> = Arc::new(ProcessTracker::new("handles"));
        let id = tracker
            .add_job(JobTemplate::command("sleep", ["0.1"]))
            .await
            .unwrap();
        let job = JobHandle::new(id, "handles", Arc::clone(&tracker));

        job.wait_started(Duration::from_secs(5)).await.unwrap();
        let err = job.reap().await.unwrap_err();
        assert!(matches!(err, TrackerError::NotTerminal { .. }));

        job.wait_terminated(Duration::ZERO).await.unwrap();
        assert_eq!(job.state().await, JobState::Done);
        assert_eq!(job.template().await.unwrap().remote_command, "sleep");
        assert_eq!(job.info().await.unwrap().exit_status, 0);
        job.reap().await.unwrap();
        assert!(tracker.list_jobs().await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_array_handle_terminate() {
        let tracker: Arc<dyn JobTracker> = Arc::new(ProcessTracker::new("handles"));
        let id = tracker
            .add_array_job(JobTemplate::command("sleep", ["10"]), 1, 3, 1, 0)
            .await
            .unwrap();
        let array = ArrayJobHandle::new(id, "handles", Arc::clone(&tracker));
        let jobs = array.jobs().await.unwrap();
        assert_eq!(jobs.len(), 3);

        array.terminate().await.unwrap();
        for job in &jobs {
            job.wait_terminated(Duration::from_secs(5)).await.unwrap();
        }
        assert_eq!(array.state().await, JobState::Failed);
        assert!(matches!(
            array.hold().await,
            Err(TrackerError::Unsupported(_))
        ));
    }
}
