//! Job trackers: the backend contract and the local process implementation.

mod array;
pub mod helpers;
pub mod id;
mod local;
mod process;
pub mod pubsub;
mod state;
pub mod store;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::TrackerError;
use crate::template::JobTemplate;

pub use helpers::{
    add_array_job_as_single_jobs, array_id_to_ids, ids_to_array_id, is_in_expected_state,
    wait_for_state,
};
pub use local::ProcessTracker;
pub use state::{JobInfo, JobState};

/// Control requests a tracker can receive for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    Suspend,
    Resume,
    Hold,
    Release,
    Terminate,
}

impl std::fmt::Display for ControlAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Suspend => "suspend",
            Self::Resume => "resume",
            Self::Hold => "hold",
            Self::Release => "release",
            Self::Terminate => "terminate",
        };
        write!(f, "{s}")
    }
}

/// The contract every execution backend implements.
///
/// A `timeout` of [`Duration::ZERO`] in [`JobTracker::wait`] means "wait
/// forever".
#[async_trait]
pub trait JobTracker: Send + Sync {
    /// Ids of all jobs and array jobs known to the tracker.
    async fn list_jobs(&self) -> Result<Vec<String>, TrackerError>;

    /// Submit a single job and return its id.
    async fn add_job(&self, template: JobTemplate) -> Result<String, TrackerError>;

    /// Submit tasks `begin, begin + step, ..., <= end` and return the array id.
    /// `max_parallel <= 0` means no throttle.
    async fn add_array_job(
        &self,
        template: JobTemplate,
        begin: i64,
        end: i64,
        step: i64,
        max_parallel: i64,
    ) -> Result<String, TrackerError>;

    /// Task ids of an array job.
    async fn list_array_jobs(&self, array_id: &str) -> Result<Vec<String>, TrackerError>;

    /// Current state; `Undetermined` for unknown ids.
    async fn job_state(&self, id: &str) -> JobState;

    async fn job_info(&self, id: &str) -> Result<JobInfo, TrackerError>;

    /// The template a job was submitted with.
    async fn job_template(&self, id: &str) -> Result<JobTemplate, TrackerError>;

    async fn job_control(&self, id: &str, action: ControlAction) -> Result<(), TrackerError>;

    /// Block until the job is in one of `states` or `timeout` passes.
    async fn wait(&self, id: &str, timeout: Duration, states: &[JobState])
    -> Result<(), TrackerError>;

    /// Forget a finished job.
    async fn delete_job(&self, id: &str) -> Result<(), TrackerError>;

    async fn list_job_categories(&self) -> Result<Vec<String>, TrackerError>;

    /// Stop accepting work and release background resources.
    async fn shutdown(&self) -> Result<(), TrackerError> {
        Ok(())
    }
}
