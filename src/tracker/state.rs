//! Job states and per-job result records.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// State of a job as reported by a tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Never set.
    #[default]
    Unset,
    /// The tracker does not know the job.
    Undetermined,
    /// Accepted, not started yet.
    Queued,
    QueuedHeld,
    /// The process is alive.
    Running,
    /// Stopped by a suspend request.
    Suspended,
    Requeued,
    RequeuedHeld,
    /// Exited with status 0.
    Done,
    /// Exited with a non-zero status, was killed, or never started.
    Failed,
}

impl JobState {
    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// True if `self` is one of `expected`.
    pub fn is_in(&self, expected: &[JobState]) -> bool {
        expected.contains(self)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unset => "unset",
            Self::Undetermined => "undetermined",
            Self::Queued => "queued",
            Self::QueuedHeld => "queued_held",
            Self::Running => "running",
            Self::Suspended => "suspended",
            Self::Requeued => "requeued",
            Self::RequeuedHeld => "requeued_held",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Observable result of a job.
///
/// `cpu_time` and `slots` use `None` for "unset"; every other field uses its
/// empty value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobInfo {
    pub id: String,
    /// Exit status of the process, -1 when it could not be determined.
    pub exit_status: i32,
    pub terminating_signal: String,
    pub state: JobState,
    pub sub_state: String,
    pub allocated_machines: Vec<String>,
    pub submission_machine: String,
    pub job_owner: String,
    pub slots: Option<i64>,
    pub queue_name: String,
    pub wallclock_time: Option<Duration>,
    /// User plus system CPU seconds.
    pub cpu_time: Option<i64>,
    pub submission_time: Option<DateTime<Utc>>,
    pub dispatch_time: Option<DateTime<Utc>>,
    pub finish_time: Option<DateTime<Utc>>,
    pub extension_list: HashMap<String, String>,
}

impl JobInfo {
    /// Minimal info attached to a freshly queued job.
    pub fn queued(id: impl Into<String>, submission_time: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            state: JobState::Queued,
            submission_time: Some(submission_time),
            ..Default::default()
        }
    }

    /// Best-effort info for a job that failed without a usable process result.
    pub fn failed(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            exit_status: -1,
            state: JobState::Failed,
            finish_time: Some(Utc::now()),
            ..Default::default()
        }
    }

    /// Fold `newer` into `self`. Fields carried by `newer` win, unset fields
    /// keep what was known before.
    pub fn merge(&mut self, newer: &JobInfo) {
        if !newer.id.is_empty() {
            self.id = newer.id.clone();
        }
        if newer.exit_status != 0 || newer.state.is_terminal() {
            self.exit_status = newer.exit_status;
        }
        if !newer.terminating_signal.is_empty() {
            self.terminating_signal = newer.terminating_signal.clone();
        }
        if newer.state != JobState::Unset {
            self.state = newer.state;
        }
        if !newer.sub_state.is_empty() {
            self.sub_state = newer.sub_state.clone();
        }
        if !newer.allocated_machines.is_empty() {
            self.allocated_machines = newer.allocated_machines.clone();
        }
        if !newer.submission_machine.is_empty() {
            self.submission_machine = newer.submission_machine.clone();
        }
        if !newer.job_owner.is_empty() {
            self.job_owner = newer.job_owner.clone();
        }
        if newer.slots.is_some() {
            self.slots = newer.slots;
        }
        if !newer.queue_name.is_empty() {
            self.queue_name = newer.queue_name.clone();
        }
        if newer.wallclock_time.is_some() {
            self.wallclock_time = newer.wallclock_time;
        }
        if newer.cpu_time.is_some() {
            self.cpu_time = newer.cpu_time;
        }
        if newer.submission_time.is_some() {
            self.submission_time = newer.submission_time;
        }
        if newer.dispatch_time.is_some() {
            self.dispatch_time = newer.dispatch_time;
        }
        if newer.finish_time.is_some() {
            self.finish_time = newer.finish_time;
        }
        for (k, v) in &newer.extension_list {
            self.extension_list.insert(k.clone(), v.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(JobState::Done.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(!JobState::Running.is_terminal());
        assert!(!JobState::Queued.is_terminal());
        assert!(!JobState::Undetermined.is_terminal());
    }

    #[test]
    fn test_display_and_serde_agree() {
        let json = serde_json::to_string(&JobState::QueuedHeld).unwrap();
        assert_eq!(json, "\"queued_held\"");
        assert_eq!(JobState::QueuedHeld.to_string(), "queued_held");
    }

    #[test]
    fn test_merge_keeps_earlier_fields() {
        let submitted = Utc::now();
        let mut info = JobInfo::queued("7", submitted);

        let dispatched = Utc::now();
        info.merge(&JobInfo {
            state: JobState::Running,
            dispatch_time: Some(dispatched),
            allocated_machines: vec!["node1".into()],
            ..Default::default()
        });
        assert_eq!(info.id, "7");
        assert_eq!(info.state, JobState::Running);
        assert_eq!(info.submission_time, Some(submitted));
        assert_eq!(info.dispatch_time, Some(dispatched));

        info.merge(&JobInfo {
            state: JobState::Done,
            exit_status: 0,
            slots: Some(1),
            ..Default::default()
        });
        assert_eq!(info.state, JobState::Done);
        assert_eq!(info.slots, Some(1));
        assert_eq!(info.allocated_machines, vec!["node1".to_string()]);
        assert_eq!(info.cpu_time, None);
    }
}
