//! Helpers for backends without native array jobs or state events.

use std::time::Duration;

use tracing::debug;

use super::{JobState, JobTracker};
use crate::error::TrackerError;
use crate::template::JobTemplate;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Decode an array id built by [`ids_to_array_id`].
pub fn array_id_to_ids(array_id: &str) -> Result<Vec<String>, TrackerError> {
    serde_json::from_str(array_id).map_err(|e| {
        TrackerError::InvalidArgument(format!("{array_id} is not a JSON array job id: {e}"))
    })
}

/// JSON-encode single job ids into one array id.
pub fn ids_to_array_id(ids: &[String]) -> String {
    // string slices have no failing Serialize impl
    serde_json::to_string(ids).expect("a list of strings always serializes")
}

/// Submit `begin..=end` (by `step`) as individual jobs and return the ids as
/// one JSON array id. On failure the error carries the ids submitted so far
/// in its message.
pub async fn add_array_job_as_single_jobs(
    tracker: &dyn JobTracker,
    template: &JobTemplate,
    begin: i64,
    end: i64,
    step: i64,
) -> Result<String, TrackerError> {
    let step = if step <= 0 { 1 } else { step };
    let mut ids = Vec::new();
    for index in (begin..=end).step_by(step as usize) {
        let mut task = template.clone();
        task.job_environment
            .insert("TASK_ID".to_string(), index.to_string());
        match tracker.add_job(task).await {
            Ok(id) => ids.push(id),
            Err(e) => {
                return Err(TrackerError::Internal(format!(
                    "submitted {} before failing: {e}",
                    ids_to_array_id(&ids)
                )));
            }
        }
    }
    debug!(jobs = ids.len(), "Array job submitted as single jobs");
    Ok(ids_to_array_id(&ids))
}

pub fn is_in_expected_state(state: JobState, states: &[JobState]) -> bool {
    state.is_in(states)
}

/// Poll `tracker` until `id` is in one of `states`. A zero timeout waits
/// without limit.
pub async fn wait_for_state(
    tracker: &dyn JobTracker,
    id: &str,
    timeout: Duration,
    states: &[JobState],
) -> Result<(), TrackerError> {
    if is_in_expected_state(tracker.job_state(id).await, states) {
        return Ok(());
    }

    let poll = async {
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        loop {
            ticker.tick().await;
            if is_in_expected_state(tracker.job_state(id).await, states) {
                return;
            }
        }
    };
    if timeout.is_zero() {
        poll.await;
        return Ok(());
    }
    tokio::time::timeout(timeout, poll)
        .await
        .map_err(|_| TrackerError::Timeout { id: id.to_string() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::ProcessTracker;

    #[test]
    fn test_array_id_encoding() {
        let ids = vec!["1".to_string(), "2".to_string(), "17".to_string()];
        let array_id = ids_to_array_id(&ids);
        assert_eq!(array_id, r#"["1","2","17"]"#);
        assert_eq!(array_id_to_ids(&array_id).unwrap(), ids);
        assert_eq!(ids_to_array_id(&[]), "[]");
        assert!(array_id_to_ids("12").is_err());
    }

    #[test]
    fn test_is_in_expected_state() {
        assert!(is_in_expected_state(
            JobState::Done,
            &[JobState::Failed, JobState::Done]
        ));
        assert!(!is_in_expected_state(JobState::Running, &[]));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_single_job_array_and_polling() {
        let tracker = ProcessTracker::new("helpers");
        let template = JobTemplate::command("/bin/sh", ["-c", "test -n \"$TASK_ID\""]);
        let array_id = add_array_job_as_single_jobs(&tracker, &template, 1, 3, 1)
            .await
            .unwrap();
        let ids = array_id_to_ids(&array_id).unwrap();
        assert_eq!(ids.len(), 3);

        for id in &ids {
            wait_for_state(
                &tracker,
                id,
                Duration::from_secs(10),
                &[JobState::Done, JobState::Failed],
            )
            .await
            .unwrap();
            assert_eq!(tracker.job_state(id).await, JobState::Done);
        }

        let err = wait_for_state(&tracker, "999", Duration::from_millis(250), &[JobState::Done])
            .await
            .unwrap_err();
        assert!(matches!(err, TrackerError::Timeout { .. }));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_zero_timeout_waits_without_limit() {
        let tracker = ProcessTracker::new("helpers-zero");
        let id = tracker
            .add_job(JobTemplate::command("sleep", ["0.3"]))
            .await
            .unwrap();

        tokio::time::timeout(
            Duration::from_secs(10),
            wait_for_state(&tracker, &id, Duration::ZERO, &[JobState::Done]),
        )
        .await
        .expect("job finished")
        .unwrap();
        assert_eq!(tracker.job_state(&id).await, JobState::Done);

        // an unknown job never gets there, so only the outer timeout ends it
        let pending = tokio::time::timeout(
            Duration::from_millis(300),
            wait_for_state(&tracker, "999", Duration::ZERO, &[JobState::Done]),
        )
        .await;
        assert!(pending.is_err());
    }
}
