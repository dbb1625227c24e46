//! Tracker that runs jobs as local operating-system processes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use nix::sys::signal::Signal;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::array;
use super::id::JobIdAllocator;
use super::process::{self, Launch};
use super::pubsub::{JobEvent, PubSub, Registration};
use super::store::{JobStore, split_task_id, task_id};
use super::{ControlAction, JobInfo, JobState, JobTracker};
use crate::error::TrackerError;
use crate::template::JobTemplate;

/// Shared between the tracker handle and its array controllers.
pub(super) struct TrackerInner {
    pub(super) session: String,
    pub(super) store: Mutex<JobStore>,
    pub(super) bus: PubSub,
    ids: JobIdAllocator,
    shut_down: AtomicBool,
    book_keeper: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl TrackerInner {
    pub(super) fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}

/// Local process tracker.
///
/// Must be created inside a tokio runtime: it spawns the pub/sub
/// book-keeper on construction.
#[derive(Clone)]
pub struct ProcessTracker {
    inner: Arc<TrackerInner>,
}

impl ProcessTracker {
    pub fn new(session: impl Into<String>) -> Self {
        let (bus, book_keeper) = PubSub::start();
        let session = session.into();
        debug!(session = %session, "Process tracker created");
        Self {
            inner: Arc::new(TrackerInner {
                session,
                store: Mutex::new(JobStore::new()),
                bus,
                ids: JobIdAllocator::new(),
                shut_down: AtomicBool::new(false),
                book_keeper: std::sync::Mutex::new(Some(book_keeper)),
            }),
        }
    }

    /// Name of the job session this tracker belongs to.
    pub fn session_name(&self) -> &str {
        &self.inner.session
    }

    fn ensure_open(&self) -> Result<(), TrackerError> {
        if self.inner.is_shut_down() {
            return Err(TrackerError::ShutDown);
        }
        Ok(())
    }

    fn current_state(&self, id: &str) -> JobState {
        self.inner.bus.state(id).unwrap_or(JobState::Undetermined)
    }

    fn array_state(&self, array_id: &str, store: &JobStore) -> JobState {
        let Some(tasks) = store.array_task_ids(array_id) else {
            return JobState::Undetermined;
        };
        let states: Vec<JobState> = tasks.iter().map(|t| self.current_state(t)).collect();
        if states.iter().all(JobState::is_terminal) {
            if states.contains(&JobState::Failed) {
                JobState::Failed
            } else {
                JobState::Done
            }
        } else if states
            .iter()
            .any(|s| matches!(s, JobState::Running | JobState::Suspended))
        {
            JobState::Running
        } else {
            JobState::Queued
        }
    }

    async fn wait_single(
        &self,
        id: &str,
        timeout: Duration,
        states: &[JobState],
    ) -> Result<(), TrackerError> {
        let mut rx = match self.inner.bus.register(id, states)? {
            Registration::Ready(_) => return Ok(()),
            Registration::Waiting(rx) => rx,
        };
        let received = if timeout.is_zero() {
            rx.recv().await
        } else {
            tokio::time::timeout(timeout, rx.recv())
                .await
                .map_err(|_| TrackerError::Timeout { id: id.to_string() })?
        };
        match received {
            Some(_) => Ok(()),
            None => Err(TrackerError::ShutDown),
        }
    }
}

impl std::fmt::Debug for ProcessTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessTracker")
            .field("session", &self.inner.session)
            .field("shut_down", &self.inner.is_shut_down())
            .finish()
    }
}

#[async_trait]
impl JobTracker for ProcessTracker {
    async fn list_jobs(&self) -> Result<Vec<String>, TrackerError> {
        Ok(self.inner.store.lock().await.job_ids().to_vec())
    }

    async fn add_job(&self, mut template: JobTemplate) -> Result<String, TrackerError> {
        self.ensure_open()?;
        let mut store = self.inner.store.lock().await;
        let id = self.inner.ids.next_id();
        // placeholders the submitter left in place get the job id
        template.expand_task_id(&id);
        let submitted = Utc::now();
        self.inner
            .bus
            .notify_and_wait(JobEvent::new(
                &id,
                JobState::Queued,
                JobInfo::queued(&id, submitted),
            ))
            .await;

        let launch = Launch {
            job_id: &id,
            task_index: None,
            template: &template,
            submission_time: submitted,
        };
        match process::start_process(launch, &self.inner.bus).await {
            Ok(pid) => {
                store.save_job(&id, template, pid);
                Ok(id)
            }
            Err(e) => {
                warn!(job_id = %id, error = %e, "Job submission failed");
                self.inner
                    .bus
                    .notify_and_wait(JobEvent::new(&id, JobState::Failed, JobInfo::failed(&id)))
                    .await;
                Err(e)
            }
        }
    }

    async fn add_array_job(
        &self,
        template: JobTemplate,
        begin: i64,
        end: i64,
        step: i64,
        max_parallel: i64,
    ) -> Result<String, TrackerError> {
        self.ensure_open()?;
        let step = if step <= 0 { 1 } else { step };
        let indices: Vec<i64> = (begin..=end).step_by(step as usize).collect();
        if indices.is_empty() {
            return Err(TrackerError::InvalidArgument(format!(
                "array job {begin}..={end} has no tasks"
            )));
        }
        template
            .validate()
            .map_err(|e| TrackerError::InvalidArgument(e.to_string()))?;

        let mut store = self.inner.store.lock().await;
        let array_id = self.inner.ids.next_id();
        let submitted = Utc::now();
        for &index in &indices {
            let id = task_id(&array_id, index);
            self.inner.bus.publish(JobEvent::new(
                &id,
                JobState::Queued,
                JobInfo::queued(&id, submitted),
            ));
        }
        self.inner.bus.flush().await;
        store.save_array_job(&array_id, template.clone(), &indices);
        drop(store);

        info!(
            array_id = %array_id,
            tasks = indices.len(),
            max_parallel,
            "Array job accepted"
        );
        let first = array::spawn_controller(
            Arc::clone(&self.inner),
            array_id.clone(),
            template,
            indices,
            submitted,
            max_parallel,
        );
        match first.await {
            Ok(Ok(())) => Ok(array_id),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(TrackerError::Internal(format!(
                "array controller of job {array_id} stopped unexpectedly"
            ))),
        }
    }

    async fn list_array_jobs(&self, array_id: &str) -> Result<Vec<String>, TrackerError> {
        self.inner
            .store
            .lock()
            .await
            .array_task_ids(array_id)
            .ok_or_else(|| TrackerError::NotFound {
                id: array_id.to_string(),
            })
    }

    async fn job_state(&self, id: &str) -> JobState {
        let store = self.inner.store.lock().await;
        if store.is_array_job(id) {
            return self.array_state(id, &store);
        }
        self.current_state(id)
    }

    async fn job_info(&self, id: &str) -> Result<JobInfo, TrackerError> {
        let store = self.inner.store.lock().await;
        if store.is_array_job(id) {
            let state = self.array_state(id, &store);
            return Ok(JobInfo {
                id: id.to_string(),
                state,
                ..Default::default()
            });
        }
        drop(store);
        self.inner
            .bus
            .info(id)
            .ok_or_else(|| TrackerError::NotFound { id: id.to_string() })
    }

    async fn job_template(&self, id: &str) -> Result<JobTemplate, TrackerError> {
        let store = self.inner.store.lock().await;
        let mut template = store
            .template_of(id)
            .cloned()
            .ok_or_else(|| TrackerError::NotFound { id: id.to_string() })?;
        if let (_, Some(_)) = split_task_id(id) {
            template.expand_task_id(id);
        }
        Ok(template)
    }

    async fn job_control(&self, id: &str, action: ControlAction) -> Result<(), TrackerError> {
        if matches!(action, ControlAction::Hold | ControlAction::Release) {
            return Err(TrackerError::Unsupported(format!(
                "{action} is not supported for local processes"
            )));
        }

        let mut store = self.inner.store.lock().await;
        if !store.has_job(id) {
            return Err(TrackerError::NotFound { id: id.to_string() });
        }
        if store.is_array_job(id) {
            return Err(TrackerError::InvalidArgument(format!(
                "{action} addresses single tasks, {id} is an array job"
            )));
        }
        let state = self.current_state(id);
        let pid = store.pid_of(id).unwrap_or(0);

        match action {
            ControlAction::Suspend => {
                if state != JobState::Running || pid == 0 {
                    return Err(TrackerError::NotRunning { id: id.to_string() });
                }
                process::signal_group(id, pid, Signal::SIGSTOP)?;
                self.inner
                    .bus
                    .notify_and_wait(JobEvent::state_change(id, JobState::Suspended))
                    .await;
            }
            ControlAction::Resume => {
                if state != JobState::Suspended || pid == 0 {
                    return Err(TrackerError::NotSuspended { id: id.to_string() });
                }
                process::signal_group(id, pid, Signal::SIGCONT)?;
                self.inner
                    .bus
                    .notify_and_wait(JobEvent::state_change(id, JobState::Running))
                    .await;
            }
            ControlAction::Terminate => {
                if state.is_terminal() {
                    return Err(TrackerError::AlreadyFinished {
                        id: id.to_string(),
                        state,
                    });
                }
                if pid == 0 {
                    // never started: cancel, the array controller skips it
                    if let (base, Some(index)) = split_task_id(id) {
                        store.mark_array_task_failed(base, index);
                    }
                    let mut info = JobInfo::failed(id);
                    info.sub_state = "cancelled".to_string();
                    self.inner
                        .bus
                        .notify_and_wait(JobEvent::new(id, JobState::Failed, info))
                        .await;
                } else {
                    process::signal_group(id, pid, Signal::SIGKILL)?;
                    self.inner
                        .bus
                        .notify_and_wait(JobEvent::new(id, JobState::Failed, JobInfo::failed(id)))
                        .await;
                }
            }
            ControlAction::Hold | ControlAction::Release => unreachable!("rejected above"),
        }
        info!(job_id = %id, action = %action, "Job control applied");
        Ok(())
    }

    async fn wait(
        &self,
        id: &str,
        timeout: Duration,
        states: &[JobState],
    ) -> Result<(), TrackerError> {
        let tasks = {
            let store = self.inner.store.lock().await;
            if !store.has_job(id) {
                return Err(TrackerError::NotFound { id: id.to_string() });
            }
            store.array_task_ids(id)
        };

        match tasks {
            None => self.wait_single(id, timeout, states).await,
            Some(tasks) => {
                let deadline = tokio::time::Instant::now() + timeout;
                for task in tasks {
                    let remaining = if timeout.is_zero() {
                        Duration::ZERO
                    } else {
                        let left = deadline.saturating_duration_since(tokio::time::Instant::now());
                        if left.is_zero() {
                            return Err(TrackerError::Timeout { id: id.to_string() });
                        }
                        left
                    };
                    self.wait_single(&task, remaining, states).await?;
                }
                Ok(())
            }
        }
    }

    async fn delete_job(&self, id: &str) -> Result<(), TrackerError> {
        let mut store = self.inner.store.lock().await;
        if !store.has_job(id) {
            return Err(TrackerError::NotFound { id: id.to_string() });
        }

        let keys = store.state_keys(id);
        for key in &keys {
            // an array id has no bus state of its own
            if store.is_array_job(key) {
                continue;
            }
            let state = self.current_state(key);
            if !state.is_terminal() {
                return Err(TrackerError::NotTerminal {
                    id: key.clone(),
                    state,
                });
            }
        }
        for key in &keys {
            self.inner.bus.unregister(key);
        }
        match split_task_id(id) {
            (array_id, Some(index)) => {
                if store.remove_array_task(array_id, index) {
                    self.inner.bus.unregister(array_id);
                    debug!(array_id = %array_id, "Last task reaped, array removed");
                }
            }
            (_, None) => store.remove_job(id),
        }
        debug!(job_id = %id, "Job deleted");
        Ok(())
    }

    async fn list_job_categories(&self) -> Result<Vec<String>, TrackerError> {
        Ok(Vec::new())
    }

    async fn shutdown(&self) -> Result<(), TrackerError> {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // wait for in-flight submissions before draining the bus
        drop(self.inner.store.lock().await);
        self.inner.bus.close().await;
        let handle = self
            .inner
            .book_keeper
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            handle
                .await
                .map_err(|e| TrackerError::Internal(format!("book-keeper panicked: {e}")))?;
        }
        info!(session = %self.inner.session, "Process tracker shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> JobTemplate {
        JobTemplate::command("/bin/sh", ["-c", script])
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_add_job_and_wait() {
        let tracker = ProcessTracker::new("test");
        let id = tracker.add_job(sh("exit 0")).await.unwrap();
        let state = tracker.job_state(&id).await;
        assert!(matches!(state, JobState::Queued | JobState::Running | JobState::Done));

        tracker
            .wait(&id, Duration::ZERO, &[JobState::Done, JobState::Failed])
            .await
            .unwrap();
        assert_eq!(tracker.job_state(&id).await, JobState::Done);

        let info = tracker.job_info(&id).await.unwrap();
        assert_eq!(info.exit_status, 0);
        assert_eq!(info.id, id);
        assert!(info.submission_time.is_some());
        assert_eq!(
            info.wallclock_time,
            (info.finish_time.unwrap() - info.dispatch_time.unwrap()).to_std().ok()
        );
        assert_eq!(tracker.list_jobs().await.unwrap(), vec![id.clone()]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failed_exit_status() {
        let tracker = ProcessTracker::new("test");
        let id = tracker.add_job(sh("exit 3")).await.unwrap();
        tracker
            .wait(&id, Duration::ZERO, &[JobState::Done, JobState::Failed])
            .await
            .unwrap();
        assert_eq!(tracker.job_state(&id).await, JobState::Failed);
        assert_eq!(tracker.job_info(&id).await.unwrap().exit_status, 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_spawn_failure() {
        let tracker = ProcessTracker::new("test");
        let err = tracker
            .add_job(JobTemplate::command("/no/such/binary", Vec::<String>::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, TrackerError::Internal(_)));
        assert!(tracker.list_jobs().await.unwrap().is_empty());

        let err = tracker.add_job(JobTemplate::default()).await.unwrap_err();
        assert!(matches!(err, TrackerError::InvalidArgument(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_wait_timeout_and_unknown() {
        let tracker = ProcessTracker::new("test");
        let id = tracker.add_job(sh("sleep 5")).await.unwrap();
        let err = tracker
            .wait(&id, Duration::from_millis(50), &[JobState::Done])
            .await
            .unwrap_err();
        assert!(matches!(err, TrackerError::Timeout { .. }));

        let err = tracker
            .wait("4242", Duration::ZERO, &[JobState::Done])
            .await
            .unwrap_err();
        assert!(matches!(err, TrackerError::NotFound { .. }));
        assert_eq!(tracker.job_state("4242").await, JobState::Undetermined);

        tracker
            .job_control(&id, ControlAction::Terminate)
            .await
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_suspend_resume_terminate() {
        let tracker = ProcessTracker::new("test");
        let id = tracker.add_job(sh("sleep 10")).await.unwrap();

        let err = tracker
            .job_control(&id, ControlAction::Resume)
            .await
            .unwrap_err();
        assert!(matches!(err, TrackerError::NotSuspended { .. }));

        tracker.job_control(&id, ControlAction::Suspend).await.unwrap();
        assert_eq!(tracker.job_state(&id).await, JobState::Suspended);
        let err = tracker
            .job_control(&id, ControlAction::Suspend)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "job is not running");

        tracker.job_control(&id, ControlAction::Resume).await.unwrap();
        assert_eq!(tracker.job_state(&id).await, JobState::Running);

        let err = tracker
            .job_control(&id, ControlAction::Hold)
            .await
            .unwrap_err();
        assert!(matches!(err, TrackerError::Unsupported(_)));

        tracker
            .job_control(&id, ControlAction::Terminate)
            .await
            .unwrap();
        tracker
            .wait(&id, Duration::from_secs(5), &[JobState::Failed])
            .await
            .unwrap();
        assert_eq!(tracker.job_state(&id).await, JobState::Failed);

        // the supervisor's report lands eventually and carries the signal
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let info = tracker.job_info(&id).await.unwrap();
            if info.terminating_signal == "SIGKILL" {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "no SIGKILL recorded");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_delete_requires_terminal() {
        let tracker = ProcessTracker::new("test");
        let id = tracker.add_job(sh("sleep 10")).await.unwrap();
        let err = tracker.delete_job(&id).await.unwrap_err();
        assert!(matches!(err, TrackerError::NotTerminal { .. }));

        tracker
            .job_control(&id, ControlAction::Terminate)
            .await
            .unwrap();
        tracker.delete_job(&id).await.unwrap();
        assert!(tracker.list_jobs().await.unwrap().is_empty());
        assert_eq!(tracker.job_state(&id).await, JobState::Undetermined);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_reaping_every_task_removes_array() {
        let tracker = ProcessTracker::new("test");
        let array_id = tracker.add_array_job(sh("exit 0"), 1, 2, 1, 0).await.unwrap();
        tracker
            .wait(&array_id, Duration::from_secs(10), &[JobState::Done, JobState::Failed])
            .await
            .unwrap();

        tracker.delete_job(&format!("{array_id}.1")).await.unwrap();
        assert_eq!(tracker.list_jobs().await.unwrap(), vec![array_id.clone()]);
        assert_eq!(tracker.list_array_jobs(&array_id).await.unwrap().len(), 1);

        tracker.delete_job(&format!("{array_id}.2")).await.unwrap();
        assert!(tracker.list_jobs().await.unwrap().is_empty());
        assert_eq!(tracker.job_state(&array_id).await, JobState::Undetermined);
        assert!(matches!(
            tracker.wait(&array_id, Duration::ZERO, &[JobState::Done]).await,
            Err(TrackerError::NotFound { .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_array_job() {
        let tracker = ProcessTracker::new("test");
        let array_id = tracker
            .add_array_job(sh("exit 0"), 1, 5, 2, 0)
            .await
            .unwrap();
        let tasks = tracker.list_array_jobs(&array_id).await.unwrap();
        assert_eq!(
            tasks,
            vec![
                format!("{array_id}.1"),
                format!("{array_id}.3"),
                format!("{array_id}.5")
            ]
        );
        tracker
            .wait(&array_id, Duration::from_secs(10), &[JobState::Done, JobState::Failed])
            .await
            .unwrap();
        assert_eq!(tracker.job_state(&array_id).await, JobState::Done);
        tracker.delete_job(&array_id).await.unwrap();

        let err = tracker
            .add_array_job(sh("exit 0"), 5, 1, 1, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, TrackerError::InvalidArgument(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_task_template_expansion() {
        let dir = tempfile::tempdir().unwrap();
        let mut template = sh("echo $TASK_ID");
        template.output_path = format!("{}/task-{{{{.ID}}}}.out", dir.path().display());
        let tracker = ProcessTracker::new("test");
        let array_id = tracker.add_array_job(template, 1, 2, 1, 1).await.unwrap();
        tracker
            .wait(&array_id, Duration::from_secs(10), &[JobState::Done, JobState::Failed])
            .await
            .unwrap();

        let task = format!("{array_id}.2");
        let stored = tracker.job_template(&task).await.unwrap();
        assert!(!stored.has_task_id_placeholder());
        let output = std::fs::read_to_string(&stored.output_path).unwrap();
        assert_eq!(output.trim_end(), "2");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_shutdown_rejects_new_work() {
        let tracker = ProcessTracker::new("test");
        let id = tracker.add_job(sh("exit 0")).await.unwrap();
        tracker
            .wait(&id, Duration::ZERO, &[JobState::Done])
            .await
            .unwrap();
        tracker.shutdown().await.unwrap();
        tracker.shutdown().await.unwrap();

        let err = tracker.add_job(sh("exit 0")).await.unwrap_err();
        assert_eq!(err, TrackerError::ShutDown);
        // terminal state survives the shutdown
        assert_eq!(tracker.job_state(&id).await, JobState::Done);
    }
}
