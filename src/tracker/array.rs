//! Background controller that starts the tasks of an array job.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, oneshot};
use tracing::{debug, warn};

use super::local::TrackerInner;
use super::process::{self, Launch};
use super::pubsub::{JobEvent, PubSub, Registration};
use super::store::task_id;
use super::{JobInfo, JobState};
use crate::error::TrackerError;
use crate::template::JobTemplate;

/// Start the controller. The receiver yields the outcome of the first task.
pub(super) fn spawn_controller(
    inner: Arc<TrackerInner>,
    array_id: String,
    template: JobTemplate,
    indices: Vec<i64>,
    submission_time: DateTime<Utc>,
    max_parallel: i64,
) -> oneshot::Receiver<Result<(), TrackerError>> {
    let (first_tx, first_rx) = oneshot::channel();
    tokio::spawn(run(
        inner,
        array_id,
        template,
        indices,
        submission_time,
        max_parallel,
        first_tx,
    ));
    first_rx
}

async fn run(
    inner: Arc<TrackerInner>,
    array_id: String,
    template: JobTemplate,
    indices: Vec<i64>,
    submission_time: DateTime<Utc>,
    max_parallel: i64,
    first_tx: oneshot::Sender<Result<(), TrackerError>>,
) {
    let slots = usize::try_from(max_parallel)
        .ok()
        .filter(|&n| n > 0)
        .map(|n| Arc::new(Semaphore::new(n)));
    let mut first = Some(first_tx);

    for index in indices {
        let permit = match &slots {
            Some(slots) => match Arc::clone(slots).acquire_owned().await {
                Ok(permit) => Some(permit),
                Err(_) => break,
            },
            None => None,
        };

        let id = task_id(&array_id, index);
        let result = start_task(&inner, &array_id, &id, index, &template, submission_time).await;
        let started = matches!(result, Ok(true));
        if let Some(tx) = first.take() {
            let _ = tx.send(result.map(|_| ()));
        }

        if let (true, Some(permit)) = (started, permit) {
            tokio::spawn(release_on_finish(inner.bus.clone(), id, permit));
        }
    }

    if let Some(tx) = first.take() {
        let _ = tx.send(Ok(()));
    }
    debug!(array_id = %array_id, "Array controller finished");
}

/// Start one task. `Ok(false)` means the task was skipped because it was
/// cancelled while queued.
async fn start_task(
    inner: &TrackerInner,
    array_id: &str,
    id: &str,
    index: i64,
    template: &JobTemplate,
    submission_time: DateTime<Utc>,
) -> Result<bool, TrackerError> {
    // the store lock orders this against job_control on the same task
    let mut store = inner.store.lock().await;
    if inner.bus.state(id) == Some(JobState::Failed) {
        debug!(job_id = %id, "Skipping cancelled array task");
        return Ok(false);
    }
    if inner.is_shut_down() {
        store.mark_array_task_failed(array_id, index);
        inner
            .bus
            .publish(JobEvent::new(id, JobState::Failed, JobInfo::failed(id)));
        return Ok(false);
    }

    let mut task_template = template.clone();
    task_template.expand_task_id(id);
    let launch = Launch {
        job_id: id,
        task_index: Some(index),
        template: &task_template,
        submission_time,
    };
    match process::start_process(launch, &inner.bus).await {
        Ok(pid) => {
            store.save_array_job_pid(array_id, index, pid);
            Ok(true)
        }
        Err(e) => {
            warn!(job_id = %id, error = %e, "Array task failed to start");
            store.mark_array_task_failed(array_id, index);
            inner
                .bus
                .notify_and_wait(JobEvent::new(id, JobState::Failed, JobInfo::failed(id)))
                .await;
            Err(e)
        }
    }
}

/// Hold the parallelism slot until the task reaches a terminal state.
async fn release_on_finish(bus: PubSub, id: String, permit: OwnedSemaphorePermit) {
    if let Ok(Registration::Waiting(mut rx)) = bus.register(&id, &[JobState::Done, JobState::Failed])
    {
        rx.recv().await;
    }
    drop(permit);
}
