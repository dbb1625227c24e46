//! Job state publish/subscribe bus.
//!
//! A single book-keeping task consumes [`JobEvent`]s in order, wakes every
//! waiter interested in the new state, and records the latest state and
//! [`JobInfo`] per job id. Because the latest state is retained, a waiter that
//! registers after a job has already reached the awaited state is answered
//! immediately instead of blocking forever.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::{JobInfo, JobState};
use crate::error::TrackerError;

/// A state transition of one job.
#[derive(Debug, Clone)]
pub struct JobEvent {
    pub job_id: String,
    pub state: JobState,
    pub info: JobInfo,
}

impl JobEvent {
    pub fn new(job_id: impl Into<String>, state: JobState, info: JobInfo) -> Self {
        Self {
            job_id: job_id.into(),
            state,
            info,
        }
    }

    /// Event that only changes the state.
    pub fn state_change(job_id: impl Into<String>, state: JobState) -> Self {
        let job_id = job_id.into();
        let info = JobInfo {
            id: job_id.clone(),
            state,
            ..Default::default()
        };
        Self::new(job_id, state, info)
    }
}

/// Outcome of [`PubSub::register`].
#[derive(Debug)]
pub enum Registration {
    /// The job is already in this (requested) state.
    Ready(JobState),
    /// Receives the first matching state the book-keeper processes.
    Waiting(mpsc::Receiver<JobState>),
}

struct WaitRequest {
    expected: Vec<JobState>,
    tx: mpsc::Sender<JobState>,
}

#[derive(Default)]
struct BusState {
    job_state: HashMap<String, JobState>,
    job_info: HashMap<String, JobInfo>,
    waiters: HashMap<String, Vec<WaitRequest>>,
    closed: bool,
}

enum BusMessage {
    Event(JobEvent, Option<oneshot::Sender<()>>),
    Flush(oneshot::Sender<()>),
    Close(oneshot::Sender<()>),
}

/// Handle to the bus. Clones share the same book-keeper.
#[derive(Clone)]
pub struct PubSub {
    state: Arc<Mutex<BusState>>,
    tx: mpsc::UnboundedSender<BusMessage>,
}

impl PubSub {
    /// Create the bus and spawn its book-keeping task on the current runtime.
    pub fn start() -> (Self, JoinHandle<()>) {
        let state = Arc::new(Mutex::new(BusState::default()));
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(book_keeper(Arc::clone(&state), rx));
        (Self { state, tx }, handle)
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue an event without waiting for it to be processed.
    pub fn publish(&self, event: JobEvent) {
        if self.tx.send(BusMessage::Event(event, None)).is_err() {
            debug!("Event dropped, bus is closed");
        }
    }

    /// Queue an event and return once the book-keeper has applied it.
    pub async fn notify_and_wait(&self, event: JobEvent) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(BusMessage::Event(event, Some(done_tx))).is_err() {
            debug!("Event dropped, bus is closed");
            return;
        }
        let _ = done_rx.await;
    }

    /// Ask to be told when `job_id` reaches one of `states`.
    ///
    /// Fails if the job already finished in a state that is not requested.
    pub fn register(
        &self,
        job_id: &str,
        states: &[JobState],
    ) -> Result<Registration, TrackerError> {
        let mut bus = self.lock();

        if let Some(&current) = bus.job_state.get(job_id) {
            if current.is_in(states) {
                return Ok(Registration::Ready(current));
            }
            if current.is_terminal() {
                return Err(TrackerError::AlreadyFinished {
                    id: job_id.to_string(),
                    state: current,
                });
            }
        }
        if bus.closed {
            return Err(TrackerError::ShutDown);
        }

        let (tx, rx) = mpsc::channel(1);
        bus.waiters
            .entry(job_id.to_string())
            .or_default()
            .push(WaitRequest {
                expected: states.to_vec(),
                tx,
            });
        Ok(Registration::Waiting(rx))
    }

    /// Drop everything the bus knows about `job_id`.
    pub fn unregister(&self, job_id: &str) {
        let mut bus = self.lock();
        bus.job_state.remove(job_id);
        bus.job_info.remove(job_id);
        bus.waiters.remove(job_id);
    }

    /// Latest processed state of `job_id`.
    pub fn state(&self, job_id: &str) -> Option<JobState> {
        self.lock().job_state.get(job_id).copied()
    }

    /// Latest merged info of `job_id`.
    pub fn info(&self, job_id: &str) -> Option<JobInfo> {
        self.lock().job_info.get(job_id).cloned()
    }

    /// Wait until every event published before this call has been applied.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(BusMessage::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Apply pending events, then stop the book-keeper. Later events are
    /// dropped and new registrations for unknown states fail.
    pub async fn close(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(BusMessage::Close(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

impl std::fmt::Debug for PubSub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let bus = self.lock();
        f.debug_struct("PubSub")
            .field("jobs", &bus.job_state.len())
            .field("closed", &bus.closed)
            .finish()
    }
}

async fn book_keeper(state: Arc<Mutex<BusState>>, mut rx: mpsc::UnboundedReceiver<BusMessage>) {
    while let Some(msg) = rx.recv().await {
        match msg {
            BusMessage::Event(event, done) => {
                apply(&state, event);
                if let Some(done) = done {
                    let _ = done.send(());
                }
            }
            BusMessage::Flush(done) => {
                let _ = done.send(());
            }
            BusMessage::Close(done) => {
                rx.close();
                while let Ok(msg) = rx.try_recv() {
                    if let BusMessage::Event(event, done) = msg {
                        apply(&state, event);
                        if let Some(done) = done {
                            let _ = done.send(());
                        }
                    }
                }
                let mut bus = state.lock().unwrap_or_else(|e| e.into_inner());
                bus.closed = true;
                // dropping the senders wakes every remaining waiter
                bus.waiters.clear();
                drop(bus);
                let _ = done.send(());
                break;
            }
        }
    }
    debug!("Pub/sub book-keeper stopped");
}

fn apply(state: &Mutex<BusState>, event: JobEvent) {
    let mut bus = state.lock().unwrap_or_else(|e| e.into_inner());
    trace!(job_id = %event.job_id, state = %event.state, "Job event");

    // terminal states are final; a late event for another state is stale
    if let Some(&current) = bus.job_state.get(&event.job_id)
        && current.is_terminal()
        && current != event.state
    {
        debug!(
            job_id = %event.job_id,
            current = %current,
            ignored = %event.state,
            "Stale event after terminal state"
        );
        return;
    }

    if let Some(waiters) = bus.waiters.get_mut(&event.job_id) {
        // abandoned waits are dropped, everything else stays registered
        waiters.retain(|w| !w.tx.is_closed());
        for waiter in waiters.iter().filter(|w| event.state.is_in(&w.expected)) {
            let _ = waiter.tx.try_send(event.state);
        }
    }

    bus.job_state.insert(event.job_id.clone(), event.state);
    let info = bus.job_info.entry(event.job_id.clone()).or_default();
    info.merge(&event.info);
    info.state = event.state;
    if info.id.is_empty() {
        info.id = event.job_id;
    }
}
