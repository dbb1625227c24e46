//! Hand finished job chains from one task to another.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::NOTIFIER_CAPACITY;
use crate::job::Job;

struct NotifierInner {
    tx: Mutex<Option<mpsc::Sender<Job>>>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Job>>,
}

/// Bounded queue of jobs. Clones share the queue.
#[derive(Clone)]
pub struct Notifier {
    inner: Arc<NotifierInner>,
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(NOTIFIER_CAPACITY);
        Self {
            inner: Arc::new(NotifierInner {
                tx: Mutex::new(Some(tx)),
                rx: tokio::sync::Mutex::new(rx),
            }),
        }
    }

    fn sender(&self) -> Option<mpsc::Sender<Job>> {
        self.inner
            .tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Queue `job`. Blocks while the queue is full; dropped when the
    /// notifier was destroyed.
    pub async fn send_job(&self, job: Job) {
        let Some(tx) = self.sender() else {
            warn!(tag = %job.tag(), "Notifier destroyed, dropping job");
            return;
        };
        if tx.send(job).await.is_err() {
            warn!("Notifier receiver gone, dropping job");
        }
    }

    /// Next queued job, `None` once the notifier is destroyed and drained.
    pub async fn receive_job(&self) -> Option<Job> {
        self.inner.rx.lock().await.recv().await
    }

    /// Stop accepting jobs. Already queued jobs can still be received.
    pub fn destroy(&self) {
        if self
            .inner
            .tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .is_some()
        {
            debug!("Notifier destroyed");
        }
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("destroyed", &self.sender().is_none())
            .finish()
    }
}

impl Job {
    /// Send a copy of this chain to `notifier` and keep going.
    pub async fn notify(self, notifier: &Notifier) -> Self {
        notifier.send_job(self.clone()).await;
        self
    }
}
