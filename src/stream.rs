//! Lazy job pipelines.
//!
//! A [`Stream`] submits one job per step of a [`Template`] and passes the
//! resulting chains through channel-connected stages. Every stage runs in
//! its own task; a stage whose consumer goes away stops as well.

use std::future::Future;
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::{Semaphore, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, warn};

use crate::error::{Error, StreamError};
use crate::job::Job;
use crate::template::{JobTemplate, Template};
use crate::workflow::Workflow;

/// Decides whether the stream submits the next template. Returning `false`
/// ends the stream.
pub type Break = Box<dyn FnMut(&JobTemplate) -> bool + Send>;

/// A breaker that lets `n` templates through.
pub fn sequence_breaker(n: i64) -> Break {
    let mut seq = n;
    Box::new(move |_| {
        seq -= 1;
        seq >= 0
    })
}

/// Source settings of a [`Stream`].
#[derive(Debug, Default)]
pub struct StreamConfig {
    pub workflow: Option<Workflow>,
    pub template: Option<Template>,
    /// Channel capacity between stages. Zero is treated as one.
    pub buffer_size: i64,
}

impl StreamConfig {
    /// Unpack the config; a zero buffer size becomes one.
    fn check(self) -> Result<(Workflow, Template, usize), StreamError> {
        let template = self.template.ok_or(StreamError::TemplateNotSet)?;
        let workflow = self.workflow.ok_or(StreamError::WorkflowNotSet)?;
        let buffer_size =
            usize::try_from(self.buffer_size).map_err(|_| StreamError::NegativeBufferSize)?;
        Ok((workflow, template, buffer_size.max(1)))
    }
}

/// A channel of job chains.
pub struct Stream {
    rx: mpsc::Receiver<Job>,
    buffer_size: usize,
    error: Option<Error>,
}

impl Stream {
    /// Start submitting jobs. Without a breaker the stream runs until it is
    /// dropped.
    ///
    /// An invalid config yields a stream that carries the error and no jobs.
    pub fn new(config: StreamConfig, breaker: Option<Break>) -> Self {
        let (workflow, template, buffer_size) = match config.check() {
            Ok(parts) => parts,
            Err(e) => {
                error!(error = %e, "Invalid stream config");
                let (_, rx) = mpsc::channel(1);
                return Self {
                    rx,
                    buffer_size: 1,
                    error: Some(e.into()),
                };
            }
        };
        let (tx, rx) = mpsc::channel(buffer_size);
        tokio::spawn(produce(workflow, template, breaker, tx));
        Self {
            rx,
            buffer_size,
            error: None,
        }
    }

    fn derive(&self) -> (mpsc::Sender<Job>, Self) {
        let (tx, rx) = mpsc::channel(self.buffer_size);
        (
            tx,
            Self {
                rx,
                buffer_size: self.buffer_size,
                error: self.error.clone(),
            },
        )
    }

    /// Run `f` on one job at a time. Jobs for which `f` returns `None` are
    /// dropped.
    pub fn apply<F, Fut>(self, f: F) -> Self
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<Job>> + Send + 'static,
    {
        self.map_stage(f, Some(1))
    }

    /// Run `f` on every job as soon as it arrives. Output order is not
    /// preserved.
    pub fn apply_async<F, Fut>(self, f: F) -> Self
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<Job>> + Send + 'static,
    {
        self.map_stage(f, None)
    }

    /// Like [`Stream::apply_async`] with at most `n` calls in flight.
    pub fn apply_async_n<F, Fut>(self, f: F, n: usize) -> Self
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<Job>> + Send + 'static,
    {
        self.map_stage(f, Some(n.max(1)))
    }

    fn map_stage<F, Fut>(self, f: F, limit: Option<usize>) -> Self
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<Job>> + Send + 'static,
    {
        let (tx, out) = self.derive();
        let mut rx = self.rx;
        let f = Arc::new(f);
        let permits = limit.map(|n| Arc::new(Semaphore::new(n)));
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let permit = match &permits {
                    Some(permits) => match Arc::clone(permits).acquire_owned().await {
                        Ok(permit) => Some(permit),
                        Err(_) => break,
                    },
                    None => None,
                };
                let f = Arc::clone(&f);
                let tx = tx.clone();
                tokio::spawn(async move {
                    if let Some(job) = f(job).await
                        && tx.send(job).await.is_err()
                    {
                        debug!("Stream consumer gone");
                    }
                    drop(permit);
                });
            }
        });
        out
    }

    /// Forward only the jobs `pred` accepts.
    pub fn filter(self, mut pred: impl FnMut(&Job) -> bool + Send + 'static) -> Self {
        let (tx, out) = self.derive();
        let mut rx = self.rx;
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                if pred(&job) && tx.send(job).await.is_err() {
                    break;
                }
            }
        });
        out
    }

    /// Forward every job once it finished.
    pub fn synchronize(self) -> Self {
        self.apply(|job| async move { Some(job.wait().await) })
    }

    /// Two streams carrying the same jobs. Both have to be consumed; a
    /// dropped side is skipped.
    pub fn tee(self) -> (Self, Self) {
        let (tx_a, a) = self.derive();
        let (tx_b, b) = self.derive();
        let mut rx = self.rx;
        tokio::spawn(async move {
            let mut sides = vec![tx_a, tx_b];
            while let Some(job) = rx.recv().await {
                let mut open = Vec::with_capacity(sides.len());
                for tx in sides {
                    if tx.send(job.clone()).await.is_ok() {
                        open.push(tx);
                    }
                }
                if open.is_empty() {
                    break;
                }
                sides = open;
            }
        });
        (a, b)
    }

    /// Fan this stream and `others` into one. Each input keeps its order;
    /// how they interleave is unspecified.
    pub fn merge(self, others: Vec<Stream>) -> Self {
        let (tx, mut out) = self.derive();
        if out.error.is_none() {
            out.error = others.iter().find_map(|s| s.error.clone());
        }
        let inputs = std::iter::once(self.rx)
            .chain(others.into_iter().map(|s| s.rx))
            .map(ReceiverStream::new);
        let mut merged = futures::stream::select_all(inputs);
        tokio::spawn(async move {
            while let Some(job) = merged.next().await {
                if tx.send(job).await.is_err() {
                    break;
                }
            }
        });
        out
    }

    /// Synchronize this stream and `other` independently.
    pub fn multi_sync(self, other: Stream) -> (Self, Self) {
        (self.synchronize(), other.synchronize())
    }

    /// Every remaining job. Never returns for a stream without a breaker.
    pub async fn collect(mut self) -> Vec<Job> {
        let mut jobs = Vec::new();
        while let Some(job) = self.rx.recv().await {
            jobs.push(job);
        }
        jobs
    }

    /// Up to `n` jobs; fewer when the stream ends first.
    pub async fn collect_n(&mut self, n: usize) -> Vec<Job> {
        let mut jobs = Vec::with_capacity(n);
        while jobs.len() < n {
            match self.rx.recv().await {
                Some(job) => jobs.push(job),
                None => break,
            }
        }
        jobs
    }

    /// Drain the stream and discard the jobs.
    pub async fn consume(mut self) {
        while self.rx.recv().await.is_some() {}
    }

    /// The underlying receiver.
    pub fn job_channel(self) -> mpsc::Receiver<Job> {
        self.rx
    }

    pub fn on_error(&self, f: impl FnOnce(&Error)) -> &Self {
        if let Some(e) = &self.error {
            f(e);
        }
        self
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("buffer_size", &self.buffer_size)
            .field("error", &self.error)
            .finish()
    }
}

/// Advance `template` on the blocking pool until `breaker` says stop or the
/// consumer goes away.
async fn produce(
    workflow: Workflow,
    mut template: Template,
    mut breaker: Option<Break>,
    tx: mpsc::Sender<Job>,
) {
    let mut produced = 0usize;
    loop {
        let step = tokio::task::spawn_blocking(move || {
            let jt = template.next();
            let keep = breaker.as_mut().is_none_or(|b| b(&jt));
            (template, breaker, jt, keep)
        })
        .await;
        let jt = match step {
            Ok((t, b, jt, keep)) => {
                template = t;
                breaker = b;
                if !keep {
                    break;
                }
                jt
            }
            Err(e) => {
                error!(error = %e, "Template iterator panicked, closing stream");
                break;
            }
        };
        let job = workflow.new_job().run_t(jt).await;
        if let Some(e) = job.last_error() {
            warn!(error = %e, "Stream submission failed");
        }
        if tx.send(job).await.is_err() {
            debug!("Stream consumer gone");
            break;
        }
        produced += 1;
    }
    debug!(jobs = produced, "Stream producer finished");
}
