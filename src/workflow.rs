//! Workflows: a context bound to an open job session.

use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::config::LogLevel;
use crate::context::Context;
use crate::error::{Error, WorkflowError};
use crate::job::Job;
use crate::logging;
use crate::session::JobSession;
use crate::template::{JobTemplate, Replacement};

struct WorkflowInner {
    ctx: Arc<Context>,
    session: Option<JobSession>,
    error: Option<Error>,
}

/// Factory for job chains running in one job session.
///
/// Cloning is cheap; clones share the session.
#[derive(Clone)]
pub struct Workflow {
    inner: Arc<WorkflowInner>,
}

impl Workflow {
    /// Open the context's job session, creating it when it does not exist.
    ///
    /// Failures are kept on the workflow; every job created from it carries
    /// the same error.
    pub async fn new(ctx: impl Into<Arc<Context>>) -> Self {
        let ctx = ctx.into();
        let (session, error) = match open_session(&ctx).await {
            Ok(session) => (Some(session), None),
            Err(e) => {
                error!(session = %ctx.session_name(), error = %e, "Workflow creation failed");
                (None, Some(e))
            }
        };
        Self {
            inner: Arc::new(WorkflowInner {
                ctx,
                session,
                error,
            }),
        }
    }

    pub fn context(&self) -> &Context {
        &self.inner.ctx
    }

    /// The open job session, or the error that prevented opening it.
    pub fn session(&self) -> Result<&JobSession, Error> {
        match (&self.inner.session, &self.inner.error) {
            (Some(session), _) => Ok(session),
            (None, Some(e)) => Err(e.clone()),
            (None, None) => Err(WorkflowError::SessionClosed.into()),
        }
    }

    pub fn session_name(&self) -> &str {
        self.inner
            .session
            .as_ref()
            .map(|s| s.name())
            .unwrap_or_else(|| self.inner.ctx.session_name())
    }

    /// Change the verbosity of the process-wide logger.
    pub fn set_log_level(&self, level: LogLevel) -> &Self {
        if let Err(e) = logging::set_level(level) {
            warn!(error = %e, "Could not change log level");
        }
        self
    }

    /// Call `f` with the creation error, if any.
    pub fn on_error(&self, f: impl FnOnce(&Error)) -> &Self {
        if let Some(e) = &self.inner.error {
            f(e);
        }
        self
    }

    /// Panic when the workflow could not be created.
    pub fn on_error_panic(&self) -> &Self {
        if let Some(e) = &self.inner.error {
            panic!("workflow creation failed: {e}");
        }
        self
    }

    pub fn error(&self) -> Option<&Error> {
        self.inner.error.as_ref()
    }

    pub fn has_error(&self) -> bool {
        self.inner.error.is_some()
    }

    /// An empty job chain bound to this workflow.
    pub fn new_job(&self) -> Job {
        Job::new(self.clone())
    }

    pub async fn run<I, S>(&self, command: impl Into<String>, args: I) -> Job
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.new_job().run(command, args).await
    }

    pub async fn run_t(&self, template: JobTemplate) -> Job {
        self.new_job().run_t(template).await
    }

    /// Run `command` once per index in `begin..=end` by `step`. The process
    /// backend sets `TASK_ID` for every task.
    pub async fn run_array_job<I, S>(
        &self,
        begin: i64,
        end: i64,
        step: i64,
        max_parallel: i64,
        command: impl Into<String>,
        args: I,
    ) -> Job
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.new_job()
            .run_array(begin, end, step, max_parallel, command, args)
            .await
    }

    pub async fn run_array_job_t(
        &self,
        begin: i64,
        end: i64,
        step: i64,
        max_parallel: i64,
        template: JobTemplate,
    ) -> Job {
        self.new_job()
            .run_array_t(begin, end, step, max_parallel, template)
            .await
    }

    pub async fn run_matrix_t(&self, template: JobTemplate, x: Replacement, y: Replacement) -> Job {
        self.new_job().run_matrix_t(template, x, y).await
    }

    /// One single-task chain per job the session knows about.
    pub async fn list_jobs(&self) -> Vec<Job> {
        let session = match self.session() {
            Ok(session) => session,
            Err(e) => {
                error!(error = %e, "Listing jobs failed");
                return Vec::new();
            }
        };
        let handles = match session.jobs().await {
            Ok(handles) => handles,
            Err(e) => {
                error!(session = %session.name(), error = %e, "Listing jobs failed");
                return Vec::new();
            }
        };
        let mut jobs = Vec::with_capacity(handles.len());
        for handle in handles {
            jobs.push(Job::from_handle(self.clone(), handle).await);
        }
        jobs
    }

    /// Stop submitting through this workflow's session.
    pub fn close(&self) {
        if let Some(session) = &self.inner.session {
            debug!(session = %session.name(), "Closing workflow");
            session.close();
        }
    }
}

impl std::fmt::Debug for Workflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workflow")
            .field("session", &self.session_name())
            .field("error", &self.inner.error)
            .finish()
    }
}

async fn open_session(ctx: &Context) -> Result<JobSession, Error> {
    if let Some(e) = ctx.error() {
        return Err(e.clone());
    }
    let sm = ctx
        .session_manager()
        .ok_or_else(|| WorkflowError::Context("no session manager available".to_string()))?;
    let name = ctx.session_name();
    match sm.create_job_session(name, "").await {
        Ok(session) => Ok(session),
        Err(create) => {
            debug!(session = %name, error = %create, "Creating session failed, opening it");
            sm.open_job_session(name).await.map_err(|open| {
                WorkflowError::Session {
                    name: name.to_string(),
                    create: create.to_string(),
                    open: open.to_string(),
                }
                .into()
            })
        }
    }
}
