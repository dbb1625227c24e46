//! Job chains.
//!
//! A [`Job`] is an ordered list of submitted tasks plus the outcome of the
//! last operation. Chain methods take the job by value and hand it back, so
//! a pipeline reads as one expression:
//!
//! ```no_run
//! # async fn demo(wf: jobflow::Workflow) {
//! let job = wf.run("sleep", ["1"]).await.then_run("echo", ["done"]).await.wait().await;
//! if let Some(e) = job.last_error() {
//!     eprintln!("pipeline failed: {e}");
//! }
//! # }
//! ```
//!
//! Failures never interrupt the chain. They are recorded and can be read
//! with [`Job::last_error`] or handled with [`Job::on_error`].

mod observer;
mod output;
mod task;

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::context::Context;
use crate::error::{ChainError, ConfigError, Error, WorkflowError};
use crate::session::JobHandle;
use crate::template::{JobTemplate, Replacement, merge_with_default, matrix::templates_for_matrix};
use crate::tracker::{ControlAction, JobInfo, JobState};
use crate::workflow::Workflow;

pub use observer::{ErrorHandler, JobHandler, Observer};
pub use output::random_file_name_in_temp_dir;

use output::OutputKind;
use task::{TaskBackend, TaskElement, array_job_info, array_tasks};

/// A chain of tasks submitted through one workflow.
///
/// Not meant for concurrent mutation; pipelines that run side by side use
/// separate jobs (see [`Workflow::new_job`]).
#[derive(Clone, Default)]
pub struct Job {
    workflow: Option<Workflow>,
    tasks: Vec<TaskElement>,
    tag: String,
    last_error: Option<Error>,
}

impl Job {
    pub fn new(workflow: Workflow) -> Self {
        Self {
            workflow: Some(workflow),
            ..Default::default()
        }
    }

    /// A job bound to no workflow. Every submission fails.
    pub fn empty() -> Self {
        Self::default()
    }

    pub(crate) async fn from_handle(workflow: Workflow, handle: JobHandle) -> Self {
        let template = handle.template().await.unwrap_or_default();
        let mut task = TaskElement::submitted(
            template.clone(),
            template,
            TaskBackend::Single(handle.clone()),
        );
        if handle.state().await.is_terminal() {
            task.terminated = true;
            task.job_info = handle.info().await.ok();
        }
        Self {
            workflow: Some(workflow),
            tasks: vec![task],
            ..Default::default()
        }
    }

    // ── Properties ───────────────────────────────────────────────────

    /// Label the whole chain.
    pub fn tag_with(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn last_error(&self) -> Option<&Error> {
        self.last_error.as_ref()
    }

    /// True when the last operation failed.
    pub fn errored(&self) -> bool {
        self.last_error.is_some()
    }

    /// Number of task slots, failed submissions included.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Template the backend stored for the last task.
    pub async fn template(&mut self) -> Option<JobTemplate> {
        self.last_error = None;
        let result = match self.job_check() {
            Err(e) => Err(e),
            Ok(TaskBackend::Single(job)) => job.template().await.map_err(Error::from),
            Ok(TaskBackend::Array(array)) => array.template().await.map_err(Error::from),
        };
        match result {
            Ok(template) => Some(template),
            Err(e) => {
                debug!(tag = %self.tag, error = %e, "No template available");
                self.last_error = Some(e);
                None
            }
        }
    }

    /// State of the last task. Once a wait saw the task finish, the cached
    /// state is returned.
    pub async fn state(&mut self) -> JobState {
        if let Some(task) = self.tasks.last()
            && task.terminated
            && let Some(info) = &task.job_info
        {
            return info.state;
        }
        match self.job_check() {
            Err(e) => {
                self.last_error = Some(e);
                JobState::Undetermined
            }
            Ok(TaskBackend::Single(job)) => job.state().await,
            Ok(TaskBackend::Array(array)) => array.state().await,
        }
    }

    /// Backend id of the last task; empty when there is none.
    pub fn job_id(&mut self) -> String {
        match self.job_check() {
            Ok(TaskBackend::Single(job)) => job.id().to_string(),
            Ok(TaskBackend::Array(array)) => array.id().to_string(),
            Err(e) => {
                self.last_error = Some(e);
                String::new()
            }
        }
    }

    /// Run-time details of the last task. For an array job this is a
    /// summary over its tasks.
    pub async fn job_info(&mut self) -> JobInfo {
        if let Some(task) = self.tasks.last()
            && task.terminated
            && let Some(info) = &task.job_info
        {
            return info.clone();
        }
        let result = match self.job_check() {
            Err(e) => Err(e),
            Ok(TaskBackend::Single(job)) => job.info().await.map_err(Error::from),
            Ok(TaskBackend::Array(array)) => array_job_info(&array).await,
        };
        result.unwrap_or_else(|e| {
            error!(tag = %self.tag, error = %e, "Fetching job info failed");
            self.last_error = Some(e);
            JobInfo::default()
        })
    }

    /// Run-time details of every job in the chain, array tasks included.
    pub async fn job_infos(&self) -> Vec<JobInfo> {
        let mut infos = Vec::with_capacity(self.tasks.len());
        for task in &self.tasks {
            if let (true, Some(info), Some(TaskBackend::Single(_))) =
                (task.terminated, &task.job_info, &task.backend)
            {
                infos.push(info.clone());
                continue;
            }
            for job in task.handles().await {
                match job.info().await {
                    Ok(info) => infos.push(info),
                    Err(e) => warn!(job_id = %job.id(), error = %e, "Fetching job info failed"),
                }
            }
        }
        infos
    }

    // ── Submission ───────────────────────────────────────────────────

    /// Submit `command` with `args`.
    pub async fn run<I, S>(self, command: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.run_t(JobTemplate::command(command, args)).await
    }

    /// Submit `template`, merged with the context's default template.
    pub async fn run_t(mut self, template: JobTemplate) -> Self {
        self.submit(template).await;
        self
    }

    pub async fn run_array<I, S>(
        self,
        begin: i64,
        end: i64,
        step: i64,
        max_parallel: i64,
        command: impl Into<String>,
        args: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.run_array_t(begin, end, step, max_parallel, JobTemplate::command(command, args))
            .await
    }

    /// Submit `template` once per index in `begin..=end` by `step`, at most
    /// `max_parallel` at a time. Zero or less means no limit.
    pub async fn run_array_t(
        mut self,
        begin: i64,
        end: i64,
        step: i64,
        max_parallel: i64,
        template: JobTemplate,
    ) -> Self {
        let workflow = match self.workflow() {
            Ok(workflow) => workflow,
            Err(e) => {
                self.last_error = Some(e);
                return self;
            }
        };
        let session = match workflow.session() {
            Ok(session) => session.clone(),
            Err(e) => {
                self.last_error = Some(e);
                return self;
            }
        };
        let template = prepare(workflow.context(), &template);
        info!(
            tag = %self.tag,
            command = %template.remote_command,
            begin,
            end,
            step,
            max_parallel,
            "Submitting array job"
        );
        match session
            .run_bulk_jobs(template.clone(), begin, end, step, max_parallel)
            .await
        {
            Ok(array) => {
                self.last_error = None;
                self.tasks.push(TaskElement::submitted(
                    template.clone(),
                    template,
                    TaskBackend::Array(array),
                ));
            }
            Err(e) => {
                error!(tag = %self.tag, error = %e, "Array job submission failed");
                self.last_error = Some(e.clone());
                self.tasks
                    .push(TaskElement::failed(template.clone(), template, e));
            }
        }
        self
    }

    /// Submit one job per point of `x × y`. Stops at the first failed
    /// submission.
    pub async fn run_matrix_t(mut self, template: JobTemplate, x: Replacement, y: Replacement) -> Self {
        if let Err(e) = self.workflow() {
            self.last_error = Some(e);
            return self;
        }
        let templates = match templates_for_matrix(&template, &x, &y) {
            Ok(templates) => templates,
            Err(e) => {
                error!(tag = %self.tag, error = %e, "Building matrix templates failed");
                self.last_error = Some(e.into());
                return self;
            }
        };
        self.last_error = None;
        for jt in templates {
            debug!(tag = %self.tag, command = %jt.remote_command, args = ?jt.args, "Submitting matrix point");
            self.submit(jt).await;
            if self.errored() {
                break;
            }
        }
        self
    }

    /// Submit the last task's template `n` more times. A negative `n`
    /// keeps going until a submission fails.
    pub async fn resubmit(mut self, n: i64) -> Self {
        let mut round = 0;
        while n < 0 || round < n {
            round += 1;
            let Some(task) = self.tasks.last() else {
                error!(tag = %self.tag, "Nothing to resubmit");
                self.last_error = Some(ChainError::JobNotAvailable.into());
                break;
            };
            if matches!(task.backend, Some(TaskBackend::Array(_))) {
                self.last_error = Some(ChainError::ArrayRetryUnsupported.into());
                break;
            }
            let blueprint = task.blueprint.clone();
            let retry = task.retry + 1;
            let workflow = match self.workflow() {
                Ok(workflow) => workflow,
                Err(e) => {
                    self.last_error = Some(e);
                    break;
                }
            };
            let (template, result) = launch(&workflow, &blueprint).await;
            match result {
                Ok(job) => {
                    debug!(tag = %self.tag, job_id = %job.id(), retry, "Resubmitted task");
                    self.last_error = None;
                    let mut task = TaskElement::submitted(template, blueprint, TaskBackend::Single(job));
                    task.retry = retry;
                    self.tasks.push(task);
                }
                Err(e) => {
                    error!(tag = %self.tag, error = %e, "Resubmission failed");
                    self.last_error = Some(e);
                    break;
                }
            }
        }
        self
    }

    /// Submit every `every` until `end`, whatever happened to the earlier
    /// jobs. Returns the first submission error.
    pub async fn run_every<I, S>(
        &mut self,
        every: Duration,
        end: DateTime<Utc>,
        command: impl Into<String>,
        args: I,
    ) -> Result<(), Error>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.run_every_t(every, end, JobTemplate::command(command, args))
            .await
    }

    pub async fn run_every_t(
        &mut self,
        every: Duration,
        end: DateTime<Utc>,
        template: JobTemplate,
    ) -> Result<(), Error> {
        if every.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "every".to_string(),
                message: "period must be positive".to_string(),
            }
            .into());
        }
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
        loop {
            ticker.tick().await;
            if Utc::now() > end {
                info!(tag = %self.tag, "End time reached, stopping periodic submission");
                return Ok(());
            }
            self.submit(template.clone()).await;
            if let Some(e) = &self.last_error {
                error!(tag = %self.tag, error = %e, "Periodic submission failed, aborting");
                return Err(e.clone());
            }
        }
    }

    // ── Waiting ──────────────────────────────────────────────────────

    /// Sleep for `duration`.
    pub async fn after(self, duration: Duration) -> Self {
        tokio::time::sleep(duration).await;
        self
    }

    /// Wait for the last task; for an array job, for all of its tasks.
    pub async fn wait(self) -> Self {
        self.wait_with_timeout(Duration::ZERO).await
    }

    /// Like [`Job::wait`] but gives up after `timeout` and records a
    /// timeout error. Zero waits forever.
    pub async fn wait_with_timeout(mut self, timeout: Duration) -> Self {
        self.wait_last(timeout).await;
        self
    }

    async fn wait_last(&mut self, timeout: Duration) {
        self.last_error = None;
        let Some(task) = self.tasks.last_mut() else {
            error!(tag = %self.tag, "Nothing to wait for");
            self.last_error = Some(ChainError::NothingToWaitFor.into());
            return;
        };
        if let Err(e) = task.wait(timeout).await {
            warn!(tag = %self.tag, error = %e, "Wait failed");
            self.last_error = Some(e);
        }
    }

    /// Wait until every task in the chain finished.
    pub async fn synchronize(mut self) -> Self {
        self.last_error = None;
        for task in &mut self.tasks {
            if task.backend.is_none() {
                warn!(tag = %self.tag, "Skipping task without a job");
                continue;
            }
            if let Err(e) = task.wait(Duration::ZERO).await {
                self.last_error = Some(e);
            }
        }
        self
    }

    /// Wait for the last task and resubmit it while it fails, at most `n`
    /// times.
    pub async fn retry(mut self, n: i64) -> Self {
        for _ in 0..n.max(0) {
            self = self.wait().await;
            if self.success().await {
                debug!(tag = %self.tag, "Last task succeeded, no retry needed");
                return self;
            }
            let failed = self.job_id();
            warn!(tag = %self.tag, job_id = %failed, "Last task failed, resubmitting");
            self = self.resubmit(1).await;
            if self.errored() {
                break;
            }
        }
        self
    }

    // ── Control ──────────────────────────────────────────────────────

    pub async fn suspend(mut self) -> Self {
        self.control(ControlAction::Suspend).await;
        self
    }

    pub async fn resume(mut self) -> Self {
        self.control(ControlAction::Resume).await;
        self
    }

    /// Terminate the last task. Queued array tasks fail without starting.
    pub async fn kill(mut self) -> Self {
        self.control(ControlAction::Terminate).await;
        self
    }

    async fn control(&mut self, action: ControlAction) {
        let result = match self.job_check() {
            Err(e) => Err(e),
            Ok(TaskBackend::Single(job)) => job.control(action).await.map_err(Error::from),
            Ok(TaskBackend::Array(array)) => array.control_all(action).await.map_err(Error::from),
        };
        if let Err(e) = &result {
            warn!(tag = %self.tag, action = %action, error = %e, "Job control failed");
        }
        self.last_error = result.err();
    }

    // ── Callbacks ────────────────────────────────────────────────────

    /// Call `f` with the last task's job (every task of an array job)
    /// without waiting.
    pub async fn inspect(self, mut f: impl FnMut(&JobHandle)) -> Self {
        match self.job_check() {
            Ok(TaskBackend::Single(job)) => f(&job),
            Ok(TaskBackend::Array(array)) => {
                for job in array_tasks(&array).await {
                    f(&job);
                }
            }
            Err(e) => debug!(tag = %self.tag, error = %e, "Nothing to inspect"),
        }
        self
    }

    /// Wait for the last task, then call `f` with its job (every task of an
    /// array job).
    pub async fn then(mut self, mut f: impl FnMut(&JobHandle)) -> Self {
        self.last_error = None;
        let Some(task) = self.tasks.last_mut() else {
            error!(tag = %self.tag, "No task to continue from");
            self.last_error = Some(ChainError::NothingToWaitFor.into());
            return self;
        };
        let Some(backend) = task.backend.clone() else {
            error!(tag = %self.tag, "Last task has no job");
            self.last_error = Some(ChainError::NothingToWaitFor.into());
            return self;
        };
        if let Err(e) = task.wait(Duration::ZERO).await {
            warn!(tag = %self.tag, error = %e, "Wait before callback failed");
        }
        match backend {
            TaskBackend::Single(job) => f(&job),
            TaskBackend::Array(array) => {
                for job in array_tasks(&array).await {
                    f(&job);
                }
            }
        }
        self
    }

    pub async fn then_run<I, S>(self, command: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.wait().await.run(command, args).await
    }

    pub async fn then_run_t(self, template: JobTemplate) -> Self {
        self.wait().await.run_t(template).await
    }

    pub async fn then_run_array<I, S>(
        self,
        begin: i64,
        end: i64,
        step: i64,
        max_parallel: i64,
        command: impl Into<String>,
        args: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.wait()
            .await
            .run_array(begin, end, step, max_parallel, command, args)
            .await
    }

    /// Call `f` when the last task ends `done`.
    pub async fn on_success(mut self, f: impl FnMut(&JobHandle)) -> Self {
        if self.wait_for_end_state().await == JobState::Done {
            self = self.then(f).await;
        }
        self
    }

    pub async fn on_success_run<I, S>(self, command: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.on_success_run_t(JobTemplate::command(command, args))
            .await
    }

    pub async fn on_success_run_t(mut self, template: JobTemplate) -> Self {
        if self.wait_for_end_state().await == JobState::Done {
            info!(tag = %self.tag, "Previous task succeeded, running next");
            self.submit(template).await;
        }
        self
    }

    /// Call `f` when the last task ends in any state but `done`. A task
    /// whose submission failed has no job to hand over, so `f` is skipped
    /// and the chain records that.
    pub async fn on_failure(mut self, f: impl FnMut(&JobHandle)) -> Self {
        if self.wait_for_end_state().await != JobState::Done {
            self = self.then(f).await;
        }
        self
    }

    pub async fn on_failure_run<I, S>(self, command: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.on_failure_run_t(JobTemplate::command(command, args))
            .await
    }

    pub async fn on_failure_run_t(mut self, template: JobTemplate) -> Self {
        if self.wait_for_end_state().await != JobState::Done {
            info!(tag = %self.tag, "Previous task failed, running next");
            self.submit(template).await;
        }
        self
    }

    /// Call `f` when the last operation failed, submissions included.
    pub fn on_error(self, f: impl FnOnce(&Error)) -> Self {
        if let Some(e) = &self.last_error {
            f(e);
        }
        self
    }

    pub fn on_error_panic(self) -> Self {
        if let Some(e) = &self.last_error {
            panic!("{e}");
        }
        self
    }

    /// Call `f` for every job in chain order, stopping at the first error.
    pub async fn for_each<F, E>(&self, mut f: F) -> Result<(), E>
    where
        F: AsyncFnMut(&JobHandle) -> Result<(), E>,
    {
        for job in self.list_all().await {
            if let Err(e) = f(&job).await {
                warn!(tag = %self.tag, job_id = %job.id(), "Callback failed, stopping iteration");
                return Err(e);
            }
        }
        Ok(())
    }

    /// Call `f` for every job concurrently. All calls run to completion;
    /// the first error in chain order is returned.
    pub async fn for_all<F, E>(&self, f: F) -> Result<(), E>
    where
        F: AsyncFn(&JobHandle) -> Result<(), E>,
    {
        let jobs = self.list_all().await;
        let results = futures::future::join_all(jobs.iter().map(|job| f(job))).await;
        results.into_iter().find(Result::is_err).unwrap_or(Ok(()))
    }

    // ── Results ──────────────────────────────────────────────────────

    /// True when the last task ended `done` with exit status 0.
    pub async fn success(&mut self) -> bool {
        self.state().await == JobState::Done && self.exit_status().await == 0
    }

    /// Wait for the last task and return its exit status, -1 when unknown.
    pub async fn exit_status(&mut self) -> i32 {
        self.wait_last(Duration::ZERO).await;
        match self.tasks.last() {
            Some(task) => task.job_info.as_ref().map_or(-1, |info| info.exit_status),
            None => {
                error!(tag = %self.tag, "No task to report an exit status for");
                -1
            }
        }
    }

    /// True when some job of the chain has failed already. Does not wait.
    pub async fn any_failed(&self) -> bool {
        for task in &self.tasks {
            if task.backend.is_some() && task.state().await == JobState::Failed {
                return true;
            }
        }
        false
    }

    /// Wait for everything, then report whether anything failed.
    pub async fn has_any_failed(&mut self) -> bool {
        !self.list_all_failed().await.is_empty()
    }

    /// Wait for everything and return the failed jobs.
    pub async fn list_all_failed(&mut self) -> Vec<JobHandle> {
        let mut failed = Vec::new();
        for task in &mut self.tasks {
            if let Err(e) = task.wait(Duration::ZERO).await {
                warn!(tag = %self.tag, error = %e, "Wait failed");
            }
            match &task.backend {
                None => {}
                Some(TaskBackend::Single(job)) => {
                    if task.state().await == JobState::Failed {
                        failed.push(job.clone());
                    }
                }
                Some(TaskBackend::Array(array)) => {
                    for job in array_tasks(array).await {
                        if job.state().await == JobState::Failed {
                            failed.push(job);
                        }
                    }
                }
            }
        }
        failed
    }

    /// Every job of the chain, array tasks expanded.
    pub async fn list_all(&self) -> Vec<JobHandle> {
        let mut all = Vec::with_capacity(self.tasks.len());
        for task in &self.tasks {
            all.extend(task.handles().await);
        }
        all
    }

    /// Replace failed single jobs with new incarnations, up to `rounds`
    /// times (negative: until none fails). Failed array tasks are reported
    /// but not retried.
    pub async fn retry_any_failed(mut self, rounds: i64) -> Self {
        let workflow = match self.workflow() {
            Ok(workflow) => workflow,
            Err(e) => {
                self.last_error = Some(e);
                return self;
            }
        };
        let mut round = 0;
        while rounds < 0 || round < rounds {
            round += 1;
            let mut retried = false;
            for task in &mut self.tasks {
                if let Err(e) = task.wait(Duration::ZERO).await {
                    warn!(tag = %self.tag, error = %e, "Wait failed");
                }
                let state = task.state().await;
                match task.backend.clone() {
                    Some(TaskBackend::Single(job)) if state == JobState::Failed => {
                        let (template, result) = launch(&workflow, &task.blueprint).await;
                        match result {
                            Ok(new_job) => {
                                warn!(
                                    tag = %self.tag,
                                    failed = %job.id(),
                                    retry = %new_job.id(),
                                    "Task failed, retrying"
                                );
                                task.replace(template, new_job);
                                retried = true;
                            }
                            Err(e) => {
                                error!(tag = %self.tag, error = %e, "Retry submission failed");
                                self.last_error = Some(e);
                            }
                        }
                    }
                    Some(TaskBackend::Array(array)) => {
                        for job in array_tasks(&array).await {
                            if job.state().await == JobState::Failed {
                                warn!(tag = %self.tag, job_id = %job.id(), "Cannot retry failed array task");
                                self.last_error = Some(ChainError::ArrayRetryUnsupported.into());
                            }
                        }
                    }
                    _ => {}
                }
            }
            if !retried {
                break;
            }
        }
        self
    }

    /// Remove every finished job from the backend.
    pub async fn reap_all(mut self) -> Self {
        for job in self.list_all().await {
            if let Err(e) = job.reap().await {
                warn!(tag = %self.tag, job_id = %job.id(), error = %e, "Reap failed");
                self.last_error = Some(e.into());
            }
        }
        self
    }

    // ── Output ───────────────────────────────────────────────────────

    /// Wait for the last task and return what it wrote to its output path,
    /// without the final line ending. Array tasks are joined by newlines.
    pub async fn output(&mut self) -> String {
        self.read_last(OutputKind::Output).await
    }

    /// Like [`Job::output`] for the error path.
    pub async fn output_error(&mut self) -> String {
        self.read_last(OutputKind::Error).await
    }

    async fn read_last(&mut self, kind: OutputKind) -> String {
        match self.try_read_last(kind).await {
            Ok(output) => {
                self.last_error = None;
                output
            }
            Err(e) => {
                error!(tag = %self.tag, error = %e, "Reading output failed");
                self.last_error = Some(e);
                String::new()
            }
        }
    }

    async fn try_read_last(&self, kind: OutputKind) -> Result<String, Error> {
        output::check_backend(self.workflow()?.context().session_type())?;
        match self.job_check()? {
            TaskBackend::Single(job) => output::read(&job, kind).await,
            TaskBackend::Array(array) => {
                let mut outputs = Vec::new();
                for job in array_tasks(&array).await {
                    outputs.push(output::read(&job, kind).await?);
                }
                Ok(outputs.join("\n"))
            }
        }
    }

    /// Output of every job keyed by job id, restricted to `ids` when given.
    /// Jobs whose output cannot be read map to an empty string.
    pub async fn outputs_for_job_ids(&mut self, ids: Option<&[String]>) -> HashMap<String, String> {
        let supported = self
            .workflow()
            .and_then(|wf| output::check_backend(wf.context().session_type()).map_err(Error::from));
        if let Err(e) = supported {
            error!(tag = %self.tag, error = %e, "Reading outputs failed");
            self.last_error = Some(e);
            return HashMap::new();
        }
        let mut outputs = HashMap::new();
        for job in self.list_all().await {
            if let Some(ids) = ids
                && !ids.iter().any(|id| id == job.id())
            {
                continue;
            }
            let output = output::read(&job, OutputKind::Output)
                .await
                .unwrap_or_else(|e| {
                    error!(job_id = %job.id(), error = %e, "Reading output failed");
                    String::new()
                });
            outputs.insert(job.id().to_string(), output);
        }
        outputs
    }

    // ── Internals ────────────────────────────────────────────────────

    fn workflow(&self) -> Result<Workflow, Error> {
        self.workflow
            .clone()
            .ok_or_else(|| WorkflowError::Context("no workflow defined".to_string()).into())
    }

    /// Backend of the last task, or why there is none.
    fn job_check(&self) -> Result<TaskBackend, Error> {
        let task = self.tasks.last().ok_or(ChainError::TaskNotAvailable)?;
        task.backend
            .clone()
            .ok_or_else(|| ChainError::JobNotAvailable.into())
    }

    async fn wait_for_end_state(&mut self) -> JobState {
        if self.job_check().is_err() {
            return JobState::Undetermined;
        }
        let Some(task) = self.tasks.last_mut() else {
            return JobState::Undetermined;
        };
        if task.wait(Duration::ZERO).await.is_err() {
            return JobState::Undetermined;
        }
        task.state().await
    }

    async fn submit(&mut self, template: JobTemplate) {
        let workflow = match self.workflow() {
            Ok(workflow) => workflow,
            Err(e) => {
                self.last_error = Some(e);
                return;
            }
        };
        if let Err(e) = workflow.session() {
            self.last_error = Some(e);
            return;
        }
        let blueprint = prepare(workflow.context(), &template);
        let (template, result) = launch(&workflow, &blueprint).await;
        match result {
            Ok(job) => {
                info!(
                    tag = %self.tag,
                    job_id = %job.id(),
                    command = %template.remote_command,
                    "Submitted job"
                );
                self.last_error = None;
                self.tasks
                    .push(TaskElement::submitted(template, blueprint, TaskBackend::Single(job)));
            }
            Err(e) => {
                error!(
                    tag = %self.tag,
                    command = %template.remote_command,
                    error = %e,
                    "Job submission failed"
                );
                self.last_error = Some(e.clone());
                self.tasks.push(TaskElement::failed(template, blueprint, e));
            }
        }
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("tag", &self.tag)
            .field("tasks", &self.tasks.len())
            .field("last_error", &self.last_error)
            .finish()
    }
}

/// Merge the context defaults under `template`.
fn prepare(ctx: &Context, template: &JobTemplate) -> JobTemplate {
    let mut jt = merge_with_default(template, ctx.default_template());
    if jt.job_category.is_empty() {
        jt.job_category = ctx.default_image().to_string();
    }
    jt
}

/// Expand `{{ .ID }}` placeholders and hand the template to the session.
async fn launch(workflow: &Workflow, blueprint: &JobTemplate) -> (JobTemplate, Result<JobHandle, Error>) {
    let mut template = blueprint.clone();
    if template.has_task_id_placeholder() {
        let id = workflow.context().next_task_id();
        template.expand_task_id(&id.to_string());
    }
    let result = match workflow.session() {
        Ok(session) => session.run_job(template.clone()).await,
        Err(e) => Err(e),
    };
    (template, result)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::error::{ErrorKind, OutputError, TrackerError};

    async fn workflow() -> Workflow {
        Workflow::new(Context::process().await).await
    }

    #[tokio::test]
    async fn test_empty_chain_boundaries() {
        let mut job = Job::empty();
        assert_eq!(job.state().await, JobState::Undetermined);
        assert_eq!(job.exit_status().await, -1);
        assert!(job.template().await.is_none());
        assert_eq!(job.last_error().unwrap().to_string(), "job task not available");

        let job = job.resubmit(3).await;
        assert!(job.is_empty());
        assert_eq!(job.last_error().unwrap().to_string(), "job not available");

        let job = job.wait().await;
        assert_eq!(job.last_error().unwrap().to_string(), "task not available");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_sequential_chain() {
        let wf = workflow().await;
        let mut job = wf
            .run("sleep", ["0"])
            .await
            .tag_with("seq")
            .then_run("sleep", ["0"])
            .await
            .wait()
            .await;
        assert_eq!(job.tag(), "seq");
        assert!(!job.errored());
        assert!(job.success().await);
        assert_eq!(job.job_infos().await.len(), 2);
        assert!(!job.any_failed().await);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_submission_error_is_recorded() {
        let wf = workflow().await;
        let mut seen = None;
        let mut job = wf
            .run("", Vec::<String>::new())
            .await
            .on_error(|e| seen = Some(e.kind()));
        assert_eq!(seen, Some(ErrorKind::InvalidArgument));
        assert_eq!(job.len(), 1);
        assert_eq!(job.job_id(), "");
        assert_eq!(job.last_error().unwrap().to_string(), "job not available");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_on_success_and_on_failure() {
        let wf = workflow().await;
        let calls = Arc::new(AtomicUsize::new(0));

        let c = calls.clone();
        let job = wf
            .run("/bin/sh", ["-c", "exit 2"])
            .await
            .on_success(|_| panic!("failed job reported success"))
            .await
            .on_failure(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let mut job = job.on_failure_run("sleep", ["0"]).await.wait().await;
        assert!(job.success().await);
        assert_eq!(job.len(), 2);

        let mut job = job.on_success_run("/bin/sh", ["-c", "exit 4"]).await;
        assert_eq!(job.exit_status().await, 4);
        assert!(job.has_any_failed().await);
        assert_eq!(job.list_all_failed().await.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_resubmit_and_synchronize() {
        let wf = workflow().await;
        let mut job = wf
            .run("sleep", ["0.1"])
            .await
            .resubmit(4)
            .await
            .synchronize()
            .await;
        assert_eq!(job.len(), 5);
        assert!(!job.errored());
        assert!(!job.has_any_failed().await);
        let ids: std::collections::HashSet<String> =
            job.list_all().await.iter().map(|j| j.id().to_string()).collect();
        assert_eq!(ids.len(), 5);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_retry_stops_after_limit() {
        let wf = workflow().await;
        let mut job = wf.run("/bin/sh", ["-c", "exit 1"]).await.retry(2).await;
        assert_eq!(job.len(), 3);
        assert!(!job.success().await);

        let mut job = wf.run("sleep", ["0"]).await.retry(5).await;
        assert_eq!(job.len(), 1);
        assert!(job.success().await);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_retry_any_failed_replaces_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("second-run");
        // fails the first time, succeeds once the marker exists
        let script = format!(
            "if [ -e {m} ]; then exit 0; else touch {m}; exit 1; fi",
            m = marker.display()
        );
        let wf = workflow().await;
        let mut job = wf
            .run("sleep", ["0"])
            .await
            .run("/bin/sh", ["-c", script.as_str()])
            .await
            .retry_any_failed(3)
            .await;
        assert_eq!(job.len(), 2);
        assert!(!job.has_any_failed().await);
        assert!(job.tasks[1].retry >= 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_wait_with_timeout() {
        let wf = workflow().await;
        let job = wf
            .run("sleep", ["5"])
            .await
            .wait_with_timeout(Duration::from_millis(100))
            .await;
        assert_eq!(job.last_error().unwrap().to_string(), "timeout");
        assert!(job.last_error().unwrap().is_timeout());

        let mut job = job.kill().await;
        assert!(!job.errored());
        let job_again = job.clone().wait().await;
        assert!(!job_again.errored());
        assert_eq!(job.state().await, JobState::Failed);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_suspend_resume() {
        let wf = workflow().await;
        let mut job = wf.run("sleep", ["0.5"]).await.after(Duration::from_millis(100)).await;
        assert_eq!(job.state().await, JobState::Running);

        let mut job = job.suspend().await;
        assert!(!job.errored());
        assert_eq!(job.state().await, JobState::Suspended);

        let job = job.resume().await;
        assert!(!job.errored());
        let mut job = job.wait().await;
        assert!(job.success().await);

        let job = job.suspend().await;
        assert!(matches!(
            job.last_error(),
            Some(Error::Tracker(TrackerError::AlreadyFinished { .. } | TrackerError::NotRunning { .. }))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_inspect_and_then() {
        let wf = workflow().await;
        let mut seen = Vec::new();
        let job = wf
            .run("sleep", ["0"])
            .await
            .inspect(|j| seen.push(j.id().to_string()))
            .await;
        let mut states = Vec::new();
        let mut job = job
            .then(|j| states.push(j.id().to_string()))
            .await;
        assert_eq!(seen, states);
        assert_eq!(job.job_info().await.state, JobState::Done);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_array_chain() {
        let wf = workflow().await;
        let mut job = wf
            .run_array_job(1, 4, 1, 2, "/bin/sh", ["-c", "exit 0"])
            .await
            .wait()
            .await;
        assert!(!job.errored());
        assert_eq!(job.state().await, JobState::Done);
        assert_eq!(job.list_all().await.len(), 4);
        assert!(job.success().await);
        assert_eq!(job.job_info().await.id, job.job_id());

        let job = job.resubmit(1).await;
        assert_eq!(
            job.last_error().unwrap().kind(),
            ErrorKind::UnsupportedOperation
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_for_each_and_for_all() {
        let wf = workflow().await;
        let job = wf
            .run("sleep", ["0"])
            .await
            .run("echo", ["x"])
            .await
            .synchronize()
            .await;

        let mut commands = Vec::new();
        job.for_each(async |j: &JobHandle| -> Result<(), Error> {
            commands.push(j.template().await?.remote_command);
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(commands, ["sleep", "echo"]);

        let calls = AtomicUsize::new(0);
        let result = job
            .for_all(async |j: &JobHandle| -> Result<(), String> {
                calls.fetch_add(1, Ordering::SeqCst);
                if j.template().await.unwrap().remote_command == "echo" {
                    return Err("echo".to_string());
                }
                Ok(())
            })
            .await;
        assert_eq!(result, Err("echo".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let stopped = job
            .for_each(async |_: &JobHandle| -> Result<(), &str> { Err("stop") })
            .await;
        assert_eq!(stopped, Err("stop"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_output() {
        let dir = tempfile::tempdir().unwrap();
        let mut template = JobTemplate::command("echo", ["hello"]);
        template.output_path = dir.path().join("out-{{ .ID }}").to_string_lossy().into_owned();

        let wf = workflow().await;
        let mut job = wf.run_t(template).await;
        assert_eq!(job.output().await, "hello");
        assert!(!job.errored());
        let stored = job.template().await.unwrap();
        assert!(!stored.output_path.contains("{{"));

        let outputs = job.outputs_for_job_ids(None).await;
        assert_eq!(outputs.get(&job.job_id()).map(String::as_str), Some("hello"));
        let none = job.outputs_for_job_ids(Some(&["nope".to_string()])).await;
        assert!(none.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_output_rejects_reserved_paths() {
        let wf = workflow().await;
        let mut job = wf.run("sleep", ["0"]).await;
        assert_eq!(job.output().await, "");
        assert!(matches!(
            job.last_error(),
            Some(Error::Output(OutputError::ReservedPath { .. }))
        ));
        assert_eq!(job.output_error().await, "");
        assert!(job.errored());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_array_output_joined() {
        let dir = tempfile::tempdir().unwrap();
        let mut template = JobTemplate::command("/bin/sh", ["-c", "echo $TASK_ID"]);
        template.output_path = dir.path().join("task-{{.ID}}").to_string_lossy().into_owned();

        let wf = workflow().await;
        let mut job = wf.run_array_job_t(1, 3, 1, 0, template).await;
        assert_eq!(job.output().await, "1\n2\n3");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_matrix_and_run_every() {
        let wf = workflow().await;
        let job = wf
            .run_matrix_t(
                JobTemplate::command("sleep", ["{{A}}"]),
                Replacement::new(&[crate::template::JobTemplateField::Args], "{{A}}", ["0", "0.1"]),
                Replacement::new(&[], "", Vec::<String>::new()),
            )
            .await
            .synchronize()
            .await;
        assert_eq!(job.len(), 2);

        let mut job = wf.new_job();
        let end = Utc::now() + chrono::Duration::milliseconds(350);
        job.run_every(Duration::from_millis(100), end, "sleep", ["0"])
            .await
            .unwrap();
        assert!((2..=4).contains(&job.len()));

        assert!(job
            .run_every(Duration::ZERO, end, "sleep", ["0"])
            .await
            .is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_reap_all() {
        let wf = workflow().await;
        let job = wf.run("sleep", ["0"]).await.wait().await.reap_all().await;
        assert!(!job.errored());
        assert!(wf.list_jobs().await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_reap_all_removes_array() {
        let wf = workflow().await;
        let job = wf
            .run_array_job(1, 2, 1, 0, "true", Vec::<String>::new())
            .await
            .wait()
            .await
            .reap_all()
            .await;
        assert!(!job.errored());
        assert!(wf.list_jobs().await.is_empty());
        assert!(job.list_all().await.is_empty());
    }
}
