//! Execution contexts: which backend runs the jobs and with which defaults.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use tracing::{debug, error};
use uuid::Uuid;

use crate::config::{DEFAULT_SESSION_NAME, ProcessConfig};
use crate::error::{Error, WorkflowError};
use crate::session::{LibSqlStore, MemoryStore, SessionManager, SessionType, Storer};
use crate::template::JobTemplate;

/// A session manager plus the defaults applied to every submission.
///
/// A context that failed to build still exists; it carries the error and
/// every workflow created from it reports that error.
pub struct Context {
    sm: Option<Arc<SessionManager>>,
    session_type: SessionType,
    default_template: JobTemplate,
    default_image: String,
    session_name: String,
    error: Option<Error>,
    task_counter: AtomicI64,
}

impl Context {
    fn build(sm: Result<Arc<SessionManager>, Error>, session_type: SessionType) -> Self {
        let (sm, error) = match sm {
            Ok(sm) => (Some(sm), None),
            Err(e) => {
                error!(error = %e, "Context creation failed");
                (None, Some(e))
            }
        };
        Self {
            sm,
            session_type,
            default_template: JobTemplate::default(),
            default_image: String::new(),
            session_name: DEFAULT_SESSION_NAME.to_string(),
            error,
            task_counter: AtomicI64::new(0),
        }
    }

    /// Context running local processes, remembering sessions in memory.
    pub async fn process() -> Self {
        Self::process_with_config(ProcessConfig::default()).await
    }

    /// Context running local processes. Sessions are kept in a libSQL file
    /// when `db_file` is set.
    pub async fn process_with_config(config: ProcessConfig) -> Self {
        let store: Result<Arc<dyn Storer>, Error> = match &config.db_file {
            Some(path) => LibSqlStore::new_local(path)
                .await
                .map(|s| Arc::new(s) as Arc<dyn Storer>)
                .map_err(Error::from),
            None => Ok(Arc::new(MemoryStore::new())),
        };
        let sm = match store {
            Ok(store) => SessionManager::new(SessionType::Process, store)
                .await
                .map(Arc::new),
            Err(e) => Err(e),
        };
        debug!(db_file = ?config.db_file, "Process context created");
        let mut ctx = Self::build(sm, SessionType::Process);
        ctx.default_template = config.default_template;
        ctx.default_image = config.default_image;
        ctx.session_name = config.session_name;
        ctx
    }

    /// Context over an already configured session manager.
    pub fn from_session_manager(sm: Arc<SessionManager>) -> Self {
        let session_type = sm.session_type();
        Self::build(Ok(sm), session_type)
    }

    /// Context that failed to build. Useful for exercising error paths.
    pub fn error_test() -> Self {
        Self::build(
            Err(WorkflowError::Context("error".to_string()).into()),
            SessionType::Process,
        )
    }

    /// Call `f` with the construction error, if any.
    pub fn on_error(&self, f: impl FnOnce(&Error)) -> &Self {
        if let Some(e) = &self.error {
            f(e);
        }
        self
    }

    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn session_manager(&self) -> Option<&Arc<SessionManager>> {
        self.sm.as_ref()
    }

    pub fn session_type(&self) -> SessionType {
        self.session_type
    }

    pub fn default_template(&self) -> &JobTemplate {
        &self.default_template
    }

    /// Template merged under every submission.
    pub fn set_default_template(&mut self, template: JobTemplate) {
        self.default_template = template;
    }

    pub fn with_default_template(mut self, template: JobTemplate) -> Self {
        self.default_template = template;
        self
    }

    pub fn default_image(&self) -> &str {
        &self.default_image
    }

    /// Job category used for templates that leave it empty.
    pub fn with_default_image(mut self, image: impl Into<String>) -> Self {
        self.default_image = image.into();
        self
    }

    pub fn session_name(&self) -> &str {
        &self.session_name
    }

    pub fn with_session_name(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.session_name = if name.is_empty() {
            DEFAULT_SESSION_NAME.to_string()
        } else {
            name
        };
        self
    }

    /// Next value substituted for `{{ .ID }}` placeholders.
    pub fn next_task_id(&self) -> i64 {
        self.task_counter.fetch_add(1, Ordering::SeqCst) + 1
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("session_type", &self.session_type)
            .field("session_name", &self.session_name)
            .field("default_image", &self.default_image)
            .field("error", &self.error)
            .finish()
    }
}

/// A database path in the temp dir that does not exist yet.
pub fn tmp_file() -> PathBuf {
    std::env::temp_dir().join(format!("wfl-{}.db", Uuid::new_v4()))
}
