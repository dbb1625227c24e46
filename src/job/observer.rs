//! Packaged callbacks for the three ways a job can end.

use super::Job;
use crate::error::Error;
use crate::session::JobHandle;

pub type ErrorHandler = Box<dyn Fn(&Error) + Send + Sync>;
pub type JobHandler = Box<dyn Fn(&JobHandle) + Send + Sync>;

/// Reactions to a submission error, a failed job and a successful job.
pub struct Observer {
    pub on_error: ErrorHandler,
    pub on_failure: JobHandler,
    pub on_success: JobHandler,
}

impl Observer {
    pub fn new(on_error: ErrorHandler, on_failure: JobHandler, on_success: JobHandler) -> Self {
        Self {
            on_error,
            on_failure,
            on_success,
        }
    }

    /// Panics on errors, exits the process with status 1 when a job fails
    /// and prints a line when a job succeeds.
    pub fn default_observer() -> Self {
        Self {
            on_error: Box::new(|e| panic!("{e}")),
            on_failure: Box::new(|job| {
                println!("job {} failed", job.id());
                std::process::exit(1);
            }),
            on_success: Box::new(|job| println!("job {} finished successfully", job.id())),
        }
    }
}

impl Default for Observer {
    fn default() -> Self {
        Self::default_observer()
    }
}

impl std::fmt::Debug for Observer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observer").finish_non_exhaustive()
    }
}

impl Job {
    /// `on_error`, then `on_failure`, then `on_success`. Blocks until the
    /// last task finished.
    pub async fn observe(self, observer: &Observer) -> Self {
        self.on_error(|e| (observer.on_error)(e))
            .on_failure(|job| (observer.on_failure)(job))
            .await
            .on_success(|job| (observer.on_success)(job))
            .await
    }
}
