//! Reading what a finished job wrote to its output files.

use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, OutputError, TrackerError};
use crate::session::{JobHandle, SessionType};
use crate::template::is_reserved_path;
use crate::tracker::JobState;

/// Which captured stream to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OutputKind {
    Output,
    Error,
}

/// A fresh output path in the temp dir. The `{{.ID}}` placeholder makes
/// every task that uses it write to its own file.
pub fn random_file_name_in_temp_dir() -> String {
    std::env::temp_dir()
        .join(format!("wfl-{}-{{{{.ID}}}}.out", Uuid::new_v4()))
        .to_string_lossy()
        .into_owned()
}

/// Output lives in files only for backends that write them locally.
pub(crate) fn check_backend(session_type: SessionType) -> Result<(), OutputError> {
    match session_type {
        SessionType::Process | SessionType::Container => Ok(()),
        other => Err(OutputError::Unsupported {
            backend: other.to_string(),
        }),
    }
}

/// Wait for `job` to finish and return the file behind its output or error
/// path, without the final line ending.
pub(crate) async fn read(job: &JobHandle, kind: OutputKind) -> Result<String, Error> {
    if job.state().await == JobState::Undetermined {
        return Err(TrackerError::NotFound {
            id: job.id().to_string(),
        }
        .into());
    }
    job.wait_terminated(std::time::Duration::ZERO).await?;

    let template = job.template().await?;
    let path = match kind {
        OutputKind::Output => template.output_path,
        OutputKind::Error => template.error_path,
    };
    if is_reserved_path(&path) {
        return Err(OutputError::ReservedPath { path }.into());
    }
    let metadata = tokio::fs::metadata(&path)
        .await
        .map_err(|e| OutputError::Read {
            path: path.clone(),
            reason: e.to_string(),
        })?;
    if metadata.is_dir() {
        return Err(OutputError::Directory { path }.into());
    }
    debug!(job_id = %job.id(), path = %path, "Reading job output");
    let content = tokio::fs::read_to_string(&path)
        .await
        .map_err(|e| OutputError::Read {
            path: path.clone(),
            reason: e.to_string(),
        })?;
    Ok(strip_line_ending(content))
}

fn strip_line_ending(mut s: String) -> String {
    if s.ends_with('\n') {
        s.pop();
    }
    if s.ends_with('\r') {
        s.pop();
    }
    s
}
