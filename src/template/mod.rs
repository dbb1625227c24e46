//! Job templates: the description of one unit of work.

pub mod iterator;
pub mod matrix;
mod merge;

use std::collections::HashMap;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::TemplateError;

pub use iterator::{Template, TemplateIterator, env_sequence_iterator, time_iterator};
pub use matrix::{JobTemplateField, Replacement};
pub use merge::merge_with_default;

/// Paths that are never treated as real files when reading job output.
pub const RESERVED_PATHS: [&str; 4] = ["", "/dev/null", "/dev/stdout", "/dev/stderr"];

static ID_PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*\.ID\s*\}\}").unwrap());

/// A record describing one job submission.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobTemplate {
    pub remote_command: String,
    pub args: Vec<String>,
    pub submit_as_hold: bool,
    pub rerunnable: bool,
    pub job_environment: HashMap<String, String>,
    pub working_directory: String,
    /// Container image or another backend-defined category.
    pub job_category: String,
    pub email: Vec<String>,
    pub email_on_started: bool,
    pub email_on_terminated: bool,
    pub job_name: String,
    pub input_path: String,
    pub output_path: String,
    pub error_path: String,
    pub join_files: bool,
    pub reservation_id: String,
    pub queue_name: String,
    pub min_slots: i64,
    pub max_slots: i64,
    pub priority: i64,
    pub candidate_machines: Vec<String>,
    pub min_phys_memory: i64,
    pub machine_os: String,
    pub machine_arch: String,
    pub start_time: Option<DateTime<Utc>>,
    pub deadline_time: Option<DateTime<Utc>>,
    pub stage_in_files: HashMap<String, String>,
    pub stage_out_files: HashMap<String, String>,
    pub resource_limits: HashMap<String, String>,
    pub accounting_id: String,
    /// Backend-specific keys.
    pub extension_list: HashMap<String, String>,
}

impl JobTemplate {
    /// Template that runs `command` with `args`.
    pub fn command<I, S>(command: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            remote_command: command.into(),
            args: args.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Check the invariants every submission must satisfy.
    pub fn validate(&self) -> Result<(), TemplateError> {
        if self.remote_command.is_empty() {
            return Err(TemplateError::EmptyCommand);
        }
        if !self.input_path.is_empty()
            && (self.input_path == self.output_path || self.input_path == self.error_path)
        {
            return Err(TemplateError::ConflictingPaths {
                path: self.input_path.clone(),
            });
        }
        if let Some(deadline) = self.deadline_time {
            if deadline <= Utc::now() {
                return Err(TemplateError::DeadlinePassed {
                    deadline: deadline.to_rfc3339(),
                });
            }
        }
        Ok(())
    }

    /// Replace the `{{ .ID }}` placeholder in the input, output and error
    /// paths with `id`.
    pub fn expand_task_id(&mut self, id: &str) {
        for path in [
            &mut self.input_path,
            &mut self.output_path,
            &mut self.error_path,
        ] {
            if ID_PLACEHOLDER.is_match(path.as_str()) {
                *path = ID_PLACEHOLDER.replace_all(path.as_str(), id).into_owned();
            }
        }
    }

    /// True if any path still carries an unexpanded placeholder.
    pub fn has_task_id_placeholder(&self) -> bool {
        [&self.input_path, &self.output_path, &self.error_path]
            .iter()
            .any(|p| ID_PLACEHOLDER.is_match(p))
    }
}

/// True for paths that name a local standard stream or nothing at all.
pub fn is_reserved_path(path: &str) -> bool {
    RESERVED_PATHS.contains(&path)
}
