//! jobflow: chainable job workflows on top of pluggable job trackers.

pub mod config;
pub mod context;
pub mod error;
pub mod job;
pub mod logging;
pub mod notifier;
pub mod session;
pub mod stream;
pub mod template;
pub mod tracker;
pub mod workflow;

pub use config::{LogLevel, ProcessConfig};
pub use context::{Context, tmp_file};
pub use error::{Error, ErrorKind, Result};
pub use job::{Job, Observer, random_file_name_in_temp_dir};
pub use notifier::Notifier;
pub use session::{JobHandle, JobSession, SessionManager, SessionType};
pub use stream::{Break, Stream, StreamConfig, sequence_breaker};
pub use template::{
    JobTemplate, JobTemplateField, Replacement, Template, env_sequence_iterator, time_iterator,
};
pub use tracker::{JobInfo, JobState};
pub use workflow::Workflow;
