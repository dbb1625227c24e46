//! Error types for jobflow.
//!
//! Every enum is `Clone` so that a job chain can keep the outcome of its last
//! operation around and hand it to `on_error` callbacks later on.

use crate::tracker::JobState;

/// Top-level error type.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error("Output error: {0}")]
    Output(#[from] OutputError),

    #[error(transparent)]
    Stream(#[from] StreamError),
}

/// Coarse classification of every error the crate produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidArgument,
    InvalidState,
    NotAvailable,
    UnsupportedOperation,
    Timeout,
    Internal,
    WorkflowCreation,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) => ErrorKind::InvalidArgument,
            Error::Store(e) => match e {
                StoreError::NotFound { .. } => ErrorKind::NotAvailable,
                _ => ErrorKind::Internal,
            },
            Error::Tracker(e) => e.kind(),
            Error::Template(_) => ErrorKind::InvalidArgument,
            Error::Workflow(e) => match e {
                WorkflowError::UnsupportedSessionType(_) => ErrorKind::UnsupportedOperation,
                _ => ErrorKind::WorkflowCreation,
            },
            Error::Chain(e) => match e {
                ChainError::Timeout => ErrorKind::Timeout,
                ChainError::ArrayRetryUnsupported => ErrorKind::UnsupportedOperation,
                _ => ErrorKind::NotAvailable,
            },
            Error::Output(e) => match e {
                OutputError::Unsupported { .. } => ErrorKind::UnsupportedOperation,
                OutputError::Read { .. } => ErrorKind::Internal,
                _ => ErrorKind::InvalidArgument,
            },
            Error::Stream(_) => ErrorKind::InvalidArgument,
        }
    }

    /// True when the error is a wait that ran into its deadline.
    pub fn is_timeout(&self) -> bool {
        self.kind() == ErrorKind::Timeout
    }
}

/// Configuration-related errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Logging already initialised: {0}")]
    Logging(String),
}

/// Key-value store errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("Connection error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Key not found: {key_type}/{key}")]
    NotFound { key_type: String, key: String },

    #[error("Store is closed")]
    Closed,
}

/// Errors surfaced by job trackers and the session layer around them.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TrackerError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("job {id} not found")]
    NotFound { id: String },

    #[error("job is not running")]
    NotRunning { id: String },

    #[error("job is not suspended")]
    NotSuspended { id: String },

    #[error("job {id} is in state {state}, expected a finished job")]
    NotTerminal { id: String, state: JobState },

    #[error("job already finished in state {state}")]
    AlreadyFinished { id: String, state: JobState },

    #[error("Unsupported Operation: {0}")]
    Unsupported(String),

    #[error("timeout while waiting for job {id}")]
    Timeout { id: String },

    #[error("internal error: {0}")]
    Internal(String),

    #[error("job tracker is shut down")]
    ShutDown,
}

impl TrackerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TrackerError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            TrackerError::NotFound { .. } => ErrorKind::NotAvailable,
            TrackerError::NotRunning { .. }
            | TrackerError::NotSuspended { .. }
            | TrackerError::NotTerminal { .. }
            | TrackerError::AlreadyFinished { .. }
            | TrackerError::ShutDown => ErrorKind::InvalidState,
            TrackerError::Unsupported(_) => ErrorKind::UnsupportedOperation,
            TrackerError::Timeout { .. } => ErrorKind::Timeout,
            TrackerError::Internal(_) => ErrorKind::Internal,
        }
    }
}

/// Template validation, merge and matrix expansion errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    #[error("remote command is empty")]
    EmptyCommand,

    #[error("input path {path} must differ from the output and error path")]
    ConflictingPaths { path: String },

    #[error("deadline {deadline} is already in the past")]
    DeadlinePassed { deadline: String },

    #[error("cannot set field {field} to {value:?}: {reason}")]
    InvalidReplacement {
        field: String,
        value: String,
        reason: String,
    },

    #[error("unknown job template field {0}")]
    UnknownField(String),

    #[error("invalid matrix dimensions: {0}")]
    Dimensions(String),

    #[error("overflow")]
    Overflow,
}

/// Workflow and session construction errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkflowError {
    #[error("context creation failed: {0}")]
    Context(String),

    #[error("error creating ({create}) or opening ({open}) job session \"{name}\"")]
    Session {
        name: String,
        create: String,
        open: String,
    },

    #[error("Session already exists: {name}")]
    SessionExists { name: String },

    #[error("Session does not exist: {name}")]
    SessionNotFound { name: String },

    #[error("no tracker available for session type {0}")]
    UnsupportedSessionType(String),

    #[error("job session is closed")]
    SessionClosed,
}

/// Errors recorded by chain operations that find nothing to operate on.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainError {
    #[error("job task not available")]
    TaskNotAvailable,

    #[error("job not available")]
    JobNotAvailable,

    #[error("task not available")]
    NothingToWaitFor,

    #[error("timeout")]
    Timeout,

    #[error("retry is not supported for job arrays")]
    ArrayRetryUnsupported,
}

/// Errors reading captured job output.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OutputError {
    #[error("path {path:?} is not a local file")]
    ReservedPath { path: String },

    #[error("path {path} is a directory")]
    Directory { path: String },

    #[error("failed to read {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("output not supported for backend {backend}")]
    Unsupported { backend: String },
}

/// Job stream configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    #[error("Template not set")]
    TemplateNotSet,

    #[error("Workflow not set")]
    WorkflowNotSet,

    #[error("BufferSize is not allowed to be negative")]
    NegativeBufferSize,
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
