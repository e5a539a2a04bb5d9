//! Error type definitions for the director
//!
//! The hierarchy follows the failure taxonomy of the job engine: configuration
//! problems are fatal to a single submission, queue problems are fatal to the
//! process, and execution problems become a terminal job status.

use thiserror::Error;

/// Top-level director error type
#[derive(Error, Debug)]
pub enum DirectorError {
    /// Configuration or resource resolution errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Catalog collaborator failures
    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    /// Job queue failures
    #[error("Job queue error: {0}")]
    Queue(#[from] QueueError),

    /// Job type handler failures
    #[error("Job handler error: {0}")]
    Handler(#[from] HandlerError),

    /// A resource referenced by name does not exist
    #[error("Not found: {resource} \"{name}\"")]
    NotFound { resource: String, name: String },

    /// Submission of a job that was canceled before it was queued
    #[error("Job {job} was canceled before it could be queued")]
    JobCanceled { job: String },

    /// Generic internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Configuration loading and validation errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The configuration source could not be read or parsed
    #[error("Failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    /// A resource name appears more than once
    #[error("Duplicate {resource} resource \"{name}\"")]
    Duplicate { resource: String, name: String },

    /// A resource refers to another resource that is not defined
    #[error("{owner} references undefined {resource} \"{name}\"")]
    UndefinedReference {
        owner: String,
        resource: String,
        name: String,
    },

    /// A field holds a value outside its permitted range
    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

/// Catalog collaborator errors
#[derive(Error, Debug)]
pub enum CatalogError {
    /// The catalog connection could not be opened
    #[error("Could not open catalog \"{catalog}\": {message}")]
    Open { catalog: String, message: String },

    /// A catalog statement failed
    #[error("Catalog query failed: {operation} - {message}")]
    Query { operation: String, message: String },

    /// A record the caller relies on does not exist
    #[error("Catalog record not found: {record} {id}")]
    RecordNotFound { record: String, id: String },
}

/// Job queue errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// The queue has been destroyed and accepts no more work
    #[error("Job queue is shut down")]
    ShutDown,

    /// The job is not in the waiting list (already running or finished)
    #[error("Job {job} is not in the wait queue")]
    NotWaiting { job: String },

    /// A worker or waiter task could not be started
    #[error("Could not start queue task: {message}")]
    Spawn { message: String },
}

/// Errors reported by job type handlers and run scripts
#[derive(Error, Debug)]
pub enum HandlerError {
    /// No handler is registered for the job type
    #[error("Unimplemented job type: {job_type}")]
    Unimplemented { job_type: String },

    /// A remote daemon refused or dropped the session
    #[error("{daemon} daemon error: {message}")]
    Daemon { daemon: String, message: String },

    /// The job failed in a way that must not be retried by the handler
    #[error("Fatal error: {message}")]
    Fatal { message: String },

    /// A run script exited unsuccessfully
    #[error("Script \"{command}\" failed: {message}")]
    Script { command: String, message: String },

    /// I/O errors while spawning external commands
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DirectorError {
    /// Create a not-found error for a named resource
    pub fn not_found<R: Into<String>, N: Into<String>>(resource: R, name: N) -> Self {
        Self::NotFound {
            resource: resource.into(),
            name: name.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

impl ConfigError {
    /// Create an undefined-reference error
    pub fn undefined<O: Into<String>, R: Into<String>, N: Into<String>>(
        owner: O,
        resource: R,
        name: N,
    ) -> Self {
        Self::UndefinedReference {
            owner: owner.into(),
            resource: resource.into(),
            name: name.into(),
        }
    }

    /// Create an invalid-value error
    pub fn invalid<F: Into<String>, M: Into<String>>(field: F, message: M) -> Self {
        Self::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl CatalogError {
    /// Create a query error
    pub fn query<O: Into<String>, M: Into<String>>(operation: O, message: M) -> Self {
        Self::Query {
            operation: operation.into(),
            message: message.into(),
        }
    }
}

impl HandlerError {
    /// Whether the failure should end the job as FatalError rather than ErrorTerminated
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal { .. })
    }
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Load(Box::new(err))
    }
}
