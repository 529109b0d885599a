// dbbackup/src/errors.rs
use std::process::ExitStatus;
use std::time::Duration;
use thiserror::Error;

use crate::model::JobStatus;

/// Malformed or incomplete backup request. Returned synchronously from `submit`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid backup request: {0}")]
pub struct ValidationError(pub String);

/// Type tag with no registered dump strategy.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unsupported backup type: {0}")]
pub struct UnsupportedTypeError(pub String);

/// A dump attempt that did not produce a usable artifact.
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("failed to start {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} failed: {status}, output: {output}")]
    ToolFailed {
        tool: String,
        status: ExitStatus,
        output: String,
    },

    #[error("I/O error while preparing backup: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to verify backup file {path}: {source}")]
    Verify {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("backup file is empty: {0}")]
    EmptyOutput(String),

    #[error("invalid connection for {tool}: {reason}")]
    Connection { tool: String, reason: String },

    #[error("backup timed out after {0:?}")]
    TimedOut(Duration),

    #[error("backup cancelled before completion")]
    Cancelled,
}

/// Object storage failure. Never fatal to a job.
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to upload {key}: {message}")]
    Put { key: String, message: String },

    #[error("failed to delete {key}: {message}")]
    Delete { key: String, message: String },

    #[error("failed to presign {key}: {message}")]
    Presign { key: String, message: String },
}

/// Webhook delivery failure. Logged only.
#[derive(Error, Debug)]
pub enum NotificationError {
    #[error("webhook request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("webhook {url} answered with status {status}")]
    Status { url: String, status: u16 },
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("job {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("record already exists: {0}")]
    Duplicate(String),

    #[error("metadata store unavailable: {0}")]
    Unavailable(String),

    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("invalid cron expression '{expression}' for config {config_id}: {message}")]
    InvalidCron {
        config_id: String,
        expression: String,
        message: String,
    },

    #[error("cron scheduler error: {0}")]
    Cron(#[from] tokio_cron_scheduler::JobSchedulerError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
