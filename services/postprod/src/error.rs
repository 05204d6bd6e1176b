//! Error taxonomy for record processing.
//!
//! Every error here is scoped to a single record. Stages convert them into a
//! failed gate; none of them aborts a batch.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// The storage key does not match any layout the pipeline understands
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unrecognized key layout: {key}")]
pub struct ParseError {
    pub key: String,
}

/// Object store or HTTP transfer failures
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("failed to download s3://{bucket}/{key}: {message}")]
    Download {
        bucket: String,
        key: String,
        message: String,
    },

    #[error("failed to upload {path} to s3://{bucket}/{key}: {message}")]
    Upload {
        path: PathBuf,
        bucket: String,
        key: String,
        message: String,
    },

    #[error("failed to fetch {url}: {message}")]
    Http { url: String, message: String },

    #[error("local I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// External media tool failures
#[derive(Error, Debug)]
pub enum ToolError {
    #[error("failed to spawn {tool}: {message}")]
    Spawn { tool: String, message: String },

    #[error("{tool} timed out after {timeout:?}")]
    Timeout { tool: String, timeout: Duration },

    #[error("{tool} not started: only {remaining:?} left before the deadline")]
    DeadlineExceeded { tool: String, remaining: Duration },

    #[error("{tool} produced no artifact at {expected} (exit code {exit_code:?})")]
    NoArtifact {
        tool: String,
        expected: PathBuf,
        exit_code: Option<i32>,
    },

    #[error("{tool} output is not a number: {output:?}")]
    Unparseable { tool: String, output: String },
}

/// Metadata store write failures
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("failed to update attributes of asset {asset_id}: {message}")]
    Update { asset_id: String, message: String },
}

/// Error raised by a single stage. Converted to a failed gate by the chain.
#[derive(Error, Debug)]
pub enum StageError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("failed to create staging directory {path}: {source}")]
    Staging {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("article document is unusable: {0}")]
    Article(String),

    #[error("{stage} not started: only {remaining:?} left of the batch budget")]
    DeadlineExceeded {
        stage: &'static str,
        remaining: Duration,
    },

    #[error("missing input: {0}")]
    MissingInput(String),

    #[error("stage panicked: {0}")]
    Panicked(String),
}

/// Batch-level rejection; record failures never surface here
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BatchError {
    #[error("no pipeline registered for {0}")]
    UnsupportedPipeline(crate::record::PipelineKind),
}

/// Error category reported in a failed stage result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Parse,
    Staging,
    Transfer,
    Tool,
    Persistence,
    Article,
    Deadline,
    MissingInput,
    Panic,
}

impl StageError {
    /// Category of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            StageError::Parse(_) => ErrorKind::Parse,
            StageError::Staging { .. } => ErrorKind::Staging,
            StageError::Transfer(_) => ErrorKind::Transfer,
            StageError::Tool(ToolError::DeadlineExceeded { .. }) => ErrorKind::Deadline,
            StageError::Tool(_) => ErrorKind::Tool,
            StageError::Persistence(_) => ErrorKind::Persistence,
            StageError::Article(_) => ErrorKind::Article,
            StageError::DeadlineExceeded { .. } => ErrorKind::Deadline,
            StageError::MissingInput(_) => ErrorKind::MissingInput,
            StageError::Panicked(_) => ErrorKind::Panic,
        }
    }
}
