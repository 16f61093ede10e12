// src/core/error.rs

use std::time::Duration;

use thiserror::Error;

use crate::core::models::ScannerKind;

/// Failure to turn an organization into a list of scan targets. Aborts the run.
#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("unknown organization: {0}")]
    UnknownOrganization(String),

    #[error("inventory lookup failed: {0}")]
    Inventory(#[from] StorageError),
}

/// Failure of a single scanner invocation. Always scoped to one target.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("{tool} timed out after {}s", .after.as_secs())]
    Timeout { tool: String, after: Duration },

    #[error("{tool} failed: {reason}")]
    ProcessFailure { tool: String, reason: String },

    #[error("{tool} produced malformed output: {reason}")]
    OutputMalformed { tool: String, reason: String },

    #[error("{tool} was cancelled")]
    Cancelled { tool: String },
}

impl ScanError {
    pub fn malformed(tool: &str, reason: impl ToString) -> Self {
        ScanError::OutputMalformed {
            tool: tool.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn process(tool: &str, reason: impl ToString) -> Self {
        ScanError::ProcessFailure {
            tool: tool.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Errors surfaced by the storage layer. Never retried internally.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("corrupt structured data: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid stored value in column {column}: {value}")]
    InvalidColumn { column: &'static str, value: String },

    #[error("failed to prepare database location: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage task aborted: {0}")]
    Task(String),
}

/// Errors that end an orchestrator run.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error("storing {source_kind} results for {target} failed: {error}")]
    Storage {
        target: String,
        source_kind: ScannerKind,
        #[source]
        error: StorageError,
    },
}
