//! Fatal error taxonomy surfaced at the pipeline boundary.
//!
//! Row-level anomalies (ragged rows, coercion failures, undecodable bytes) are
//! not errors: they are repaired or counted by the row decoder. Everything in
//! [`PipelineError`] aborts the run and is reported with a remediation hint.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("schema error: {0}")]
    Schema(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("I/O error: {context}: {detail}")]
    Io { context: String, detail: String },
    #[error("run cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Schema,
    Config,
    Io,
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorKind::Schema => "SchemaError",
            ErrorKind::Config => "ConfigError",
            ErrorKind::Io => "IOError",
            ErrorKind::Cancelled => "Cancelled",
        };
        f.write_str(label)
    }
}

impl PipelineError {
    pub fn io(context: impl Into<String>, err: impl Into<anyhow::Error>) -> Self {
        let err = err.into();
        PipelineError::Io {
            context: context.into(),
            detail: format!("{err:#}"),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Schema(_) => ErrorKind::Schema,
            PipelineError::Config(_) => ErrorKind::Config,
            PipelineError::Io { .. } => ErrorKind::Io,
            PipelineError::Cancelled => ErrorKind::Cancelled,
        }
    }

    pub fn hint(&self) -> &'static str {
        match self.kind() {
            ErrorKind::Schema => "try the other separator or another encoding",
            ErrorKind::Config => "check the selected columns and the date range",
            ErrorKind::Io => "check that the input is readable and the output location is writable",
            ErrorKind::Cancelled => "run the command again to produce an artifact",
        }
    }
}
