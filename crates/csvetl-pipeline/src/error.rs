//! Error taxonomy for the ETL pipeline
//!
//! Record-level problems (`Parse`, `Validation`) never travel as `Err`: the validator turns
//! them into rejected records. The variants exist so reports and logs can name them.
//! File-level errors end a single file in the error directory. Only `Configuration`
//! aborts a run.

use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, EtlError>;

#[derive(Error, Debug)]
pub enum EtlError {
    /// Malformed record (wrong field count, unterminated quote, bad encoding)
    #[error("Parse error at line {line}: {message}")]
    Parse { line: u64, message: String },

    /// Rule violation on a single record
    #[error("Validation error at line {line}: {message}")]
    Validation { line: u64, message: String },

    /// Retryable sink failure (timeout, connection, serialization conflict)
    #[error("Transient sink error: {0}")]
    TransientSink(String),

    /// Sink failure that ends the owning file
    #[error("Sink rejected batch {batch}: {message}")]
    NonTransientSink { batch: usize, message: String },

    /// File could not be opened, read, moved or written
    #[error("IO error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Header does not carry a configured source column
    #[error("Schema error: {0}")]
    Schema(String),

    /// Invalid rule, column mapping or setting; detected before any file is claimed
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Worker failure that is not attributable to the input (panic, join failure)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EtlError {
    pub fn io(path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        EtlError::Io {
            path: path.as_ref().display().to_string(),
            source,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        EtlError::Configuration(message.into())
    }

    /// Short machine-friendly category used in reports
    pub fn category(&self) -> &'static str {
        match self {
            EtlError::Parse { .. } => "parse-error",
            EtlError::Validation { .. } => "validation-error",
            EtlError::TransientSink(_) => "transient-sink-error",
            EtlError::NonTransientSink { .. } => "load-failed",
            EtlError::Io { .. } => "io-error",
            EtlError::Schema(_) => "schema-error",
            EtlError::Configuration(_) => "configuration-error",
            EtlError::Internal(_) => "internal-error",
        }
    }
}
