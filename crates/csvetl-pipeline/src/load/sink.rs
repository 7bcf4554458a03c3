//! Sink capability consumed by the batch loader

use async_trait::async_trait;
use thiserror::Error;

use crate::error::EtlError;
use crate::types::LoadBatch;

/// Failure class reported by a sink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkErrorKind {
    Timeout,
    Connection,
    /// Deadlock or serialization conflict
    Conflict,
    Constraint,
    SchemaMismatch,
    Other,
}

impl SinkErrorKind {
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            SinkErrorKind::Timeout | SinkErrorKind::Connection | SinkErrorKind::Conflict
        )
    }
}

impl std::fmt::Display for SinkErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SinkErrorKind::Timeout => "timeout",
            SinkErrorKind::Connection => "connection",
            SinkErrorKind::Conflict => "conflict",
            SinkErrorKind::Constraint => "constraint",
            SinkErrorKind::SchemaMismatch => "schema-mismatch",
            SinkErrorKind::Other => "other",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind} error: {message}")]
pub struct SinkError {
    pub kind: SinkErrorKind,
    pub message: String,
}

impl SinkError {
    pub fn new(kind: SinkErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }

    /// Pipeline error for a failed submission of batch `batch`
    pub fn into_error(self, batch: usize) -> EtlError {
        if self.is_transient() {
            EtlError::TransientSink(self.to_string())
        } else {
            EtlError::NonTransientSink {
                batch,
                message: self.to_string(),
            }
        }
    }
}

/// Destination that commits a batch atomically or not at all
#[async_trait]
pub trait Sink: Send + Sync {
    /// Commit every record of `batch`, or none of them
    async fn submit(&self, batch: &LoadBatch) -> Result<(), SinkError>;

    /// Human-readable destination, used in logs
    fn describe(&self) -> String {
        "sink".to_string()
    }
}
