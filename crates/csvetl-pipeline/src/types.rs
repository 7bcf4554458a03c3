//! Core types flowing through the pipeline
//!
//! `RawRecord` → (`TransformedRecord` | `RejectedRecord`) → `LoadBatch` → `FileOutcome` →
//! `RunSummary`.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use crate::error::EtlError;

/// A file found in the input directory at discovery time
#[derive(Debug, Clone, Serialize)]
pub struct SourceFile {
    pub path: PathBuf,
    /// File name, unique within the input directory
    pub name: String,
    pub size_bytes: u64,
    pub discovered_at: DateTime<Utc>,
}

/// One delimited row as read from disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    /// 1-based line on which the record starts
    pub line: u64,
    pub fields: Vec<String>,
    /// Reason the row could not be parsed, if any
    pub malformed: Option<String>,
}

impl RawRecord {
    pub fn new(line: u64, fields: Vec<String>) -> Self {
        Self {
            line,
            fields,
            malformed: None,
        }
    }

    pub fn malformed(line: u64, fields: Vec<String>, reason: impl Into<String>) -> Self {
        Self {
            line,
            fields,
            malformed: Some(reason.into()),
        }
    }

    pub fn is_malformed(&self) -> bool {
        self.malformed.is_some()
    }
}

/// Typed column value produced by coercion
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Text(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

/// Record that passed validation; values follow the target column order
#[derive(Debug, Clone, PartialEq)]
pub struct TransformedRecord {
    line: u64,
    values: Vec<Value>,
}

impl TransformedRecord {
    pub(crate) fn new(line: u64, values: Vec<Value>) -> Self {
        Self { line, values }
    }

    pub fn line(&self) -> u64 {
        self.line
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }
}

/// What kind of check produced a violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ViolationKind {
    ParseError,
    NotNull,
    TypeCheck,
    RangeCheck,
    Custom,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    pub rule: String,
    pub kind: ViolationKind,
    pub message: String,
}

/// Record that failed parsing or validation; never loaded
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedRecord {
    pub line: u64,
    pub fields: Vec<String>,
    pub violations: Vec<Violation>,
}

impl RejectedRecord {
    pub fn is_parse_error(&self) -> bool {
        self.violations
            .iter()
            .any(|v| v.kind == ViolationKind::ParseError)
    }

    /// Error naming every violation, for logs
    pub fn to_error(&self) -> EtlError {
        let message = self
            .violations
            .iter()
            .map(|v| format!("{}: {}", v.rule, v.message))
            .collect::<Vec<_>>()
            .join("; ");
        if self.is_parse_error() {
            EtlError::Parse {
                line: self.line,
                message,
            }
        } else {
            EtlError::Validation {
                line: self.line,
                message,
            }
        }
    }
}

/// Accepted records of one source file, loaded as a single unit
#[derive(Debug, Clone)]
pub struct LoadBatch {
    source: String,
    index: usize,
    records: Vec<TransformedRecord>,
}

impl LoadBatch {
    pub fn new(source: impl Into<String>, index: usize, records: Vec<TransformedRecord>) -> Self {
        Self {
            source: source.into(),
            index,
            records,
        }
    }

    /// Name of the source file every record came from
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn records(&self) -> &[TransformedRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// First and last source line covered by the batch
    pub fn line_span(&self) -> Option<(u64, u64)> {
        let first = self.records.first()?.line();
        let last = self.records.last()?.line();
        Some((first, last))
    }
}

/// Terminal directory of a source file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Placement {
    Archived,
    Errored,
}

impl std::fmt::Display for Placement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Placement::Archived => f.write_str("archived"),
            Placement::Errored => f.write_str("errored"),
        }
    }
}

/// Per-file record accounting
///
/// `read == accepted + rejected + malformed` once a file has been fully read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecordCounts {
    pub read: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub malformed: u64,
    pub loaded: u64,
    pub load_failed: u64,
}

impl std::ops::AddAssign for RecordCounts {
    fn add_assign(&mut self, other: Self) {
        self.read += other.read;
        self.accepted += other.accepted;
        self.rejected += other.rejected;
        self.malformed += other.malformed;
        self.loaded += other.loaded;
        self.load_failed += other.load_failed;
    }
}

/// A batch whose records reached the sink but never committed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedBatch {
    pub index: usize,
    pub first_line: u64,
    pub last_line: u64,
    pub records: usize,
    pub attempts: u32,
    pub error: String,
}

/// Result of driving one file to a terminal state
#[derive(Debug, Clone, Serialize)]
pub struct FileOutcome {
    pub file: String,
    pub fingerprint: Option<String>,
    pub placement: Placement,
    /// Where the file ended up; `None` when it could not be moved
    pub final_path: Option<PathBuf>,
    pub report_path: Option<PathBuf>,
    pub counts: RecordCounts,
    pub failed_batches: Vec<FailedBatch>,
    pub fatal_errors: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl FileOutcome {
    pub fn is_archived(&self) -> bool {
        self.placement == Placement::Archived
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Degraded,
}

/// Aggregate over every file of one invocation
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub discovered: usize,
    pub files: Vec<FileOutcome>,
}

impl RunSummary {
    pub fn new(discovered: usize) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            discovered,
            files: Vec::new(),
        }
    }

    pub fn merge(&mut self, outcome: FileOutcome) {
        self.files.push(outcome);
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    pub fn archived(&self) -> usize {
        self.files.iter().filter(|f| f.is_archived()).count()
    }

    pub fn errored(&self) -> usize {
        self.files.len() - self.archived()
    }

    pub fn totals(&self) -> RecordCounts {
        let mut totals = RecordCounts::default();
        for file in &self.files {
            totals += file.counts;
        }
        totals
    }

    pub fn status(&self) -> RunStatus {
        if self.errored() == 0 {
            RunStatus::Success
        } else {
            RunStatus::Degraded
        }
    }

    pub fn is_success(&self) -> bool {
        self.status() == RunStatus::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(name: &str, placement: Placement, read: u64) -> FileOutcome {
        FileOutcome {
            file: name.to_string(),
            fingerprint: None,
            placement,
            final_path: None,
            report_path: None,
            counts: RecordCounts {
                read,
                accepted: read,
                loaded: read,
                ..RecordCounts::default()
            },
            failed_batches: Vec::new(),
            fatal_errors: Vec::new(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
        }
    }

    #[test]
    fn test_summary_status_degrades_on_any_error() {
        let mut summary = RunSummary::new(2);
        summary.merge(outcome("a.csv", Placement::Archived, 3));
        assert!(summary.is_success());

        summary.merge(outcome("b.csv", Placement::Errored, 4));
        assert_eq!(summary.status(), RunStatus::Degraded);
        assert_eq!(summary.archived(), 1);
        assert_eq!(summary.errored(), 1);
        assert_eq!(summary.totals().read, 7);
    }

    #[test]
    fn test_rejected_record_error_names_line_and_rules() {
        let record = RejectedRecord {
            line: 4,
            fields: vec!["3".into(), "abc".into()],
            violations: vec![Violation {
                rule: "type_check:amt".into(),
                kind: ViolationKind::TypeCheck,
                message: "column 'amt': 'abc' is not a number".into(),
            }],
        };
        let err = record.to_error();
        assert_eq!(err.category(), "validation-error");
        assert_eq!(
            err.to_string(),
            "Validation error at line 4: type_check:amt: column 'amt': 'abc' is not a number"
        );

        let malformed = RejectedRecord {
            violations: vec![Violation {
                rule: "parse-error".into(),
                kind: ViolationKind::ParseError,
                message: "expected 2 fields, found 1".into(),
            }],
            ..record
        };
        assert!(matches!(malformed.to_error(), EtlError::Parse { line: 4, .. }));
    }

    #[test]
    fn test_batch_line_span() {
        let batch = LoadBatch::new(
            "a.csv",
            0,
            vec![
                TransformedRecord::new(2, vec![Value::Integer(1)]),
                TransformedRecord::new(5, vec![Value::Integer(2)]),
            ],
        );
        assert_eq!(batch.line_span(), Some((2, 5)));
        assert!(LoadBatch::new("a.csv", 1, Vec::new()).line_span().is_none());
    }
}
