//! File pipeline controller
//!
//! Drives one claimed file through extract, transform and load, then places it. Reading
//! runs on the blocking pool and hands batches over a channel of capacity one, so a file
//! never has more than a couple of batches in memory. Every failure is caught here and
//! becomes part of the file's outcome; nothing escapes to sibling files.

use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::report::ErrorReport;
use super::storage::FileStore;
use crate::error::{EtlError, Result};
use crate::extract::{ChunkReader, CsvFormat, SourceReader};
use crate::load::BatchLoader;
use crate::transform::{FieldBinding, Outcome, Validator};
use crate::types::{
    FailedBatch, FileOutcome, LoadBatch, Placement, RawRecord, RecordCounts, RejectedRecord,
    SourceFile,
};

/// Lifecycle of one claimed file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Claimed,
    Extracting,
    TransformingLoading,
    Finalizing,
    Archived,
    Errored,
}

impl Lifecycle {
    pub fn can_advance_to(self, next: Lifecycle) -> bool {
        use Lifecycle::*;
        matches!(
            (self, next),
            (Claimed, Extracting)
                | (Claimed, Finalizing)
                | (Extracting, TransformingLoading)
                | (Extracting, Finalizing)
                | (TransformingLoading, Finalizing)
                | (Finalizing, Archived)
                | (Finalizing, Errored)
        )
    }
}

/// Opens a claimed file for batched reading
type Opener =
    Arc<dyn Fn(&Path, &CsvFormat, usize) -> Result<ChunkReader<SourceReader>> + Send + Sync>;

/// Messages from the blocking reader to the controller
enum ReaderEvent {
    Opened { headers: Option<Vec<String>> },
    Batch(Vec<RawRecord>),
    Failed(EtlError),
}

/// Mutable state of one file while it is in flight
struct FileRun {
    name: String,
    state: Lifecycle,
    counts: RecordCounts,
    rejected: Vec<RejectedRecord>,
    failed_batches: Vec<FailedBatch>,
    fatal_errors: Vec<String>,
}

impl FileRun {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Lifecycle::Claimed,
            counts: RecordCounts::default(),
            rejected: Vec::new(),
            failed_batches: Vec::new(),
            fatal_errors: Vec::new(),
        }
    }

    fn enter(&mut self, next: Lifecycle) {
        if self.state == next {
            return;
        }
        if self.state.can_advance_to(next) {
            debug!(file = %self.name, from = ?self.state, to = ?next, "Lifecycle transition");
            self.state = next;
        } else {
            self.fatal(EtlError::Internal(format!(
                "invalid lifecycle transition {:?} -> {next:?}",
                self.state
            )));
        }
    }

    fn fatal(&mut self, err: EtlError) {
        error!(file = %self.name, category = err.category(), error = %err, "File failed");
        self.fatal_errors.push(err.to_string());
    }

    fn placement(&self) -> Placement {
        if self.fatal_errors.is_empty() && self.failed_batches.is_empty() {
            Placement::Archived
        } else {
            Placement::Errored
        }
    }

    fn needs_report(&self) -> bool {
        !self.rejected.is_empty() || !self.failed_batches.is_empty() || !self.fatal_errors.is_empty()
    }
}

/// Runs files to a terminal placement
pub struct FileController {
    store: Arc<FileStore>,
    validator: Arc<Validator>,
    loader: BatchLoader,
    format: CsvFormat,
    batch_size: usize,
    cancel: CancellationToken,
    opener: Opener,
}

impl FileController {
    pub fn new(
        store: Arc<FileStore>,
        validator: Arc<Validator>,
        loader: BatchLoader,
        format: CsvFormat,
        batch_size: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            validator,
            loader,
            format,
            batch_size,
            cancel,
            opener: Arc::new(|path: &Path, format: &CsvFormat, batch_size: usize| {
                ChunkReader::open(path, format, batch_size)
            }),
        }
    }

    #[cfg(test)]
    fn with_opener(mut self, opener: Opener) -> Self {
        self.opener = opener;
        self
    }

    /// Process a claimed file sitting at `claimed`
    ///
    /// Always returns an outcome; the file ends archived or errored.
    #[instrument(skip_all, fields(file = %file.name))]
    pub async fn process(&self, file: SourceFile, claimed: PathBuf) -> FileOutcome {
        let started_at = Utc::now();
        let mut run = FileRun::new(&file.name);
        info!(size_bytes = file.size_bytes, "Processing file");

        let fingerprint = match fingerprint(&claimed).await {
            Ok(fp) => Some(fp),
            Err(e) => {
                run.fatal(e);
                None
            },
        };

        if run.fatal_errors.is_empty() {
            self.stream(&claimed, &mut run).await;
        }

        self.finalize(file, claimed, fingerprint, run, started_at).await
    }

    async fn stream(&self, path: &Path, run: &mut FileRun) {
        run.enter(Lifecycle::Extracting);

        let (tx, mut rx) = mpsc::channel(1);
        let producer = {
            let path = path.to_path_buf();
            let format = self.format.clone();
            let batch_size = self.batch_size;
            let opener = self.opener.clone();
            tokio::task::spawn_blocking(move || {
                read_file(|| opener(path.as_path(), &format, batch_size), tx)
            })
        };

        let mut binding: Option<FieldBinding> = None;
        let mut index = 0;

        while let Some(event) = rx.recv().await {
            match event {
                ReaderEvent::Opened { headers } => {
                    match self.validator.schema().bind(headers.as_deref()) {
                        Ok(b) => binding = Some(b),
                        Err(e) => {
                            run.fatal(e);
                            break;
                        },
                    }
                },
                ReaderEvent::Batch(records) => {
                    if self.cancel.is_cancelled() {
                        run.fatal(EtlError::Internal("run cancelled before file completed".into()));
                        break;
                    }
                    let Some(binding) = binding.as_ref() else {
                        run.fatal(EtlError::Internal("batch received before header".into()));
                        break;
                    };
                    run.enter(Lifecycle::TransformingLoading);
                    if !self.process_batch(records, binding, index, run).await {
                        break;
                    }
                    index += 1;
                },
                ReaderEvent::Failed(e) => {
                    run.fatal(e);
                    break;
                },
            }
        }

        // closing the receiver stops the reader, which drops the file
        drop(rx);
        if let Err(e) = producer.await {
            run.fatal(EtlError::Internal(format!("reader task failed: {e}")));
        }
    }

    /// Validate and load one batch; `false` stops the file
    async fn process_batch(
        &self,
        records: Vec<RawRecord>,
        binding: &FieldBinding,
        index: usize,
        run: &mut FileRun,
    ) -> bool {
        let mut accepted = Vec::with_capacity(records.len());
        run.counts.read += records.len() as u64;

        for record in records {
            match self.validator.validate(record, binding) {
                Outcome::Accepted(record) => accepted.push(record),
                Outcome::Rejected(record) => {
                    debug!(error = %record.to_error(), "Record rejected");
                    if record.is_parse_error() {
                        run.counts.malformed += 1;
                    } else {
                        run.counts.rejected += 1;
                    }
                    run.rejected.push(record);
                },
            }
        }
        run.counts.accepted += accepted.len() as u64;

        let batch = LoadBatch::new(run.name.clone(), index, accepted);
        if batch.is_empty() {
            return true;
        }

        match self.loader.load(&batch).await {
            Ok(attempts) => {
                run.counts.loaded += batch.len() as u64;
                debug!(batch = index, records = batch.len(), attempts, "Batch loaded");
                true
            },
            Err(failure) => {
                let (first_line, last_line) = batch.line_span().unwrap_or_default();
                run.counts.load_failed += batch.len() as u64;
                run.failed_batches.push(FailedBatch {
                    index,
                    first_line,
                    last_line,
                    records: batch.len(),
                    attempts: failure.attempts,
                    error: failure.error.to_string(),
                });
                run.fatal(failure.into_error(index));
                false
            },
        }
    }

    async fn finalize(
        &self,
        file: SourceFile,
        claimed: PathBuf,
        fingerprint: Option<String>,
        mut run: FileRun,
        started_at: chrono::DateTime<Utc>,
    ) -> FileOutcome {
        run.enter(Lifecycle::Finalizing);

        let mut placement = run.placement();
        let mut terminal = self.store.terminal_path(&file.name, placement, Utc::now()).await;
        let mut report_path = None;

        if run.needs_report() {
            let report = ErrorReport {
                file: file.name.clone(),
                fingerprint: fingerprint.clone(),
                placement,
                generated_at: Utc::now(),
                counts: run.counts,
                fatal_errors: run.fatal_errors.clone(),
                failed_batches: run.failed_batches.clone(),
                rejected: std::mem::take(&mut run.rejected),
            };
            match self.store.write_report(&terminal, &report).await {
                Ok(path) => report_path = Some(path),
                Err(e) => {
                    // rejected records must not vanish silently
                    run.fatal(e);
                    if placement == Placement::Archived {
                        placement = Placement::Errored;
                        terminal = self.store.terminal_path(&file.name, placement, Utc::now()).await;
                    }
                },
            }
        }

        let final_path = match self.store.place(&claimed, &terminal).await {
            Ok(()) => Some(terminal),
            Err(e) => {
                run.fatal(e);
                placement = Placement::Errored;
                // the report describes a placement that did not happen
                if let Some(report) = report_path.take() {
                    if let Err(e) = self.store.discard_report(&report).await {
                        run.fatal(e);
                    }
                }
                None
            },
        };

        run.enter(match placement {
            Placement::Archived => Lifecycle::Archived,
            Placement::Errored => Lifecycle::Errored,
        });

        let outcome = FileOutcome {
            file: file.name,
            fingerprint,
            placement,
            final_path,
            report_path,
            counts: run.counts,
            failed_batches: run.failed_batches,
            fatal_errors: run.fatal_errors,
            started_at,
            finished_at: Utc::now(),
        };

        if outcome.is_archived() {
            info!(
                read = outcome.counts.read,
                loaded = outcome.counts.loaded,
                rejected = outcome.counts.rejected + outcome.counts.malformed,
                "File archived"
            );
        } else {
            warn!(
                read = outcome.counts.read,
                loaded = outcome.counts.loaded,
                load_failed = outcome.counts.load_failed,
                errors = outcome.fatal_errors.len(),
                "File errored"
            );
        }
        outcome
    }
}

async fn fingerprint(path: &Path) -> Result<String> {
    let owned = path.to_path_buf();
    tokio::task::spawn_blocking(move || csvetl_common::checksum::fingerprint_file(&owned))
        .await
        .map_err(|e| EtlError::Internal(format!("fingerprint task failed: {e}")))?
        .map_err(|csvetl_common::CommonError::Io(source)| EtlError::io(path, source))
}

/// Blocking producer; returns once the file is exhausted, fails, or the receiver is gone
fn read_file(
    open: impl FnOnce() -> Result<ChunkReader<SourceReader>>,
    tx: mpsc::Sender<ReaderEvent>,
) {
    let reader = match open() {
        Ok(reader) => reader,
        Err(e) => {
            let _ = tx.blocking_send(ReaderEvent::Failed(e));
            return;
        },
    };

    let headers = reader.headers().map(<[String]>::to_vec);
    if tx.blocking_send(ReaderEvent::Opened { headers }).is_err() {
        return;
    }

    for batch in reader {
        let event = match batch {
            Ok(records) => ReaderEvent::Batch(records),
            Err(e) => ReaderEvent::Failed(e),
        };
        if tx.blocking_send(event).is_err() {
            return;
        }
    }
}
