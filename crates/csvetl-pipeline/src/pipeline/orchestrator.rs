//! Run orchestrator
//!
//! Takes a snapshot of the input directory, then lets a bounded set of workers drain it.
//! The queue of unclaimed files and the run summary are the only state the workers share,
//! and each is mutated under its own lock: one pop per claim, one push per merge.

use chrono::Utc;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use super::controller::FileController;
use super::storage::FileStore;
use crate::config::PipelineConfig;
use crate::error::{EtlError, Result};
use crate::load::{BatchLoader, Sink};
use crate::transform::{Extensions, Validator};
use crate::types::{FileOutcome, Placement, RecordCounts, RunSummary, SourceFile};

/// Files discovered for this run and not yet taken by a worker
#[derive(Debug, Default)]
pub struct InputQueue {
    files: Mutex<VecDeque<SourceFile>>,
}

impl InputQueue {
    pub fn new(files: Vec<SourceFile>) -> Self {
        Self {
            files: Mutex::new(files.into()),
        }
    }

    /// Remove and return the next file; each file is handed out once
    pub async fn take(&self) -> Option<SourceFile> {
        self.files.lock().await.pop_front()
    }

    pub async fn len(&self) -> usize {
        self.files.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.files.lock().await.is_empty()
    }
}

pub struct Orchestrator {
    store: Arc<FileStore>,
    controller: Arc<FileController>,
    max_workers: usize,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        store: Arc<FileStore>,
        controller: Arc<FileController>,
        max_workers: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            controller,
            max_workers: max_workers.max(1),
            cancel,
        }
    }

    /// Wire the pipeline from configuration
    ///
    /// Column schema, transformations and rules are compiled here, so configuration errors
    /// surface before any file is claimed.
    pub fn from_config(
        config: &PipelineConfig,
        sink: Arc<dyn Sink>,
        extensions: &Extensions,
        cancel: CancellationToken,
    ) -> Result<Self> {
        config.validate()?;
        let validator = config.validator(extensions)?;
        Self::with_validator(config, validator, sink, cancel)
    }

    /// Wire the pipeline around a validator compiled ahead of time
    pub fn with_validator(
        config: &PipelineConfig,
        validator: Validator,
        sink: Arc<dyn Sink>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let validator = Arc::new(validator);
        let store = Arc::new(FileStore::new(config.storage_layout())?);
        let loader = BatchLoader::new(sink, config.retry_policy());

        let controller = Arc::new(FileController::new(
            store.clone(),
            validator,
            loader,
            config.csv_format()?,
            config.csv.batch_size,
            cancel.clone(),
        ));

        Ok(Self::new(store, controller, config.processing.max_workers, cancel))
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Process every file present at start and return the run summary
    ///
    /// Fails only when the directories cannot be prepared or listed; per-file failures
    /// are part of the summary.
    #[instrument(skip(self), fields(workers = self.max_workers))]
    pub async fn run(&self) -> Result<RunSummary> {
        self.store.ensure_dirs().await?;
        let files = self.store.discover().await?;
        let summary = Arc::new(Mutex::new(RunSummary::new(files.len())));

        if files.is_empty() {
            info!("No input files found");
        } else {
            let workers = self.max_workers.min(files.len());
            info!(files = files.len(), workers, "Starting run");

            let queue = Arc::new(InputQueue::new(files));
            let mut set = JoinSet::new();
            for worker in 0..workers {
                set.spawn(worker_loop(
                    worker,
                    queue.clone(),
                    self.store.clone(),
                    self.controller.clone(),
                    summary.clone(),
                    self.cancel.clone(),
                ));
            }

            while let Some(joined) = set.join_next().await {
                if let Err(e) = joined {
                    error!(error = %e, "Worker task failed");
                }
            }

            let left = queue.len().await;
            if left > 0 {
                warn!(files = left, "Run cancelled; unclaimed files left in input");
            }
        }

        let mut summary = summary.lock().await.clone();
        summary.finish();
        log_summary(&summary);
        Ok(summary)
    }
}

async fn worker_loop(
    worker: usize,
    queue: Arc<InputQueue>,
    store: Arc<FileStore>,
    controller: Arc<FileController>,
    summary: Arc<Mutex<RunSummary>>,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            info!(worker, "Cancellation requested; worker stopping");
            break;
        }
        let Some(file) = queue.take().await else {
            break;
        };

        let outcome = match store.claim(&file).await {
            Ok(Some(claimed)) => run_file(&store, &controller, file, claimed).await,
            Ok(None) => {
                info!(worker, file = %file.name, "File already claimed elsewhere; skipping");
                continue;
            },
            Err(e) => unclaimed_outcome(file, e),
        };

        summary.lock().await.merge(outcome);
    }
}

/// Run the controller in its own task so a panic is contained to this file
async fn run_file(
    store: &FileStore,
    controller: &Arc<FileController>,
    file: SourceFile,
    claimed: PathBuf,
) -> FileOutcome {
    let started_at = Utc::now();
    let task = {
        let controller = controller.clone();
        let file = file.clone();
        let claimed = claimed.clone();
        tokio::spawn(async move { controller.process(file, claimed).await })
    };

    match task.await {
        Ok(outcome) => outcome,
        Err(join) => {
            let err = EtlError::Internal(format!("file task failed: {join}"));
            error!(file = %file.name, error = %err, "Quarantining file");
            let (final_path, mut fatal_errors) = match store.quarantine(&claimed, &file.name).await {
                Ok(path) => (Some(path), Vec::new()),
                Err(e) => (None, vec![e.to_string()]),
            };
            fatal_errors.insert(0, err.to_string());
            FileOutcome {
                file: file.name,
                fingerprint: None,
                placement: Placement::Errored,
                final_path,
                report_path: None,
                counts: RecordCounts::default(),
                failed_batches: Vec::new(),
                fatal_errors,
                started_at,
                finished_at: Utc::now(),
            }
        },
    }
}

/// Outcome for a file whose claim failed for a reason other than a lost race
fn unclaimed_outcome(file: SourceFile, err: EtlError) -> FileOutcome {
    error!(file = %file.name, error = %err, "Could not claim file");
    let now = Utc::now();
    FileOutcome {
        file: file.name,
        fingerprint: None,
        placement: Placement::Errored,
        final_path: None,
        report_path: None,
        counts: RecordCounts::default(),
        failed_batches: Vec::new(),
        fatal_errors: vec![err.to_string()],
        started_at: now,
        finished_at: now,
    }
}

fn log_summary(summary: &RunSummary) {
    for file in &summary.files {
        info!(
            file = %file.file,
            placement = %file.placement,
            read = file.counts.read,
            loaded = file.counts.loaded,
            rejected = file.counts.rejected,
            malformed = file.counts.malformed,
            load_failed = file.counts.load_failed,
            "File result"
        );
    }
    let totals = summary.totals();
    info!(
        run_id = %summary.run_id,
        status = ?summary.status(),
        files = summary.files.len(),
        archived = summary.archived(),
        errored = summary.errored(),
        read = totals.read,
        accepted = totals.accepted,
        rejected = totals.rejected,
        loaded = totals.loaded,
        load_failed = totals.load_failed,
        "Run finished"
    );
}
