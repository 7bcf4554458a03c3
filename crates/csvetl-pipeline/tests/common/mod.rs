//! Shared fixtures for pipeline integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use csvetl_pipeline::config::PipelineConfig;
use csvetl_pipeline::load::{Sink, SinkError, SinkErrorKind};
use csvetl_pipeline::transform::{Bound, ColumnSpec, ColumnType, RuleSpec};
use csvetl_pipeline::types::LoadBatch;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tempfile::TempDir;

/// Decides the response for a submission: (batch, attempt number starting at 1)
type Script = Box<dyn Fn(&LoadBatch, usize) -> Result<(), SinkError> + Send + Sync>;

/// In-memory sink that records commits and replays scripted failures
pub struct ScriptedSink {
    script: Script,
    delay: Duration,
    attempts: Mutex<HashMap<(String, usize), usize>>,
    committed: Mutex<Vec<(String, usize, usize)>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedSink {
    pub fn accepting() -> Self {
        Self::with_script(|_, _| Ok(()))
    }

    pub fn with_script(
        script: impl Fn(&LoadBatch, usize) -> Result<(), SinkError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            script: Box::new(script),
            delay: Duration::ZERO,
            attempts: Mutex::new(HashMap::new()),
            committed: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Rejects every batch of `file` with a constraint violation
    pub fn rejecting_file(file: &'static str) -> Self {
        Self::with_script(move |batch, _| {
            if batch.source() == file {
                Err(SinkError::new(SinkErrorKind::Constraint, "duplicate key value"))
            } else {
                Ok(())
            }
        })
    }

    /// Times out `failures` times per batch before committing
    pub fn flaky(failures: usize) -> Self {
        Self::with_script(move |_, attempt| {
            if attempt <= failures {
                Err(SinkError::new(SinkErrorKind::Timeout, "statement timeout"))
            } else {
                Ok(())
            }
        })
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Committed records per source file
    pub fn committed_records(&self, file: &str) -> usize {
        self.committed
            .lock()
            .unwrap()
            .iter()
            .filter(|(source, _, _)| source == file)
            .map(|(_, _, records)| records)
            .sum()
    }

    pub fn committed_batches(&self) -> usize {
        self.committed.lock().unwrap().len()
    }

    pub fn total_attempts(&self) -> usize {
        self.attempts.lock().unwrap().values().sum()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Sink for ScriptedSink {
    async fn submit(&self, batch: &LoadBatch) -> Result<(), SinkError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let count = attempts
                .entry((batch.source().to_string(), batch.index()))
                .or_insert(0);
            *count += 1;
            *count
        };

        let result = (self.script)(batch, attempt);
        if result.is_ok() {
            self.committed
                .lock()
                .unwrap()
                .push((batch.source().to_string(), batch.index(), batch.len()));
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Temporary lifecycle directories
pub struct Workspace {
    pub dir: TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        for sub in ["input", "processing", "archive", "error"] {
            std::fs::create_dir_all(dir.path().join(sub)).unwrap();
        }
        Self { dir }
    }

    pub fn path(&self, sub: &str) -> PathBuf {
        self.dir.path().join(sub)
    }

    pub fn write_input(&self, name: &str, body: &str) {
        std::fs::write(self.path("input").join(name), body).unwrap();
    }

    /// File names in a lifecycle directory, sorted
    pub fn list(&self, sub: &str) -> Vec<String> {
        list_dir(&self.path(sub))
    }

    /// `id,amt` target with not-null, range and type rules
    pub fn amounts_config(&self, workers: usize, batch_size: usize) -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.csv.input_dir = self.path("input");
        config.csv.processing_dir = self.path("processing");
        config.csv.archive_dir = self.path("archive");
        config.csv.error_dir = self.path("error");
        config.csv.batch_size = batch_size;
        config.processing.max_workers = workers;
        config.retry.base_delay_ms = 1;
        config.retry.max_delay_ms = 10;
        config.target.table = "amounts".to_string();
        config.target.columns = vec![
            ColumnSpec::new("id", ColumnType::Integer),
            ColumnSpec::new("amt", ColumnType::Float),
        ];
        config.target.rules = vec![
            RuleSpec::NotNull {
                column: "id".into(),
                name: None,
            },
            RuleSpec::Range {
                column: "amt".into(),
                min: Some(Bound::Number(0.0)),
                max: None,
                name: None,
            },
            RuleSpec::TypeCheck {
                column: "amt".into(),
                expected: Some(ColumnType::Float),
                name: None,
            },
        ];
        config
    }
}

pub fn list_dir(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    names.sort();
    names
}

/// `rows` clean records after an `id,amt` header
pub fn clean_csv(rows: usize) -> String {
    let mut body = String::from("id,amt\n");
    for i in 1..=rows {
        body.push_str(&format!("{i},{}.5\n", i * 10));
    }
    body
}
