//! Batch loader with retry and exponential backoff

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::sink::{Sink, SinkError};
use crate::error::EtlError;
use crate::types::LoadBatch;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(500);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// How often and how patiently a batch is resubmitted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total submissions, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Wait after the failed attempt numbered `attempt` (0-based): base × 2^attempt, capped
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// A batch that could not be committed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadFailure {
    pub attempts: u32,
    pub error: SinkError,
    /// Transient failures until the attempt limit ran out
    pub exhausted: bool,
}

impl LoadFailure {
    /// Always non-transient: the loader has given up on the batch
    pub fn into_error(self, batch: usize) -> EtlError {
        if self.exhausted {
            let message = format!("retries exhausted after {} attempts: {}", self.attempts, self.error);
            EtlError::NonTransientSink { batch, message }
        } else {
            self.error.into_error(batch)
        }
    }
}

/// Submits batches to a shared sink
#[derive(Clone)]
pub struct BatchLoader {
    sink: Arc<dyn Sink>,
    retry: RetryPolicy,
}

impl BatchLoader {
    pub fn new(sink: Arc<dyn Sink>, retry: RetryPolicy) -> Self {
        Self { sink, retry }
    }

    /// Commit a batch, retrying transient failures
    ///
    /// Returns the number of attempts used. The caller counts the batch as loaded exactly
    /// once, on `Ok`.
    pub async fn load(&self, batch: &LoadBatch) -> Result<u32, LoadFailure> {
        if batch.is_empty() {
            return Ok(0);
        }

        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.sink.submit(batch).await {
                Ok(()) => {
                    debug!(
                        source = batch.source(),
                        batch = batch.index(),
                        records = batch.len(),
                        attempt,
                        "Batch committed"
                    );
                    return Ok(attempt);
                },
                Err(error) if !error.is_transient() => {
                    warn!(
                        source = batch.source(),
                        batch = batch.index(),
                        attempt,
                        error = %error,
                        "Batch rejected by sink"
                    );
                    return Err(LoadFailure {
                        attempts: attempt,
                        error,
                        exhausted: false,
                    });
                },
                Err(error) if attempt >= max_attempts => {
                    warn!(
                        source = batch.source(),
                        batch = batch.index(),
                        attempts = attempt,
                        error = %error,
                        "Batch retries exhausted"
                    );
                    return Err(LoadFailure {
                        attempts: attempt,
                        error,
                        exhausted: true,
                    });
                },
                Err(error) => {
                    let delay = self.retry.backoff(attempt - 1);
                    let error = error.into_error(batch.index());
                    warn!(
                        source = batch.source(),
                        batch = batch.index(),
                        category = error.category(),
                        "Load attempt {}/{} failed: {}; retrying in {:?}",
                        attempt,
                        max_attempts,
                        error,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                },
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::load::sink::SinkErrorKind;
    use crate::types::{TransformedRecord, Value};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Replays scripted responses, then succeeds
    struct ScriptedSink {
        responses: Mutex<VecDeque<Result<(), SinkError>>>,
        calls: AtomicU32,
    }

    impl ScriptedSink {
        fn new(responses: Vec<Result<(), SinkError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl Sink for ScriptedSink {
        async fn submit(&self, _batch: &LoadBatch) -> Result<(), SinkError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.responses.lock().unwrap().pop_front().unwrap_or(Ok(()))
        }
    }

    fn batch() -> LoadBatch {
        LoadBatch::new(
            "a.csv",
            0,
            vec![TransformedRecord::new(2, vec![Value::Integer(1)])],
        )
    }

    fn transient() -> Result<(), SinkError> {
        Err(SinkError::new(SinkErrorKind::Timeout, "statement timeout"))
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(800));
        assert_eq!(policy.backoff(4), Duration::from_millis(1000));
        assert_eq!(policy.backoff(40), Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_twice_then_success_counts_once() {
        let sink = ScriptedSink::new(vec![transient(), transient()]);
        let loader = BatchLoader::new(sink.clone(), RetryPolicy::default());

        let start = tokio::time::Instant::now();
        let attempts = loader.load(&batch()).await.unwrap();

        assert_eq!(attempts, 3);
        assert_eq!(sink.calls.load(Ordering::SeqCst), 3);
        // 500ms + 1000ms of backoff
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(1500), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_millis(1600), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_transient_fails_without_retry() {
        let sink = ScriptedSink::new(vec![Err(SinkError::new(
            SinkErrorKind::Constraint,
            "duplicate key value",
        ))]);
        let loader = BatchLoader::new(sink.clone(), RetryPolicy::default());

        let failure = loader.load(&batch()).await.unwrap_err();
        assert_eq!(failure.attempts, 1);
        assert!(!failure.exhausted);
        assert_eq!(sink.calls.load(Ordering::SeqCst), 1);

        let err = failure.into_error(4);
        assert!(matches!(err, EtlError::NonTransientSink { batch: 4, .. }));
        assert_eq!(err.category(), "load-failed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_become_non_transient() {
        let sink = ScriptedSink::new(vec![transient(), transient(), transient(), Ok(())]);
        let loader = BatchLoader::new(sink.clone(), RetryPolicy::default());

        let failure = loader.load(&batch()).await.unwrap_err();
        assert_eq!(failure.attempts, 3);
        assert!(failure.exhausted);
        assert_eq!(sink.calls.load(Ordering::SeqCst), 3);
        assert!(failure.into_error(0).to_string().contains("retries exhausted"));
    }

    #[tokio::test]
    async fn test_empty_batch_is_not_submitted() {
        let sink = ScriptedSink::new(Vec::new());
        let loader = BatchLoader::new(sink.clone(), RetryPolicy::default());
        let attempts = loader.load(&LoadBatch::new("a.csv", 0, Vec::new())).await.unwrap();
        assert_eq!(attempts, 0);
        assert_eq!(sink.calls.load(Ordering::SeqCst), 0);
    }
}
