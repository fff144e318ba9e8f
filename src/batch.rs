//! Bounded-concurrency batch execution.
//!
//! [`BatchRunner`] runs one async operation per item with at most
//! `concurrency` operations in flight, a per-item timeout, optional periodic
//! progress reporting, and failure aggregation. It backs parallel plugin
//! downloads and any plugin-side multi-item install/remove.
//!
//! Item ordering in the returned report is not guaranteed.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{DevstrapError, Result};

/// Lowest accepted concurrency limit.
pub const MIN_CONCURRENCY: usize = 1;
/// Highest accepted concurrency limit.
pub const MAX_CONCURRENCY: usize = 10;

/// Outcome of one item in a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResult {
    /// Zero-based index of the item in the submitted batch.
    pub index: usize,
    /// Item key (plugin name, tool spec, ...).
    pub key: String,
    /// Whether the operation completed successfully.
    pub success: bool,
    /// The error message, if failed.
    pub error: Option<String>,
    /// Time spent running the operation, in milliseconds.
    pub duration_ms: u64,
}

/// Counters handed to the progress callback.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchProgress {
    /// Items that finished, successfully or not.
    pub completed: usize,
    /// Items that finished with an error (subset of `completed`).
    pub failed: usize,
    /// Items in the batch.
    pub total: usize,
}

/// Progress callback type.
pub type ProgressCallback = Arc<dyn Fn(BatchProgress) + Send + Sync>;

/// Anything that can be identified inside a batch.
pub trait BatchItem {
    fn key(&self) -> String;
}

impl BatchItem for String {
    fn key(&self) -> String {
        self.clone()
    }
}

impl BatchItem for &'static str {
    fn key(&self) -> String {
        (*self).to_string()
    }
}

/// All results of a batch run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchReport {
    pub results: Vec<BatchResult>,
    pub total: usize,
}

impl BatchReport {
    pub fn succeeded_count(&self) -> usize {
        self.results.iter().filter(|r| r.success).count()
    }

    pub fn failed_count(&self) -> usize {
        self.results.iter().filter(|r| !r.success).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &BatchResult> {
        self.results.iter().filter(|r| !r.success)
    }

    /// `Some(Batch { failed, total })` iff at least one item failed.
    pub fn aggregate_error(&self) -> Option<DevstrapError> {
        let failed = self.failed_count();
        (failed > 0).then_some(DevstrapError::Batch {
            failed,
            total: self.total,
        })
    }

    /// Results sorted by submission index.
    pub fn sorted(&self) -> Vec<BatchResult> {
        let mut results = self.results.clone();
        results.sort_by_key(|r| r.index);
        results
    }
}

/// Human-readable per-item lines followed by the aggregate line.
pub fn format_report(report: &BatchReport) -> String {
    let mut output = String::new();
    for result in report.sorted() {
        if let Some(ref error) = result.error {
            output.push_str(&format!(
                "  ✗ {} ({} ms): {}\n",
                result.key, result.duration_ms, error
            ));
        } else {
            output.push_str(&format!("  ✓ {} ({} ms)\n", result.key, result.duration_ms));
        }
    }
    match report.aggregate_error() {
        Some(err) => output.push_str(&format!("{}\n", err)),
        None => output.push_str(&format!("all {} items succeeded\n", report.total)),
    }
    output
}

/// Bounded-concurrency executor.
#[derive(Clone)]
pub struct BatchRunner {
    concurrency: usize,
    item_timeout: Duration,
    progress: Option<(Duration, ProgressCallback)>,
}

impl BatchRunner {
    /// Create a runner. `concurrency` is clamped to
    /// [`MIN_CONCURRENCY`]..=[`MAX_CONCURRENCY`].
    pub fn new(concurrency: usize, item_timeout: Duration) -> Self {
        Self {
            concurrency: concurrency.clamp(MIN_CONCURRENCY, MAX_CONCURRENCY),
            item_timeout: item_timeout.max(Duration::from_millis(1)),
            progress: None,
        }
    }

    /// Report progress every `interval` while the batch runs.
    pub fn with_progress(mut self, interval: Duration, callback: ProgressCallback) -> Self {
        self.progress = Some((interval.max(Duration::from_millis(10)), callback));
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn item_timeout(&self) -> Duration {
        self.item_timeout
    }

    /// Run `op` over every item.
    ///
    /// Each operation receives a child of `cancel` that is cancelled when the
    /// item times out or the parent is cancelled. Items that have not started
    /// when `cancel` fires are recorded as cancelled failures. The call
    /// returns once every item has a result.
    pub async fn run<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        items: Vec<T>,
        op: F,
    ) -> BatchReport
    where
        T: BatchItem + Send + 'static,
        F: Fn(T, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let total = items.len();
        if total == 0 {
            return BatchReport::default();
        }

        let keys: Vec<String> = items.iter().map(BatchItem::key).collect();
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let op = Arc::new(op);
        let counters = Arc::new(Mutex::new(BatchProgress {
            completed: 0,
            failed: 0,
            total,
        }));
        let (tx, mut rx) = mpsc::channel::<BatchResult>(total);
        let finished = CancellationToken::new();

        let reporter = self.progress.clone().map(|(interval, callback)| {
            spawn_progress_reporter(
                interval,
                callback,
                Arc::clone(&counters),
                finished.clone(),
                cancel.clone(),
            )
        });

        debug!(
            total,
            concurrency = self.concurrency,
            timeout_ms = self.item_timeout.as_millis() as u64,
            "Starting batch"
        );

        let mut handles = Vec::with_capacity(total);
        for (index, item) in items.into_iter().enumerate() {
            let semaphore = Arc::clone(&semaphore);
            let op = Arc::clone(&op);
            let counters = Arc::clone(&counters);
            let tx = tx.clone();
            let cancel = cancel.clone();
            let key = keys[index].clone();
            let item_timeout = self.item_timeout;

            handles.push(tokio::spawn(async move {
                let (outcome, elapsed) =
                    run_item(semaphore, op, item, cancel, item_timeout).await;

                let result = BatchResult {
                    index,
                    key,
                    success: outcome.is_ok(),
                    error: outcome.err().map(|e| e.to_string()),
                    duration_ms: elapsed.as_millis() as u64,
                };

                {
                    let mut progress = counters.lock().unwrap_or_else(|e| e.into_inner());
                    progress.completed += 1;
                    if !result.success {
                        progress.failed += 1;
                    }
                }

                let _ = tx.send(result).await;
            }));
        }
        drop(tx);

        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Batch worker panicked");
            }
        }
        finished.cancel();
        if let Some(reporter) = reporter {
            let _ = reporter.await;
        }

        let mut results = Vec::with_capacity(total);
        while let Some(result) = rx.recv().await {
            results.push(result);
        }

        // A panicked worker never sent its result.
        if results.len() < total {
            let mut seen = vec![false; total];
            for r in &results {
                seen[r.index] = true;
            }
            for (index, key) in keys.into_iter().enumerate() {
                if !seen[index] {
                    results.push(BatchResult {
                        index,
                        key,
                        success: false,
                        error: Some("worker panicked".to_string()),
                        duration_ms: 0,
                    });
                }
            }
        }

        let report = BatchReport { results, total };
        debug!(
            total,
            failed = report.failed_count(),
            "Batch finished"
        );
        report
    }
}

async fn run_item<T, F, Fut>(
    semaphore: Arc<Semaphore>,
    op: Arc<F>,
    item: T,
    cancel: CancellationToken,
    item_timeout: Duration,
) -> (Result<()>, Duration)
where
    F: Fn(T, CancellationToken) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let _permit = tokio::select! {
        biased;
        _ = cancel.cancelled() => return (Err(DevstrapError::Cancelled), Duration::ZERO),
        permit = semaphore.acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => return (Err(DevstrapError::Cancelled), Duration::ZERO),
        },
    };

    let started = Instant::now();
    let child = cancel.child_token();
    let fut = op(item, child.clone());

    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(DevstrapError::Cancelled),
        res = tokio::time::timeout(item_timeout, fut) => match res {
            Ok(outcome) => outcome,
            Err(_) => Err(DevstrapError::Timeout(format!(
                "item did not finish within {} ms",
                item_timeout.as_millis()
            ))),
        },
    };
    // Release anything the operation spawned against its token.
    child.cancel();

    (outcome, started.elapsed())
}

fn spawn_progress_reporter(
    interval: Duration,
    callback: ProgressCallback,
    counters: Arc<Mutex<BatchProgress>>,
    finished: CancellationToken,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let snapshot = || *counters.lock().unwrap_or_else(|e| e.into_inner());
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = finished.cancelled() => break,
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => callback(snapshot()),
            }
        }

        callback(snapshot());
    })
}
