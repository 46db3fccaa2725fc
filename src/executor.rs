//! Fixed-size worker pool for chunk jobs.
//!
//! ```text
//! feeder ──bounded queue──► worker 0 ─┐
//!                       └─► worker 1 ─┼──result channel──► collector (caller)
//!                       └─► worker N ─┘
//! ```
//!
//! The feeder walks the [`ChunkPlan`] and blocks when the queue is full, so
//! only a handful of windows are ever in flight. Each worker builds its own
//! context once (its own composite handles) and shares nothing mutable with
//! its siblings. Results are reduced on the calling thread in arrival order;
//! that thread alone owns the progress counter.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use tracing::{debug, error, info, warn};

use crate::encode::EncodedChunk;
use crate::error::{Error, Result};
use crate::plan::{ChunkPlan, ChunkWindow};

/// Windows queued per worker before the feeder blocks.
const QUEUE_DEPTH_PER_WORKER: usize = 2;

/// What a worker did with one window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Encoded(EncodedChunk),
    SkippedEmpty,
}

/// Per-worker job runner.
pub trait ChunkWorker {
    /// Process one window end to end.
    ///
    /// # Errors
    /// Any error is recorded as a failure of this window only.
    fn process(&mut self, window: ChunkWindow) -> Result<JobOutcome>;
}

/// A job that did not complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFailure {
    pub window: ChunkWindow,
    pub reason: String,
}

/// Progress notification, sent once per completed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub processed: usize,
    pub total: usize,
    pub window: ChunkWindow,
}

/// Aggregated results of [`Executor::run`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionReport {
    pub total: usize,
    pub processed: usize,
    /// In completion order
    pub encoded: Vec<EncodedChunk>,
    pub skipped_empty: usize,
    pub failures: Vec<JobFailure>,
}

impl ExecutionReport {
    #[must_use]
    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }
}

struct JobResult {
    window: ChunkWindow,
    outcome: std::result::Result<JobOutcome, String>,
}

/// Worker pool configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Executor {
    workers: usize,
}

impl Executor {
    /// Pool with `workers` threads (at least one).
    #[must_use]
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    #[must_use]
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run every window of `plan` through workers built by `make_worker`.
    ///
    /// `make_worker` is called once per worker thread with the worker index.
    /// A worker whose context fails to build reports each window it pulls as
    /// failed. Panics inside a job are caught and recorded as that job's
    /// failure. All threads are joined before this returns.
    ///
    /// # Errors
    /// Returns [`Error::Io`] only if a thread cannot be spawned.
    pub fn run<W, F, P>(&self, plan: ChunkPlan, make_worker: F, mut on_progress: P) -> Result<ExecutionReport>
    where
        W: ChunkWorker,
        F: Fn(usize) -> Result<W> + Sync,
        P: FnMut(&Progress),
    {
        let total = plan.len();
        let mut report = ExecutionReport {
            total,
            ..ExecutionReport::default()
        };
        if total == 0 {
            return Ok(report);
        }

        let (task_tx, task_rx) = bounded::<ChunkWindow>(self.workers * QUEUE_DEPTH_PER_WORKER);
        let (result_tx, result_rx) = unbounded::<JobResult>();
        let make_worker = &make_worker;

        thread::scope(|scope| -> Result<()> {
            thread::Builder::new()
                .name("chunk-feeder".to_string())
                .spawn_scoped(scope, move || {
                    for window in plan {
                        if task_tx.send(window).is_err() {
                            break;
                        }
                    }
                    // Dropping task_tx lets workers drain and exit
                })?;

            for worker_idx in 0..self.workers {
                let rx = task_rx.clone();
                let tx = result_tx.clone();
                thread::Builder::new()
                    .name(format!("chunk-worker-{worker_idx}"))
                    .spawn_scoped(scope, move || worker_loop(worker_idx, make_worker, &rx, &tx))?;
            }
            // Channel disconnection is driven by the threads' exits
            drop(task_rx);
            drop(result_tx);

            for result in &result_rx {
                report.processed += 1;
                match result.outcome {
                    Ok(JobOutcome::Encoded(chunk)) => report.encoded.push(chunk),
                    Ok(JobOutcome::SkippedEmpty) => report.skipped_empty += 1,
                    Err(reason) => {
                        error!(window = %result.window, %reason, "Chunk job failed");
                        report.failures.push(JobFailure {
                            window: result.window,
                            reason,
                        });
                    }
                }
                info!("Processed chunk {}/{}", report.processed, total);
                on_progress(&Progress {
                    processed: report.processed,
                    total,
                    window: result.window,
                });
            }
            Ok(())
        })?;

        if report.processed != total {
            warn!(processed = report.processed, total, "Not every window was processed");
        }
        Ok(report)
    }
}

fn worker_loop<W, F>(worker_idx: usize, make_worker: &F, rx: &Receiver<ChunkWindow>, tx: &Sender<JobResult>)
where
    W: ChunkWorker,
    F: Fn(usize) -> Result<W> + Sync,
{
    let built = catch_unwind(AssertUnwindSafe(|| make_worker(worker_idx)))
        .unwrap_or_else(|panic| Err(Error::Config(format!("worker setup panicked: {}", panic_message(&*panic)))));

    let mut worker = match built {
        Ok(worker) => worker,
        Err(e) => {
            error!(worker = worker_idx, error = %e, "Worker context unavailable");
            let reason = format!("worker context unavailable: {e}");
            for window in rx {
                if tx
                    .send(JobResult {
                        window,
                        outcome: Err(reason.clone()),
                    })
                    .is_err()
                {
                    break;
                }
            }
            return;
        }
    };

    debug!(worker = worker_idx, "Worker started");
    for window in rx {
        let outcome = match catch_unwind(AssertUnwindSafe(|| worker.process(window))) {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(e)) => Err(e.to_string()),
            Err(panic) => Err(format!("job panicked: {}", panic_message(&*panic))),
        };
        if tx.send(JobResult { window, outcome }).is_err() {
            break;
        }
    }
    debug!(worker = worker_idx, "Worker finished");
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::plan;
    use std::collections::HashSet;
    use std::path::PathBuf;

    /// Encodes windows on the diagonal, skips the rest.
    struct Diagonal;

    impl ChunkWorker for Diagonal {
        fn process(&mut self, window: ChunkWindow) -> Result<JobOutcome> {
            if window.x_offset == window.y_offset {
                Ok(JobOutcome::Encoded(EncodedChunk {
                    window,
                    path: PathBuf::from(window.file_name()),
                    overview_count: 0,
                    bytes: 1,
                }))
            } else {
                Ok(JobOutcome::SkippedEmpty)
            }
        }
    }

    struct Flaky;

    impl ChunkWorker for Flaky {
        fn process(&mut self, window: ChunkWindow) -> Result<JobOutcome> {
            match (window.x_offset, window.y_offset) {
                (0, 10) => Err(Error::ChunkEncode {
                    window,
                    reason: "disk full".to_string(),
                }),
                (10, 0) => panic!("boom"),
                _ => Ok(JobOutcome::SkippedEmpty),
            }
        }
    }

    #[test]
    fn test_every_window_processed_once() {
        for workers in [1, 2, 4] {
            let mut seen = HashSet::new();
            let report = Executor::new(workers)
                .run(plan(40, 40, 10), |_| Ok(Diagonal), |p| {
                    assert!(seen.insert(p.window));
                })
                .unwrap();
            assert_eq!(report.total, 16);
            assert_eq!(report.processed, 16);
            assert_eq!(report.encoded.len(), 4);
            assert_eq!(report.skipped_empty, 12);
            assert_eq!(seen.len(), 16);
        }
    }

    #[test]
    fn test_progress_counts_up_to_total() {
        let mut last = 0;
        Executor::new(3)
            .run(plan(30, 20, 10), |_| Ok(Diagonal), |p| {
                assert_eq!(p.processed, last + 1);
                assert_eq!(p.total, 6);
                last = p.processed;
            })
            .unwrap();
        assert_eq!(last, 6);
    }

    #[test]
    fn test_failures_and_panics_are_isolated() {
        let report = Executor::new(2).run(plan(20, 20, 10), |_| Ok(Flaky), |_| {}).unwrap();
        assert_eq!(report.processed, 4);
        assert_eq!(report.skipped_empty, 2);
        assert_eq!(report.failures.len(), 2);
        assert!(report.has_failures());
        let panicked = report
            .failures
            .iter()
            .find(|f| f.window == ChunkWindow::new(10, 0, 10, 10))
            .unwrap();
        assert!(panicked.reason.contains("boom"));
    }

    #[test]
    fn test_broken_worker_context_fails_its_jobs() {
        let report = Executor::new(2)
            .run(
                plan(50, 50, 10),
                |idx| {
                    if idx == 0 {
                        Err(Error::Config("no handle".to_string()))
                    } else {
                        Ok(Diagonal)
                    }
                },
                |_| {},
            )
            .unwrap();
        assert_eq!(report.processed, 25);
        assert_eq!(
            report.encoded.len() + report.skipped_empty + report.failures.len(),
            25
        );
        assert!(report.failures.iter().all(|f| f.reason.contains("no handle")));
    }

    #[test]
    fn test_empty_plan() {
        let report = Executor::new(2).run(plan(0, 0, 10), |_| Ok(Diagonal), |_| {}).unwrap();
        assert_eq!(report, ExecutionReport::default());
    }

    #[test]
    fn test_zero_workers_means_one() {
        assert_eq!(Executor::new(0).workers(), 1);
    }
}
