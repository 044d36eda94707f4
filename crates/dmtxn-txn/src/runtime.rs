//! Whole-run driver: load, spawn one thread per worker, collect results.

use std::sync::{Arc, Barrier};
use std::time::Instant;

use dmtxn_error::{DmtxnError, Result};
use dmtxn_types::{Clock, ThreadId};
use serde::Serialize;
use tracing::{error, info};

use crate::config::EngineConfig;
use crate::context::RuntimeContext;
use crate::worker::{Worker, WorkerStats};
use crate::workload::Workload;

/// Totals of one [`Runtime::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub commits: u64,
    pub aborts: u64,
    pub read_only_commits: u64,
    /// Batches sent by group leaders.
    pub batches: u64,
    pub elapsed_ms: u64,
    pub commits_per_sec: f64,
}

impl RunSummary {
    fn from_stats(stats: &WorkerStats, elapsed_ms: u64) -> Self {
        let commits_per_sec = if elapsed_ms == 0 {
            0.0
        } else {
            stats.commits as f64 * 1_000.0 / elapsed_ms as f64
        };
        Self {
            commits: stats.commits,
            aborts: stats.aborts,
            read_only_commits: stats.read_only_commits,
            batches: stats.batches_led,
            elapsed_ms,
            commits_per_sec,
        }
    }

    pub fn abort_rate(&self) -> f64 {
        let attempts = self.commits + self.aborts;
        if attempts == 0 {
            0.0
        } else {
            self.aborts as f64 / attempts as f64
        }
    }
}

#[derive(Debug)]
pub struct Runtime {
    ctx: RuntimeContext,
    workload: Arc<dyn Workload>,
}

impl Runtime {
    /// Build the cluster and load the workload's initial data.
    pub fn new(config: EngineConfig, workload: Arc<dyn Workload>) -> Result<Self> {
        Self::from_context(RuntimeContext::new(config)?, workload)
    }

    pub fn with_clock(
        config: EngineConfig,
        clock: Arc<dyn Clock>,
        workload: Arc<dyn Workload>,
    ) -> Result<Self> {
        Self::from_context(RuntimeContext::with_clock(config, clock)?, workload)
    }

    fn from_context(ctx: RuntimeContext, workload: Arc<dyn Workload>) -> Result<Self> {
        workload.populate(ctx.memory())?;
        Ok(Self { ctx, workload })
    }

    pub fn context(&self) -> &RuntimeContext {
        &self.ctx
    }

    pub fn workload(&self) -> &Arc<dyn Workload> {
        &self.workload
    }

    /// Run every worker to its transaction budget.
    ///
    /// The first worker failure requests shutdown so the others stop
    /// spinning, and is returned once every thread has exited. After a
    /// clean run, dirty entry-cache values are written back to their nodes.
    pub fn run(&self) -> Result<RunSummary> {
        let threads = self.ctx.config().num_client_threads;
        let txns = self.ctx.config().txns_per_thread;
        let barrier = Barrier::new(threads as usize);
        let started = Instant::now();

        let results: Vec<Result<WorkerStats>> = std::thread::scope(|s| {
            let mut joins = Vec::with_capacity(threads as usize);
            for raw in 0..threads {
                let barrier_ref = &barrier;
                let ctx = &self.ctx;
                let workload = self.workload.as_ref();
                joins.push(s.spawn(move || {
                    let worker = Worker::new(ctx, workload, ThreadId::new(raw));
                    barrier_ref.wait();
                    let result = worker.and_then(|mut worker| worker.run(txns));
                    if let Err(err) = &result {
                        if !matches!(err, DmtxnError::Shutdown) {
                            error!(target: "dmtxn.txn", thread = raw, error = %err, "worker_failed");
                            ctx.shutdown().request();
                        }
                    }
                    result
                }));
            }
            joins
                .into_iter()
                .map(|join| {
                    join.join().unwrap_or_else(|_| {
                        self.ctx.shutdown().request();
                        Err(DmtxnError::protocol("worker thread panicked"))
                    })
                })
                .collect()
        });

        let mut total = WorkerStats::default();
        let mut first_error = None;
        for result in results {
            match result {
                Ok(stats) => total.merge(&stats),
                Err(DmtxnError::Shutdown) => {}
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }
        if let Some(err) = first_error {
            return Err(err);
        }
        self.ctx.flush_entry_cache()?;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let summary = RunSummary::from_stats(&total, elapsed_ms);
        info!(
            target: "dmtxn.txn",
            commits = summary.commits,
            aborts = summary.aborts,
            batches = summary.batches,
            elapsed_ms,
            "run_finished"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_rates() {
        let stats = WorkerStats {
            commits: 300,
            aborts: 100,
            read_only_commits: 10,
            batches_led: 7,
        };
        let summary = RunSummary::from_stats(&stats, 1_500);
        assert_eq!(summary.batches, 7);
        assert!((summary.commits_per_sec - 200.0).abs() < 1e-9);
        assert!((summary.abort_rate() - 0.25).abs() < 1e-9);
        assert!(RunSummary::default().abort_rate().abs() < f64::EPSILON);
    }

    #[test]
    fn summary_serializes_with_field_names() {
        let json = serde_json::to_value(RunSummary::default()).unwrap();
        assert_eq!(json["commits"], 0);
        assert!(json.get("commits_per_sec").is_some());
    }
}
