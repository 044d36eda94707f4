//! Per-thread transaction loop with abort backoff.

use dmtxn_error::{DmtxnError, Result};
use dmtxn_types::{ThreadId, Timestamp, pause_cycles};
use serde::Serialize;
use tracing::{debug, warn};

use crate::context::{RuntimeContext, WorkerContext};
use crate::txn::ClientTxn;
use crate::workload::{Query, Workload};

/// Consecutive aborts of one transaction after which a warning is logged.
const ABORT_STREAK_WARN: u64 = 64;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub commits: u64,
    pub aborts: u64,
    pub read_only_commits: u64,
    pub batches_led: u64,
}

impl WorkerStats {
    pub fn merge(&mut self, other: &Self) {
        self.commits += other.commits;
        self.aborts += other.aborts;
        self.read_only_commits += other.read_only_commits;
        self.batches_led += other.batches_led;
    }
}

#[derive(Debug)]
pub struct Worker<'a> {
    ctx: &'a RuntimeContext,
    workload: &'a dyn Workload,
    state: WorkerContext,
    stats: WorkerStats,
}

impl<'a> Worker<'a> {
    pub fn new(ctx: &'a RuntimeContext, workload: &'a dyn Workload, thread: ThreadId) -> Result<Self> {
        Ok(Self {
            ctx,
            workload,
            state: ctx.worker(thread)?,
            stats: WorkerStats::default(),
        })
    }

    pub fn thread(&self) -> ThreadId {
        self.state.thread
    }

    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            batches_led: self.state.batches_led,
            ..self.stats
        }
    }

    /// Commit `txns` transactions, or stop early on shutdown.
    pub fn run(&mut self, txns: u64) -> Result<WorkerStats> {
        self.state.batch.join();
        let result = self.run_joined(txns);
        self.state.batch.resign_leader();
        self.state.batch.leave();
        result.map(|()| self.stats())
    }

    fn run_joined(&mut self, txns: u64) -> Result<()> {
        for _ in 0..txns {
            if self.ctx.shutdown().is_requested() {
                break;
            }
            let query = self.workload.next_query(&mut self.state.rng);
            self.run_txn(&query)?;
        }
        Ok(())
    }

    /// Run `query` until it commits. Every retry keeps the first attempt's
    /// timestamp so the transaction ages into priority.
    pub fn run_txn(&mut self, query: &Query) -> Result<()> {
        let ts = self.ctx.next_timestamp();
        let mut streak = 0u64;
        loop {
            if self.attempt(query, ts)? {
                self.stats.commits += 1;
                if query.is_read_only() {
                    self.stats.read_only_commits += 1;
                }
                self.state.batch.check_leader_expiration_status();
                return Ok(());
            }

            streak += 1;
            self.stats.aborts += 1;
            if streak % ABORT_STREAK_WARN == 0 {
                warn!(
                    target: "dmtxn.txn",
                    thread = self.state.thread.get(),
                    ts = ts.get(),
                    streak,
                    "txn_abort_streak"
                );
            }

            let batch = &mut self.state.batch;
            batch.leave();
            batch.report_conflict();
            batch.resign_leader();
            pause_cycles(
                self.ctx.clock().as_ref(),
                streak.saturating_mul(self.ctx.config().abort_backoff_cycles),
                self.ctx.shutdown(),
            );
            batch.join();
            if self.ctx.shutdown().is_requested() {
                return Err(DmtxnError::Shutdown);
            }
        }
    }

    /// One attempt; `Ok(false)` when it aborted and was rolled back.
    fn attempt(&mut self, query: &Query, ts: Timestamp) -> Result<bool> {
        let mut txn = ClientTxn::begin(self.ctx, &mut self.state, ts);
        match execute(&mut txn, query) {
            Ok(()) => Ok(true),
            Err(err) if err.is_abort() => {
                debug!(
                    target: "dmtxn.txn",
                    txn = %txn.id(),
                    ts = ts.get(),
                    reason = ?err.abort_reason(),
                    "txn_aborted"
                );
                txn.process_abort_nodes()?;
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }
}

fn execute(txn: &mut ClientTxn<'_>, query: &Query) -> Result<()> {
    for req in &query.requests {
        txn.register_access(*req)?;
    }
    txn.process_request()?;
    query.apply(txn)?;
    txn.process_commit()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use dmtxn_batch::BatchingConfig;
    use dmtxn_cc::{AccessRequest, LockProtocol};
    use dmtxn_types::{AccessType, ManualClock};
    use smallvec::smallvec;

    use super::*;
    use crate::config::{EngineConfig, KvConfig};
    use crate::workload::{KV_INDEX, KV_TABLE, KvWorkload};

    fn setup(config: EngineConfig) -> (RuntimeContext, KvWorkload) {
        let ctx = RuntimeContext::with_clock(config.clone(), Arc::new(ManualClock::auto_advancing(0, 10)))
            .unwrap();
        let workload = KvWorkload::new(
            config.workload,
            config.num_server_nodes,
            config.tuple_size,
            config.partitioned,
        )
        .unwrap();
        workload.populate(ctx.memory()).unwrap();
        (ctx, workload)
    }

    fn small() -> EngineConfig {
        EngineConfig {
            workload: KvConfig {
                num_keys: 32,
                ..KvConfig::default()
            },
            ..EngineConfig::default()
        }
        .with_threads(2)
        .with_batching(BatchingConfig::default().with_enabled(false))
    }

    #[test]
    fn single_worker_commits_every_txn_and_conserves_balance() {
        let (ctx, workload) = setup(small());
        let before = workload.total_balance(ctx.memory()).unwrap();
        let mut worker = Worker::new(&ctx, &workload, ThreadId::new(0)).unwrap();
        let stats = worker.run(50).unwrap();
        assert_eq!(stats.commits, 50);
        assert_eq!(stats.aborts, 0, "no contention with one worker");
        assert_eq!(workload.total_balance(ctx.memory()).unwrap(), before);
    }

    #[test]
    fn conflicting_txn_retries_with_its_first_timestamp() {
        let (ctx, workload) = setup(small().with_protocol(LockProtocol::NoWait));
        let node = workload.partition(3, KV_TABLE);
        let mut holder_state = ctx.worker(ThreadId::new(1)).unwrap();
        let mut holder = ClientTxn::begin(&ctx, &mut holder_state, ctx.next_timestamp());
        holder
            .register_access(AccessRequest::new(node, AccessType::Write, 3, KV_TABLE, KV_INDEX))
            .unwrap();
        holder.process_request().unwrap();

        let mut worker = Worker::new(&ctx, &workload, ThreadId::new(0)).unwrap();
        let query = Query {
            requests: smallvec![AccessRequest::new(node, AccessType::Read, 3, KV_TABLE, KV_INDEX)],
            transfer: None,
        };
        let ts = ctx.next_timestamp();
        assert!(!worker.attempt(&query, ts).unwrap());

        holder.process_commit().unwrap();
        drop(holder);
        assert!(worker.attempt(&query, ts).unwrap());
    }

    #[test]
    fn shutdown_stops_the_loop() {
        let (ctx, workload) = setup(small());
        ctx.shutdown().request();
        let mut worker = Worker::new(&ctx, &workload, ThreadId::new(0)).unwrap();
        assert_eq!(worker.run(10).unwrap(), WorkerStats::default());
    }

    #[test]
    fn stats_merge_adds_fields() {
        let mut total = WorkerStats {
            commits: 1,
            aborts: 2,
            read_only_commits: 0,
            batches_led: 3,
        };
        total.merge(&total.clone());
        assert_eq!(total.commits, 2);
        assert_eq!(total.aborts, 4);
        assert_eq!(total.batches_led, 6);
    }
}
