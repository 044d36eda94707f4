//! Process-wide and per-thread execution state.
//!
//! [`RuntimeContext`] is built once from an [`EngineConfig`] and shared by
//! every worker: cluster memory, storage servers, transport, batch table,
//! mailboxes, caches and the timestamp counter. [`WorkerContext`] is owned
//! by one worker thread.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dmtxn_batch::{BatchManager, BatchTable};
use dmtxn_cc::{
    ClusterMemory, EntryCache, LockWordAccess, OneSidedMedium, RowCache, RowLockStrategy, Schema,
    TxnRegistry, one_sided_strategy, two_sided_strategy,
};
use dmtxn_error::{DmtxnError, Result};
use dmtxn_types::{Clock, MonotonicClock, NodeId, ShutdownFlag, ThreadId, Timestamp, Value};
use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing::{debug, info};

use crate::config::{EngineConfig, TransportKind};
use crate::mailbox::Mailboxes;
use crate::server::StorageServer;
use crate::transport::{LoopbackTransport, Transport};

const SEED_MIX: u64 = 0x9E37_79B9_7F4A_7C15;

#[derive(Debug)]
pub struct RuntimeContext {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    shutdown: ShutdownFlag,
    memory: Arc<ClusterMemory>,
    servers: Vec<Arc<StorageServer>>,
    transport: Arc<dyn Transport>,
    batch_table: Arc<BatchTable>,
    mailboxes: Mailboxes,
    registry: Arc<TxnRegistry>,
    one_sided: Arc<dyn RowLockStrategy>,
    row_cache: Option<Arc<RowCache>>,
    entry_cache: Option<Arc<EntryCache>>,
    next_ts: AtomicU64,
}

impl RuntimeContext {
    /// Build a context on the wall clock.
    pub fn new(config: EngineConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(MonotonicClock::new()))
    }

    pub fn with_clock(config: EngineConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let nodes = config.num_server_nodes;
        let threads = config.num_client_threads;
        let shutdown = ShutdownFlag::new();

        let schema = Arc::new(Schema::single_table(config.tuple_size));
        let memory = Arc::new(ClusterMemory::new(nodes, &schema, config.rows_per_node));
        let two_sided = two_sided_strategy(config.protocol);
        let servers: Vec<Arc<StorageServer>> = memory
            .nodes()
            .iter()
            .map(|storage| {
                Arc::new(StorageServer::new(
                    Arc::clone(storage),
                    Arc::clone(&two_sided),
                    config.partitioned,
                    Arc::clone(&clock),
                    config.lock_wait_timeout_cycles,
                ))
            })
            .collect();

        let batch_table = Arc::new(BatchTable::new(
            threads,
            config.batching.group_size,
            config.batching.max_groups,
            nodes,
        ));
        let transport: Arc<dyn Transport> = Arc::new(LoopbackTransport::new(
            servers.clone(),
            threads,
            batch_table.num_groups(),
        ));

        let registry = Arc::new(TxnRegistry::new());
        let one_sided = one_sided_strategy(
            config.protocol,
            OneSidedMedium {
                words: Arc::clone(&memory) as Arc<dyn LockWordAccess>,
                registry: Arc::clone(&registry),
                clock: Arc::clone(&clock),
                shutdown: shutdown.clone(),
                wait_timeout: config.lock_wait_timeout_cycles,
            },
        );

        let caching = config.cache.is_enabled() && config.transport == TransportKind::TwoSided;
        let row_cache =
            (caching && !config.partitioned).then(|| Arc::new(RowCache::new(config.cache)));
        let entry_cache =
            (caching && config.partitioned).then(|| Arc::new(EntryCache::new(config.cache)));

        info!(
            target: "dmtxn.txn",
            nodes,
            threads,
            groups = batch_table.num_groups(),
            transport = ?config.transport,
            protocol = %config.protocol,
            partitioned = config.partitioned,
            batching = config.batching.enabled,
            "runtime_context_built"
        );

        Ok(Self {
            mailboxes: Mailboxes::new(threads, nodes),
            config,
            clock,
            shutdown,
            memory,
            servers,
            transport,
            batch_table,
            registry,
            one_sided,
            row_cache,
            entry_cache,
            next_ts: AtomicU64::new(0),
        })
    }

    #[inline]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[inline]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    #[inline]
    pub fn shutdown(&self) -> &ShutdownFlag {
        &self.shutdown
    }

    pub fn memory(&self) -> &Arc<ClusterMemory> {
        &self.memory
    }

    pub fn servers(&self) -> &[Arc<StorageServer>] {
        &self.servers
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn batch_table(&self) -> &Arc<BatchTable> {
        &self.batch_table
    }

    pub fn mailboxes(&self) -> &Mailboxes {
        &self.mailboxes
    }

    pub fn registry(&self) -> &Arc<TxnRegistry> {
        &self.registry
    }

    pub fn one_sided_strategy(&self) -> &Arc<dyn RowLockStrategy> {
        &self.one_sided
    }

    pub fn row_cache(&self) -> Option<&Arc<RowCache>> {
        self.row_cache.as_ref()
    }

    pub fn entry_cache(&self) -> Option<&Arc<EntryCache>> {
        self.entry_cache.as_ref()
    }

    /// Write every dirty entry-cache value back to its owning node.
    ///
    /// Only sound while no transaction is running. Returns the number of
    /// entries applied; keys deleted meanwhile are skipped.
    pub fn flush_entry_cache(&self) -> Result<usize> {
        let Some(cache) = &self.entry_cache else {
            return Ok(0);
        };
        let mut applied = 0;
        for (node, index, key, value) in cache.drain_dirty() {
            if self.memory.node(node)?.index(index)?.update(key, Value::Raw(value)) {
                applied += 1;
            } else {
                debug!(target: "dmtxn.txn", node = node.get(), key, "flush_skipped_deleted_key");
            }
        }
        info!(target: "dmtxn.txn", applied, "entry_cache_flushed");
        Ok(applied)
    }

    #[inline]
    pub fn num_nodes(&self) -> u32 {
        self.config.num_server_nodes
    }

    /// Fresh transaction priority; earlier draws are older.
    pub fn next_timestamp(&self) -> Timestamp {
        Timestamp::new(self.next_ts.fetch_add(1, Ordering::Relaxed) + 1)
    }

    pub fn node(&self, raw: u32) -> Result<NodeId> {
        NodeId::new(raw)
            .filter(|node| node.get() < self.num_nodes())
            .ok_or(DmtxnError::UnknownNode {
                node: raw,
                num_nodes: self.num_nodes(),
            })
    }

    /// Per-thread state for worker `thread`.
    pub fn worker(&self, thread: ThreadId) -> Result<WorkerContext> {
        if thread.get() >= self.config.num_client_threads {
            return Err(DmtxnError::protocol(format!(
                "thread {thread} outside the {} configured workers",
                self.config.num_client_threads
            )));
        }
        let seed = self.config.seed ^ u64::from(thread.get() + 1).wrapping_mul(SEED_MIX);
        Ok(WorkerContext {
            thread,
            rng: StdRng::seed_from_u64(seed),
            batch: BatchManager::new(
                thread,
                Arc::clone(&self.batch_table),
                &self.config.batching,
                Arc::clone(&self.clock),
                self.shutdown.clone(),
                seed.rotate_left(17),
            ),
            batches_led: 0,
        })
    }
}

/// State owned by one worker thread.
#[derive(Debug)]
pub struct WorkerContext {
    pub thread: ThreadId,
    pub rng: StdRng,
    pub batch: BatchManager,
    /// Batches this thread sent as group leader.
    pub batches_led: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_increase_from_one() {
        let ctx = RuntimeContext::new(EngineConfig::default()).unwrap();
        assert_eq!(ctx.next_timestamp(), Timestamp::new(1));
        assert_eq!(ctx.next_timestamp(), Timestamp::new(2));
    }

    #[test]
    fn caches_follow_mode() {
        let cache = dmtxn_cc::CacheConfig::default();
        let ctx = RuntimeContext::new(EngineConfig::default().with_cache(cache)).unwrap();
        assert!(ctx.row_cache().is_some() && ctx.entry_cache().is_none());

        let ctx = RuntimeContext::new(
            EngineConfig::default()
                .with_cache(cache)
                .with_partitioned(true),
        )
        .unwrap();
        assert!(ctx.row_cache().is_none() && ctx.entry_cache().is_some());

        let ctx = RuntimeContext::new(
            EngineConfig::default()
                .with_cache(cache)
                .with_transport(TransportKind::OneSided),
        )
        .unwrap();
        assert!(ctx.row_cache().is_none() && ctx.entry_cache().is_none());
    }

    #[test]
    fn workers_are_bounded_by_config() {
        let ctx = RuntimeContext::new(EngineConfig::default().with_threads(2)).unwrap();
        assert!(ctx.worker(ThreadId::new(1)).is_ok());
        assert!(ctx.worker(ThreadId::new(2)).is_err());
        assert!(ctx.node(1).is_ok());
        assert!(ctx.node(2).is_err());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let err = RuntimeContext::new(EngineConfig::default().with_threads(0)).unwrap_err();
        assert!(matches!(err, DmtxnError::InvalidConfig { .. }));
    }
}
