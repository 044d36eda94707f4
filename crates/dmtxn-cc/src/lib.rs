//! Concurrency control for disaggregated-memory transactions.
//!
//! Memory nodes keep rows ([`storage`]) behind ordered indexes ([`index`]).
//! Compute threads reach them either by shipping requests to the owning
//! node (two-sided) or by operating on node memory directly (one-sided).
//!
//! - [`row_lock`]: NO-WAIT, WAIT-DIE and WOUND-WAIT row locks in a
//!   mutex-guarded (two-sided) and a lock-word CAS (one-sided) flavor,
//!   selected at runtime behind [`RowLockStrategy`].
//! - [`lock_manager`]: lock-based concurrency control with 2PC write sets.
//! - [`idx_manager`]: index-only concurrency control for partitioned data.
//! - [`cache`]: compute-side row-handle and index-entry caches.
//! - [`contract`]: the client/server traits the orchestration layer drives.

pub mod cache;
pub mod contract;
pub mod idx_manager;
pub mod index;
pub mod lock_manager;
pub mod metrics;
pub mod row_lock;
pub mod storage;

pub use cache::{CacheConfig, CacheHint, CacheLookup, CacheOp, EntryCache, RowCache};
pub use contract::{AccessRequest, ClientConcurrency, NodeList, ServerConcurrency};
pub use idx_manager::{IndexClient, IndexServer};
pub use index::{DeleteOp, Index, IndexCatalog, InsertOp, OrderedIndex, commit_insdel};
pub use lock_manager::{LockClient, LockServer, OneSidedClient};
pub use metrics::{LockMetrics, lock_metrics, reset_lock_metrics};
pub use row_lock::{
    LockEntry, LockGrant, LockProtocol, LockTarget, LockWord, LockWordAccess, LockWordPair,
    OneSidedMedium, RowLockStrategy, TxnRegistry, one_sided_strategy, two_sided_strategy,
};
pub use storage::{ClusterMemory, NodeStorage, RowStore, Schema};
