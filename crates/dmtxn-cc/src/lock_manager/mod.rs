//! Lock-based concurrency control for non-partitioned deployments.
//!
//! Two-sided: the compute node ships accesses to the owning memory node
//! ([`LockClient`]), which resolves rows through its index, takes the row
//! locks and replies with the tuples ([`LockServer`]). Writes are buffered
//! on the client and installed by 2PC.
//!
//! One-sided: [`OneSidedClient`] resolves, locks, reads and writes rows
//! itself through [`ClusterMemory`](crate::storage::ClusterMemory).
//!
//! Request payload (client -> node), per exchange:
//!
//! ```text
//! ts:u64  count:u32  { type:u8 key:u64 index:u32 table:u32 hint:u64 }*
//! ```
//!
//! Response payload (node -> client):
//!
//! ```text
//! count:u32  { [handle:u64 | stale:bool [handle:u64]] tuple:bytes }*
//! ```
//!
//! Write set (prepare or single-node commit):
//!
//! ```text
//! count:u32  { position-on-node:u32 tuple:bytes }*
//! ```

pub mod client;
pub mod one_sided;
pub mod server;

pub use client::LockClient;
pub use one_sided::OneSidedClient;
pub use server::LockServer;

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use dmtxn_types::{NodeId, TableId, ThreadId, Timestamp, TxnHandle, TxnId};

    use crate::storage::{ClusterMemory, Schema};

    pub const TUPLE: usize = 8;

    pub fn node(raw: u32) -> NodeId {
        NodeId::new(raw).unwrap()
    }

    pub fn txn(thread: u32, ts: u64) -> Arc<TxnHandle> {
        Arc::new(TxnHandle::new(
            TxnId::new(0, ThreadId::new(thread)),
            Timestamp::new(ts),
        ))
    }

    /// Two nodes; keys `0..rows` loaded on node `key % 2` with the key as balance.
    pub fn loaded_cluster(rows: u64) -> Arc<ClusterMemory> {
        let memory = Arc::new(ClusterMemory::new(2, &Arc::new(Schema::single_table(TUPLE)), 64));
        for key in 0..rows {
            let storage = memory.node(node((key % 2) as u32)).unwrap();
            storage
                .load_row(TableId::new(0), key, &key.to_le_bytes())
                .unwrap();
        }
        memory
    }
}
