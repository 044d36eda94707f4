//! One-sided lock manager: the compute thread does everything itself.
//!
//! Rows are located through the owning node's index, locked by CAS on the
//! row's lock word and read and written in place. Keys missing from the
//! index get a freshly allocated row that is indexed on commit.

use std::sync::Arc;

use dmtxn_error::{DmtxnError, Result};
use dmtxn_types::{AccessType, Outcome, RemoteAddr, TxnHandle};
use tracing::debug;

use crate::contract::{AccessRequest, duplicate_access};
use crate::row_lock::lock_word::ROW_HEADER_BYTES;
use crate::row_lock::{LockTarget, RowLockStrategy};
use crate::storage::ClusterMemory;

#[derive(Debug)]
struct RemoteAccess {
    req: AccessRequest,
    addr: Option<RemoteAddr>,
    /// Allocated by this transaction; indexed on commit, freed on abort.
    fresh: bool,
    locked: bool,
    data: Vec<u8>,
}

#[derive(Debug)]
pub struct OneSidedClient {
    txn: Arc<TxnHandle>,
    memory: Arc<ClusterMemory>,
    strategy: Arc<dyn RowLockStrategy>,
    accesses: Vec<RemoteAccess>,
}

impl OneSidedClient {
    pub fn new(
        txn: Arc<TxnHandle>,
        memory: Arc<ClusterMemory>,
        strategy: Arc<dyn RowLockStrategy>,
    ) -> Self {
        Self {
            txn,
            memory,
            strategy,
            accesses: Vec::new(),
        }
    }

    pub fn txn(&self) -> &Arc<TxnHandle> {
        &self.txn
    }

    pub fn register_access(&mut self, req: AccessRequest) -> Result<usize> {
        if self
            .accesses
            .iter()
            .any(|a| a.req.key == req.key && a.req.table == req.table)
        {
            return Err(duplicate_access(req.key, req.table));
        }
        self.accesses.push(RemoteAccess {
            req,
            addr: None,
            fresh: false,
            locked: false,
            data: Vec::new(),
        });
        Ok(self.accesses.len() - 1)
    }

    pub fn access_count(&self) -> usize {
        self.accesses.len()
    }

    pub fn data(&self, idx: usize) -> Option<&[u8]> {
        self.accesses
            .get(idx)
            .filter(|a| a.locked)
            .map(|a| a.data.as_slice())
    }

    pub fn data_mut(&mut self, idx: usize) -> Option<&mut Vec<u8>> {
        self.accesses
            .get_mut(idx)
            .filter(|a| a.locked && a.req.ty.writes_data())
            .map(|a| &mut a.data)
    }

    /// Locate, lock and read the row of access `idx`.
    ///
    /// One-sided strategies never queue: the call returns with the lock
    /// held or with an abort.
    pub fn get_remote_row(&mut self, idx: usize) -> Result<&[u8]> {
        let req = self
            .accesses
            .get(idx)
            .map(|a| a.req)
            .ok_or_else(|| DmtxnError::protocol(format!("no access {idx}")))?;
        let addr = match self.accesses[idx].addr {
            Some(addr) => addr,
            None => {
                let (addr, fresh) = match self.memory.index_lookup(req.node, req.index, req.key)? {
                    Some(addr) => (addr, false),
                    None => (self.memory.alloc_row(req.node, req.table, req.key)?, true),
                };
                let access = &mut self.accesses[idx];
                access.addr = Some(addr);
                access.fresh = fresh;
                addr
            }
        };
        self.strategy
            .lock_get(LockTarget::Word(addr), &self.txn, req.ty.lock_mode())?;
        let data = self.memory.read_row(addr.add(ROW_HEADER_BYTES))?;
        let access = &mut self.accesses[idx];
        access.locked = true;
        access.data = data;
        Ok(&access.data)
    }

    /// Install writes and index changes on commit, release every lock,
    /// then free deleted rows (commit) or rows this transaction allocated
    /// (abort).
    pub fn cleanup(&mut self, outcome: Outcome) -> Result<()> {
        let memory = Arc::clone(&self.memory);
        let commit = outcome.is_commit();
        for access in &mut self.accesses {
            let Some(addr) = access.addr else { continue };
            let req = access.req;
            let mut free = !commit && access.fresh;
            if commit && access.locked {
                if req.ty.writes_data() {
                    memory.write_row(addr.add(ROW_HEADER_BYTES), &access.data)?;
                }
                if access.fresh && !memory.index_insert(req.index, req.key, addr)? {
                    // Lost to a concurrent insert of the same key.
                    free = true;
                } else if req.ty == AccessType::Delete {
                    memory.index_remove(req.node, req.index, req.key)?;
                    free = true;
                }
            }
            if access.locked {
                self.strategy
                    .lock_release(LockTarget::Word(addr), &self.txn, req.ty.lock_mode())?;
                access.locked = false;
            }
            if free {
                memory.free_row(addr)?;
            }
        }

        debug!(
            target: "dmtxn.cc",
            txn = %self.txn.id(),
            accesses = self.accesses.len(),
            commit = outcome.is_commit(),
            "one_sided_cleanup"
        );
        self.accesses.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use dmtxn_error::AbortReason;
    use dmtxn_types::{Clock, IndexId, ManualClock, ShutdownFlag, TableId, Value};

    use super::*;
    use crate::lock_manager::test_support::{loaded_cluster, node, txn};
    use crate::row_lock::{LockProtocol, LockWordAccess, OneSidedMedium, TxnRegistry, one_sided_strategy};

    const T0: TableId = TableId::new(0);
    const I0: IndexId = IndexId::new(0);

    fn strategy(memory: &Arc<ClusterMemory>, protocol: LockProtocol) -> Arc<dyn RowLockStrategy> {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::auto_advancing(0, 1));
        one_sided_strategy(
            protocol,
            OneSidedMedium {
                words: Arc::clone(memory) as Arc<dyn LockWordAccess>,
                registry: Arc::new(TxnRegistry::new()),
                clock,
                shutdown: ShutdownFlag::new(),
                wait_timeout: 100,
            },
        )
    }

    fn access(n: u32, ty: AccessType, key: u64) -> AccessRequest {
        AccessRequest::new(node(n), ty, key, T0, I0)
    }

    #[test]
    fn transfer_commits_in_place() {
        let memory = loaded_cluster(4);
        let lock = strategy(&memory, LockProtocol::NoWait);
        let mut client = OneSidedClient::new(txn(1, 1), Arc::clone(&memory), lock);
        let from = client.register_access(access(0, AccessType::Write, 2)).unwrap();
        let to = client.register_access(access(1, AccessType::Write, 3)).unwrap();
        assert_eq!(client.get_remote_row(from).unwrap(), 2u64.to_le_bytes());
        assert_eq!(client.get_remote_row(to).unwrap(), 3u64.to_le_bytes());
        client.data_mut(from).unwrap().copy_from_slice(&1u64.to_le_bytes());
        client.data_mut(to).unwrap().copy_from_slice(&4u64.to_le_bytes());
        client.cleanup(Outcome::Commit).unwrap();

        let addr = memory.index_lookup(node(0), I0, 2).unwrap().unwrap();
        assert_eq!(memory.read_row(addr.add(ROW_HEADER_BYTES)).unwrap(), 1u64.to_le_bytes());
        assert_eq!(memory.read(addr).unwrap(), 0, "lock word released");
    }

    #[test]
    fn conflicting_writer_aborts_and_releases_nothing_it_does_not_hold() {
        let memory = loaded_cluster(4);
        let lock = strategy(&memory, LockProtocol::NoWait);
        let mut a = OneSidedClient::new(txn(1, 1), Arc::clone(&memory), Arc::clone(&lock));
        let mut b = OneSidedClient::new(txn(2, 2), Arc::clone(&memory), lock);
        a.register_access(access(0, AccessType::Write, 0)).unwrap();
        b.register_access(access(0, AccessType::Read, 0)).unwrap();
        a.get_remote_row(0).unwrap();

        let err = b.get_remote_row(0).unwrap_err();
        assert_eq!(err.abort_reason(), Some(AbortReason::LockConflict));
        b.cleanup(Outcome::Abort).unwrap();

        let addr = memory.index_lookup(node(0), I0, 0).unwrap().unwrap();
        assert_ne!(memory.read(addr).unwrap(), 0, "A still holds its lock");
        a.cleanup(Outcome::Commit).unwrap();
        assert_eq!(memory.read(addr).unwrap(), 0);
    }

    #[test]
    fn fresh_rows_are_indexed_on_commit_and_freed_on_abort() {
        let memory = loaded_cluster(2);
        let lock = strategy(&memory, LockProtocol::WaitDie);
        let live = memory.node(node(1)).unwrap().rows().live_rows();

        let mut aborted = OneSidedClient::new(txn(1, 1), Arc::clone(&memory), Arc::clone(&lock));
        aborted.register_access(access(1, AccessType::Insert, 77)).unwrap();
        aborted.get_remote_row(0).unwrap();
        aborted.cleanup(Outcome::Abort).unwrap();
        assert_eq!(memory.index_lookup(node(1), I0, 77).unwrap(), None);
        assert_eq!(memory.node(node(1)).unwrap().rows().live_rows(), live);

        let mut committed = OneSidedClient::new(txn(1, 2), Arc::clone(&memory), lock);
        committed.register_access(access(1, AccessType::Insert, 77)).unwrap();
        committed.get_remote_row(0).unwrap();
        committed.cleanup(Outcome::Commit).unwrap();
        assert!(memory.index_lookup(node(1), I0, 77).unwrap().is_some());
        assert_eq!(memory.node(node(1)).unwrap().rows().live_rows(), live + 1);
    }

    #[test]
    fn delete_unindexes_and_frees() {
        let memory = loaded_cluster(2);
        let lock = strategy(&memory, LockProtocol::WoundWait);
        let mut client = OneSidedClient::new(txn(1, 1), Arc::clone(&memory), lock);
        client.register_access(access(0, AccessType::Delete, 0)).unwrap();
        client.get_remote_row(0).unwrap();
        client.cleanup(Outcome::Commit).unwrap();
        assert_eq!(memory.node(node(0)).unwrap().index(I0).unwrap().lookup(0), None::<Value>);
    }
}
