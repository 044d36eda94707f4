//! Two-sided lock manager, memory-node side.

use std::sync::Arc;

use dmtxn_error::{AbortReason, DmtxnError, Result};
use dmtxn_types::{
    AccessType, IndexId, Key, Outcome, RowHandle, TableId, Timestamp, TxnHandle, TxnState, Value,
    WireReader, WireWriter,
};
use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::cache::CacheHint;
use crate::contract::ServerConcurrency;
use crate::index::{DeleteOp, InsertOp, commit_insdel};
use crate::row_lock::{LockGrant, LockTarget, RowLockStrategy};
use crate::storage::NodeStorage;

#[derive(Debug)]
struct ServerAccess {
    ty: AccessType,
    key: Key,
    index: IndexId,
    table: TableId,
    hint: CacheHint,
    row: Option<RowHandle>,
    /// The cached handle named another key; the response carries the fresh one.
    stale: bool,
    /// A lock request was granted or queued and needs exactly one release.
    locked: bool,
    write: Option<Vec<u8>>,
}

/// One transaction's accesses and locks on this node.
#[derive(Debug)]
pub struct LockServer {
    txn: Arc<TxnHandle>,
    storage: Arc<NodeStorage>,
    strategy: Arc<dyn RowLockStrategy>,
    accesses: Vec<ServerAccess>,
    next: usize,
    responded: usize,
    inserts: Vec<InsertOp>,
    deletes: Vec<DeleteOp>,
    /// Rows allocated for keys the index did not have yet.
    speculative: Vec<RowHandle>,
    /// Rows whose index entry is removed on commit.
    doomed: Vec<RowHandle>,
    finished: bool,
}

impl LockServer {
    pub fn new(
        txn: Arc<TxnHandle>,
        storage: Arc<NodeStorage>,
        strategy: Arc<dyn RowLockStrategy>,
    ) -> Self {
        Self {
            txn,
            storage,
            strategy,
            accesses: Vec::new(),
            next: 0,
            responded: 0,
            inserts: Vec::new(),
            deletes: Vec::new(),
            speculative: Vec::new(),
            doomed: Vec::new(),
            finished: false,
        }
    }

    pub fn access_count(&self) -> usize {
        self.accesses.len()
    }

    /// Row behind access `idx`, resolving it on first use.
    fn resolve_row(&mut self, idx: usize) -> Result<RowHandle> {
        if let Some(row) = self.accesses[idx].row {
            return Ok(row);
        }
        let access = &self.accesses[idx];
        let (ty, key, index, table) = (access.ty, access.key, access.index, access.table);
        let rows = self.storage.rows();

        let mut stale = false;
        let cached = match access.hint {
            CacheHint::Cached(handle) if rows.holds(handle, table, key) => Some(handle),
            CacheHint::Cached(handle) => {
                stale = true;
                trace!(target: "dmtxn.cc", key, handle = %handle, "stale_cached_row");
                None
            }
            CacheHint::None | CacheHint::Admit => None,
        };

        let row = match cached {
            Some(handle) => handle,
            None => match self.storage.index(index)?.lookup(key) {
                Some(Value::Row(handle)) => handle,
                Some(other) => {
                    return Err(DmtxnError::protocol(format!(
                        "index {} maps key {key} to {other}, not a row",
                        index.get()
                    )));
                }
                None => {
                    let handle = self.storage.allocate_row(table, key)?;
                    self.inserts.push(InsertOp {
                        index,
                        key,
                        value: Value::Row(handle),
                    });
                    self.speculative.push(handle);
                    handle
                }
            },
        };
        if ty == AccessType::Delete {
            self.deletes.push(DeleteOp { index, key });
            self.doomed.push(row);
        }
        let access = &mut self.accesses[idx];
        access.row = Some(row);
        access.stale = stale;
        Ok(row)
    }

    /// Resolve and lock the row of access `idx`.
    pub fn get_row(&mut self, idx: usize) -> Result<LockGrant> {
        if self.txn.state() != TxnState::Running {
            return Err(self.lost(AbortReason::NotRunning));
        }
        let row = self.resolve_row(idx)?;
        let mode = self.accesses[idx].ty.lock_mode();
        let entry = self.storage.rows().lock_entry(row)?;
        let grant = self
            .strategy
            .lock_get(LockTarget::Entry(entry), &self.txn, mode)?;
        self.accesses[idx].locked = true;
        Ok(grant)
    }

    fn lost(&self, otherwise: AbortReason) -> DmtxnError {
        let reason = if self.txn.state() == TxnState::Aborting {
            AbortReason::Wounded
        } else {
            otherwise
        };
        DmtxnError::aborted(self.txn.id(), reason)
    }

    fn release_locks(&mut self) -> Result<()> {
        let rows = self.storage.rows();
        for access in &mut self.accesses {
            if !access.locked {
                continue;
            }
            if let Some(row) = access.row {
                self.strategy.lock_release(
                    LockTarget::Entry(rows.lock_entry(row)?),
                    &self.txn,
                    access.ty.lock_mode(),
                )?;
            }
            access.locked = false;
        }
        Ok(())
    }
}

impl ServerConcurrency for LockServer {
    fn txn(&self) -> &Arc<TxnHandle> {
        &self.txn
    }

    fn parse_request(&mut self, input: &mut WireReader<'_>) -> Result<()> {
        let ts = input.get_u64()?;
        if self.strategy.protocol().uses_timestamps() && ts != 0 {
            self.txn.set_ts_if_unset(Timestamp::new(ts));
        }
        let count = input.get_u32()?;
        self.accesses.reserve(count as usize);
        for _ in 0..count {
            let ty = AccessType::from_wire(input.get_u8()?)?;
            let key = input.get_u64()?;
            let index = IndexId::new(input.get_u32()?);
            let table = TableId::new(input.get_u32()?);
            let hint = CacheHint::from_wire(input.get_u64()?);
            self.accesses.push(ServerAccess {
                ty,
                key,
                index,
                table,
                hint,
                row: None,
                stale: false,
                locked: false,
                write: None,
            });
        }
        input.finish()?;
        Ok(())
    }

    fn process_request(&mut self) -> Result<LockGrant> {
        while self.next < self.accesses.len() {
            match self.get_row(self.next) {
                Ok(grant) => {
                    self.next += 1;
                    if grant == LockGrant::Waiting {
                        return Ok(LockGrant::Waiting);
                    }
                }
                Err(err) => {
                    self.txn.set_state(TxnState::Aborting);
                    self.cleanup(Outcome::Abort)?;
                    return Err(err);
                }
            }
        }
        Ok(LockGrant::Acquired)
    }

    fn get_resp_data(&mut self, out: &mut WireWriter) -> Result<()> {
        let rows = self.storage.rows();
        out.put_u32((self.next - self.responded) as u32);
        for access in &self.accesses[self.responded..self.next] {
            let row = access
                .row
                .ok_or_else(|| DmtxnError::protocol("responding for an unresolved access"))?;
            match access.hint {
                CacheHint::None => {}
                CacheHint::Admit => out.put_u64(row.get()),
                CacheHint::Cached(_) => {
                    out.put_bool(access.stale);
                    if access.stale {
                        out.put_u64(row.get());
                    }
                }
            }
            out.put_bytes(&rows.read(row)?);
        }
        self.responded = self.next;
        Ok(())
    }

    fn process_prepare(&mut self, input: &mut WireReader<'_>) -> Result<()> {
        if !self
            .txn
            .update_state(TxnState::Running, TxnState::Committing)
        {
            return Err(self.lost(AbortReason::NotRunning));
        }
        let count = input.get_u32()?;
        for _ in 0..count {
            let pos = input.get_u32()? as usize;
            let data = input.get_bytes()?;
            let access = self
                .accesses
                .get_mut(pos)
                .filter(|a| a.ty.writes_data())
                .ok_or_else(|| {
                    DmtxnError::protocol(format!("write set names access {pos}, not a write"))
                })?;
            access.write = Some(data.to_vec());
        }
        input.finish()?;
        Ok(())
    }

    fn process_commit(&mut self, input: &mut WireReader<'_>) -> Result<()> {
        if input.remaining() > 0 {
            self.process_prepare(input)?;
        } else if self.txn.state() != TxnState::Committing
            && !self
                .txn
                .update_state(TxnState::Running, TxnState::Committing)
        {
            return Err(self.lost(AbortReason::NotRunning));
        }
        self.cleanup(Outcome::Commit)
    }

    fn cleanup(&mut self, outcome: Outcome) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        let storage = Arc::clone(&self.storage);
        let rows = storage.rows();

        let mut displaced: SmallVec<[RowHandle; 2]> = SmallVec::new();
        if outcome.is_commit() {
            for access in &self.accesses {
                if let (Some(row), Some(data)) = (access.row, &access.write) {
                    rows.write(row, data)?;
                }
            }
            for value in commit_insdel(storage.indexes(), &self.inserts, &self.deletes)? {
                if let Some(row) = value.row() {
                    rows.free(row)?;
                    displaced.push(row);
                }
            }
        }

        self.release_locks()?;

        let to_free = if outcome.is_commit() {
            &self.doomed
        } else {
            &self.speculative
        };
        for row in to_free.iter().filter(|row| !displaced.contains(row)) {
            rows.free(*row)?;
        }

        debug!(
            target: "dmtxn.cc",
            node = storage.node().get(),
            txn = %self.txn.id(),
            accesses = self.accesses.len(),
            commit = outcome.is_commit(),
            "server_cleanup"
        );
        self.inserts.clear();
        self.deletes.clear();
        self.speculative.clear();
        self.doomed.clear();
        Ok(())
    }
}
