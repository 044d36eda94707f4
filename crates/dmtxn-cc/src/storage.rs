//! Row storage on memory nodes.
//!
//! A [`RowStore`] is a fixed array of row slots. Allocation pops a free slot
//! and stamps it with its (table, key); freeing clears the stamp and pushes
//! the slot back, so a [`RowHandle`] held by a client cache can later name a
//! row that belongs to a different key. Readers detect that by comparing the
//! live key (see [`RowStore::live_key`]).
//!
//! Each slot also carries both flavors of row lock state: the mutex-guarded
//! [`LockEntry`] used by two-sided protocols and the [`LockWordPair`] used by
//! one-sided protocols. [`ClusterMemory`] maps [`RemoteAddr`]s onto slots so
//! the one-sided medium can address them.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use dmtxn_error::{DmtxnError, Result};
use dmtxn_types::{IndexId, Key, NodeId, RemoteAddr, RowHandle, TableId, Value};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::index::{Index, IndexCatalog};
use crate::row_lock::lock_word::{LockWordAccess, LockWordPair, ROW_HEADER_BYTES};
use crate::row_lock::two_sided::LockEntry;

/// Row addresses are `slot << ROW_ADDR_SHIFT`; the low bits select a field.
pub const ROW_ADDR_SHIFT: u32 = 16;

const FIELD_MASK: u64 = (1 << ROW_ADDR_SHIFT) - 1;

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

/// Tuple size of every table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    tuple_sizes: Vec<usize>,
}

impl Schema {
    #[must_use]
    pub fn new(tuple_sizes: Vec<usize>) -> Self {
        Self { tuple_sizes }
    }

    #[must_use]
    pub fn single_table(tuple_size: usize) -> Self {
        Self::new(vec![tuple_size])
    }

    pub fn num_tables(&self) -> u32 {
        self.tuple_sizes.len() as u32
    }

    pub fn tuple_size(&self, table: TableId) -> Result<usize> {
        self.tuple_sizes
            .get(table.get() as usize)
            .copied()
            .ok_or(DmtxnError::UnknownTable { table: table.get() })
    }

    /// Index backing the primary key of `table`.
    #[inline]
    pub const fn primary_index(table: TableId) -> IndexId {
        IndexId::new(table.get())
    }
}

// ---------------------------------------------------------------------------
// RowStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct RowBody {
    owner: Option<(TableId, Key)>,
    data: Vec<u8>,
}

#[derive(Debug, Default)]
struct RowSlot {
    body: RwLock<RowBody>,
    entry: Mutex<LockEntry>,
    words: LockWordPair,
}

/// Fixed-capacity row slots of one node.
#[derive(Debug)]
pub struct RowStore {
    node: NodeId,
    slots: Box<[RowSlot]>,
    free: Mutex<Vec<usize>>,
}

impl RowStore {
    #[must_use]
    pub fn new(node: NodeId, capacity: usize) -> Self {
        let slots = (0..capacity).map(|_| RowSlot::default()).collect();
        // Popped from the back: slot 0 is handed out first.
        let free = (0..capacity).rev().collect();
        Self {
            node,
            slots,
            free: Mutex::new(free),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn live_rows(&self) -> usize {
        self.slots.len() - self.free.lock().len()
    }

    fn slot(&self, handle: RowHandle) -> Result<&RowSlot> {
        self.slots.get(handle.slot()).ok_or_else(|| {
            DmtxnError::protocol(format!("{handle} out of range on {}", self.node))
        })
    }

    /// Take a free slot for `(table, key)` with a zeroed tuple of `tuple_size` bytes.
    pub fn allocate(&self, table: TableId, key: Key, tuple_size: usize) -> Result<RowHandle> {
        let slot = self.free.lock().pop().ok_or(DmtxnError::StorageFull {
            node: self.node.get(),
            capacity: self.slots.len(),
        })?;
        let mut body = self.slots[slot].body.write();
        body.owner = Some((table, key));
        body.data.clear();
        body.data.resize(tuple_size, 0);
        trace!(target: "dmtxn.cc", node = self.node.get(), slot, key, "row_allocated");
        Ok(RowHandle::new(slot as u64))
    }

    /// Return a slot to the free list.
    pub fn free(&self, handle: RowHandle) -> Result<()> {
        let slot = self.slot(handle)?;
        {
            let mut body = slot.body.write();
            if body.owner.take().is_none() {
                return Err(DmtxnError::protocol(format!(
                    "double free of {handle} on {}",
                    self.node
                )));
            }
            body.data.clear();
        }
        self.free.lock().push(handle.slot());
        trace!(target: "dmtxn.cc", node = self.node.get(), slot = handle.get(), "row_freed");
        Ok(())
    }

    /// The (table, key) currently stored in the slot, `None` if free.
    pub fn live_key(&self, handle: RowHandle) -> Result<Option<(TableId, Key)>> {
        Ok(self.slot(handle)?.body.read().owner)
    }

    /// Whether the slot still holds `(table, key)`.
    pub fn holds(&self, handle: RowHandle, table: TableId, key: Key) -> bool {
        self.live_key(handle)
            .is_ok_and(|owner| owner == Some((table, key)))
    }

    pub fn read(&self, handle: RowHandle) -> Result<Vec<u8>> {
        Ok(self.slot(handle)?.body.read().data.clone())
    }

    /// Overwrite the tuple. `data` must match the tuple size.
    pub fn write(&self, handle: RowHandle, data: &[u8]) -> Result<()> {
        let mut body = self.slot(handle)?.body.write();
        if body.data.len() != data.len() {
            return Err(DmtxnError::protocol(format!(
                "write of {} bytes to {handle} holding {} bytes",
                data.len(),
                body.data.len()
            )));
        }
        body.data.copy_from_slice(data);
        Ok(())
    }

    pub fn lock_entry(&self, handle: RowHandle) -> Result<&Mutex<LockEntry>> {
        Ok(&self.slot(handle)?.entry)
    }

    pub fn lock_words(&self, handle: RowHandle) -> Result<&LockWordPair> {
        Ok(&self.slot(handle)?.words)
    }
}

// ---------------------------------------------------------------------------
// NodeStorage
// ---------------------------------------------------------------------------

/// Everything one memory node holds: rows, indexes and their lock state.
#[derive(Debug)]
pub struct NodeStorage {
    node: NodeId,
    schema: Arc<Schema>,
    rows: RowStore,
    indexes: IndexCatalog,
}

impl NodeStorage {
    /// A node with one ordered primary index per table.
    #[must_use]
    pub fn new(node: NodeId, schema: Arc<Schema>, rows_per_node: usize) -> Self {
        let indexes = IndexCatalog::ordered(schema.num_tables());
        Self {
            node,
            schema,
            rows: RowStore::new(node, rows_per_node),
            indexes,
        }
    }

    #[inline]
    pub const fn node(&self) -> NodeId {
        self.node
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub const fn rows(&self) -> &RowStore {
        &self.rows
    }

    pub const fn indexes(&self) -> &IndexCatalog {
        &self.indexes
    }

    pub fn index(&self, id: IndexId) -> Result<&dyn Index> {
        self.indexes.get(id)
    }

    /// Allocate a zeroed row for `(table, key)` without indexing it.
    pub fn allocate_row(&self, table: TableId, key: Key) -> Result<RowHandle> {
        let size = self.schema.tuple_size(table)?;
        self.rows.allocate(table, key, size)
    }

    /// Store and index a row (initial load).
    pub fn load_row(&self, table: TableId, key: Key, data: &[u8]) -> Result<RowHandle> {
        let handle = self.allocate_row(table, key)?;
        self.rows.write(handle, data)?;
        self.index(Schema::primary_index(table))?
            .insert(key, Value::Row(handle));
        Ok(handle)
    }

    /// Store a raw index entry (partitioned deployments keep payloads in the index).
    pub fn load_entry(&self, index: IndexId, key: Key, value: u64) -> Result<()> {
        self.index(index)?.insert(key, Value::Raw(value));
        Ok(())
    }

    /// The address of a row for one-sided access.
    pub fn row_addr(&self, handle: RowHandle) -> Result<RemoteAddr> {
        RemoteAddr::new(self.node, handle.get() << ROW_ADDR_SHIFT).ok_or_else(|| {
            DmtxnError::protocol(format!("{handle} does not fit a remote address"))
        })
    }
}

/// Split an address into (row, field offset).
#[inline]
pub const fn split_addr(addr: RemoteAddr) -> (RowHandle, u64) {
    (
        RowHandle::new(addr.offset() >> ROW_ADDR_SHIFT),
        addr.offset() & FIELD_MASK,
    )
}

// ---------------------------------------------------------------------------
// ClusterMemory
// ---------------------------------------------------------------------------

/// All memory nodes, addressable from any compute thread.
#[derive(Debug, Clone)]
pub struct ClusterMemory {
    nodes: Vec<Arc<NodeStorage>>,
}

impl ClusterMemory {
    #[must_use]
    pub fn new(num_nodes: u32, schema: &Arc<Schema>, rows_per_node: usize) -> Self {
        let nodes = NodeId::all(num_nodes)
            .map(|node| Arc::new(NodeStorage::new(node, Arc::clone(schema), rows_per_node)))
            .collect();
        Self { nodes }
    }

    pub fn num_nodes(&self) -> u32 {
        self.nodes.len() as u32
    }

    pub fn nodes(&self) -> &[Arc<NodeStorage>] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> Result<&Arc<NodeStorage>> {
        self.nodes.get(id.index()).ok_or(DmtxnError::UnknownNode {
            node: id.get(),
            num_nodes: self.nodes.len() as u32,
        })
    }

    fn resolve(&self, addr: RemoteAddr) -> Result<(&NodeStorage, RowHandle, u64)> {
        let node = self.node(addr.node())?;
        let (row, field) = split_addr(addr);
        Ok((node, row, field))
    }

    fn data_row(&self, addr: RemoteAddr) -> Result<(&NodeStorage, RowHandle)> {
        let (node, row, field) = self.resolve(addr)?;
        if field != ROW_HEADER_BYTES {
            return Err(DmtxnError::protocol(format!(
                "{addr} is not a tuple address"
            )));
        }
        Ok((node, row))
    }

    /// Read the tuple at `addr` (row address + [`ROW_HEADER_BYTES`]).
    pub fn read_row(&self, addr: RemoteAddr) -> Result<Vec<u8>> {
        let (node, row) = self.data_row(addr)?;
        node.rows().read(row)
    }

    /// Write the tuple at `addr` (row address + [`ROW_HEADER_BYTES`]).
    pub fn write_row(&self, addr: RemoteAddr, data: &[u8]) -> Result<()> {
        let (node, row) = self.data_row(addr)?;
        node.rows().write(row, data)
    }

    /// Look `key` up in a node's index and return the row address.
    pub fn index_lookup(&self, node: NodeId, index: IndexId, key: Key) -> Result<Option<RemoteAddr>> {
        let storage = self.node(node)?;
        match storage.index(index)?.lookup(key) {
            Some(Value::Row(handle)) => storage.row_addr(handle).map(Some),
            Some(Value::RemoteAddr(addr)) => Ok(Some(addr)),
            Some(Value::Raw(_)) => Err(DmtxnError::protocol(format!(
                "index {} on {node} holds raw payloads, not rows",
                index.get()
            ))),
            None => Ok(None),
        }
    }

    /// Allocate an unindexed row on `node` (remote allocation RPC).
    pub fn alloc_row(&self, node: NodeId, table: TableId, key: Key) -> Result<RemoteAddr> {
        let storage = self.node(node)?;
        let handle = storage.allocate_row(table, key)?;
        storage.row_addr(handle)
    }

    pub fn free_row(&self, addr: RemoteAddr) -> Result<()> {
        let (node, row, _) = self.resolve(addr)?;
        node.rows().free(row)
    }

    /// Index a row; `false` if the key is already present.
    pub fn index_insert(&self, index: IndexId, key: Key, addr: RemoteAddr) -> Result<bool> {
        let (node, row, _) = self.resolve(addr)?;
        Ok(node.index(index)?.insert(key, Value::Row(row)))
    }

    pub fn index_remove(&self, node: NodeId, index: IndexId, key: Key) -> Result<Option<Value>> {
        Ok(self.node(node)?.index(index)?.remove(key))
    }

    fn word(&self, addr: RemoteAddr) -> Result<&std::sync::atomic::AtomicU64> {
        let (node, row, field) = self.resolve(addr)?;
        node.rows()
            .lock_words(row)?
            .word_at(field)
            .ok_or_else(|| DmtxnError::protocol(format!("{addr} is not a lock word")))
    }
}

impl LockWordAccess for ClusterMemory {
    fn read(&self, addr: RemoteAddr) -> Result<u64> {
        Ok(self.word(addr)?.load(Ordering::Acquire))
    }

    fn cas(&self, addr: RemoteAddr, expected: u64, desired: u64) -> Result<u64> {
        let word = self.word(addr)?;
        Ok(
            match word.compare_exchange(expected, desired, Ordering::AcqRel, Ordering::Acquire) {
                Ok(prev) | Err(prev) => prev,
            },
        )
    }

    fn write(&self, addr: RemoteAddr, value: u64) -> Result<()> {
        self.word(addr)?.store(value, Ordering::Release);
        Ok(())
    }

    fn faa(&self, addr: RemoteAddr, delta: u64) -> Result<u64> {
        Ok(self.word(addr)?.fetch_add(delta, Ordering::AcqRel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row_lock::lock_word::{LOCK_WORD_OFFSET, TS_WORD_OFFSET};

    fn node(n: u32) -> NodeId {
        NodeId::new(n).unwrap()
    }

    fn cluster(nodes: u32, rows: usize) -> ClusterMemory {
        ClusterMemory::new(nodes, &Arc::new(Schema::single_table(8)), rows)
    }

    #[test]
    fn allocate_write_read_free() {
        let store = RowStore::new(node(0), 2);
        let a = store.allocate(TableId::new(0), 10, 4).unwrap();
        assert_eq!(a, RowHandle::new(0));
        store.write(a, &[1, 2, 3, 4]).unwrap();
        assert_eq!(store.read(a).unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(store.live_key(a).unwrap(), Some((TableId::new(0), 10)));
        assert!(store.write(a, &[1]).is_err());

        store.free(a).unwrap();
        assert_eq!(store.live_key(a).unwrap(), None);
        assert!(store.free(a).unwrap_err().is_protocol_violation());
    }

    #[test]
    fn freed_slot_is_reused_for_another_key() {
        let store = RowStore::new(node(0), 1);
        let table = TableId::new(0);
        let first = store.allocate(table, 7, 8).unwrap();
        store.free(first).unwrap();
        let second = store.allocate(table, 8, 8).unwrap();
        assert_eq!(first, second);
        assert!(!store.holds(first, table, 7));
        assert!(store.holds(second, table, 8));
    }

    #[test]
    fn full_store_reports_capacity() {
        let store = RowStore::new(node(3), 1);
        store.allocate(TableId::new(0), 1, 8).unwrap();
        let err = store.allocate(TableId::new(0), 2, 8).unwrap_err();
        assert!(matches!(err, DmtxnError::StorageFull { node: 3, capacity: 1 }));
        assert!(err.is_transient());
    }

    #[test]
    fn load_row_is_indexed() {
        let memory = cluster(2, 4);
        let storage = memory.node(node(1)).unwrap();
        let handle = storage.load_row(TableId::new(0), 42, &[9; 8]).unwrap();
        let index = storage.index(IndexId::new(0)).unwrap();
        assert_eq!(index.lookup(42), Some(Value::Row(handle)));

        let addr = memory
            .index_lookup(node(1), IndexId::new(0), 42)
            .unwrap()
            .unwrap();
        assert_eq!(addr.node(), node(1));
        assert_eq!(memory.read_row(addr.add(ROW_HEADER_BYTES)).unwrap(), vec![9; 8]);
        assert!(memory.read_row(addr).is_err(), "lock word is not tuple data");
    }

    #[test]
    fn lock_word_verbs() {
        let memory = cluster(1, 2);
        let addr = memory.alloc_row(node(0), TableId::new(0), 5).unwrap();
        let lock = addr.add(LOCK_WORD_OFFSET);
        let ts = addr.add(TS_WORD_OFFSET);

        assert_eq!(memory.read(lock).unwrap(), 0);
        assert_eq!(memory.cas(lock, 0, 3).unwrap(), 0);
        assert_eq!(memory.cas(lock, 0, 4).unwrap(), 3, "failed CAS returns current");
        assert_eq!(memory.faa(lock, u64::MAX).unwrap(), 3);
        assert_eq!(memory.read(lock).unwrap(), 2);
        memory.write(ts, 77).unwrap();
        assert_eq!(memory.read(ts).unwrap(), 77);
        assert!(memory.read(addr.add(ROW_HEADER_BYTES)).is_err());
    }

    #[test]
    fn unknown_node_and_table() {
        let memory = cluster(1, 1);
        assert!(matches!(
            memory.node(node(4)),
            Err(DmtxnError::UnknownNode { node: 4, num_nodes: 1 })
        ));
        let storage = memory.node(node(0)).unwrap();
        assert!(matches!(
            storage.allocate_row(TableId::new(9), 1),
            Err(DmtxnError::UnknownTable { table: 9 })
        ));
    }
}
