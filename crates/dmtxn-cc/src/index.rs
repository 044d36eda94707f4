//! Index capability and the pending structural changes of a transaction.

use std::collections::BTreeMap;
use std::fmt;

use dmtxn_error::{DmtxnError, Result};
use dmtxn_types::{IndexId, Key, Value};
use parking_lot::RwLock;

/// Point and range operations over one index.
///
/// Every method is a single atomic operation on the index; callers compose
/// them under row locks (non-partitioned) or not at all (partitioned).
pub trait Index: Send + Sync + fmt::Debug {
    fn id(&self) -> IndexId;

    /// Insert `key`; `false` (and no change) if it is already present.
    fn insert(&self, key: Key, value: Value) -> bool;

    /// Replace the value of an existing key; `false` if absent.
    fn update(&self, key: Key, value: Value) -> bool;

    /// Insert or replace.
    fn upsert(&self, key: Key, value: Value) -> Option<Value>;

    fn lookup(&self, key: Key) -> Option<Value>;

    fn remove(&self, key: Key) -> Option<Value>;

    /// Up to `limit` entries with keys `>= from`, in key order.
    fn scan(&self, from: Key, limit: usize) -> Vec<(Key, Value)>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Ordered in-memory index.
#[derive(Debug)]
pub struct OrderedIndex {
    id: IndexId,
    map: RwLock<BTreeMap<Key, Value>>,
}

impl OrderedIndex {
    #[must_use]
    pub const fn new(id: IndexId) -> Self {
        Self {
            id,
            map: RwLock::new(BTreeMap::new()),
        }
    }
}

impl Index for OrderedIndex {
    fn id(&self) -> IndexId {
        self.id
    }

    fn insert(&self, key: Key, value: Value) -> bool {
        let mut map = self.map.write();
        if map.contains_key(&key) {
            return false;
        }
        map.insert(key, value);
        true
    }

    fn update(&self, key: Key, value: Value) -> bool {
        match self.map.write().get_mut(&key) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    fn upsert(&self, key: Key, value: Value) -> Option<Value> {
        self.map.write().insert(key, value)
    }

    fn lookup(&self, key: Key) -> Option<Value> {
        self.map.read().get(&key).copied()
    }

    fn remove(&self, key: Key) -> Option<Value> {
        self.map.write().remove(&key)
    }

    fn scan(&self, from: Key, limit: usize) -> Vec<(Key, Value)> {
        self.map
            .read()
            .range(from..)
            .take(limit)
            .map(|(k, v)| (*k, *v))
            .collect()
    }

    fn len(&self) -> usize {
        self.map.read().len()
    }
}

/// Index id -> index on one node.
#[derive(Debug, Default)]
pub struct IndexCatalog {
    indexes: Vec<Box<dyn Index>>,
}

impl IndexCatalog {
    /// `count` ordered indexes with ids `0..count`.
    #[must_use]
    pub fn ordered(count: u32) -> Self {
        let indexes = (0..count)
            .map(|id| Box::new(OrderedIndex::new(IndexId::new(id))) as Box<dyn Index>)
            .collect();
        Self { indexes }
    }

    pub fn get(&self, id: IndexId) -> Result<&dyn Index> {
        self.indexes
            .get(id.get() as usize)
            .map(AsRef::as_ref)
            .ok_or(DmtxnError::UnknownIndex { index: id.get() })
    }

    pub fn len(&self) -> usize {
        self.indexes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indexes.is_empty()
    }
}

/// An index insert deferred to commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertOp {
    pub index: IndexId,
    pub key: Key,
    pub value: Value,
}

/// An index removal deferred to commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteOp {
    pub index: IndexId,
    pub key: Key,
}

/// Apply deferred inserts, then deletes.
///
/// Returns the values of inserts that lost to a concurrent insert of the
/// same key; their rows are no longer reachable and belong to the caller.
pub fn commit_insdel(
    catalog: &IndexCatalog,
    inserts: &[InsertOp],
    deletes: &[DeleteOp],
) -> Result<Vec<Value>> {
    let mut displaced = Vec::new();
    for op in inserts {
        if !catalog.get(op.index)?.insert(op.key, op.value) {
            displaced.push(op.value);
        }
    }
    for op in deletes {
        catalog.get(op.index)?.remove(op.key);
    }
    Ok(displaced)
}

#[cfg(test)]
mod tests {
    use dmtxn_types::RowHandle;

    use super::*;

    fn row(n: u64) -> Value {
        Value::Row(RowHandle::new(n))
    }

    #[test]
    fn point_operations() {
        let index = OrderedIndex::new(IndexId::new(0));
        assert!(index.insert(5, row(1)));
        assert!(!index.insert(5, row(2)), "insert does not overwrite");
        assert_eq!(index.lookup(5), Some(row(1)));
        assert!(index.update(5, row(3)));
        assert!(!index.update(6, row(3)));
        assert_eq!(index.upsert(6, Value::Raw(9)), None);
        assert_eq!(index.upsert(6, Value::Raw(10)), Some(Value::Raw(9)));
        assert_eq!(index.remove(5), Some(row(3)));
        assert_eq!(index.lookup(5), None);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn scan_is_ordered_and_bounded() {
        let index = OrderedIndex::new(IndexId::new(0));
        for key in [40, 10, 30, 20] {
            index.insert(key, Value::Raw(key));
        }
        let keys: Vec<Key> = index.scan(15, 2).into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![20, 30]);
        assert!(index.scan(41, 10).is_empty());
    }

    #[test]
    fn catalog_lookup() {
        let catalog = IndexCatalog::ordered(2);
        assert_eq!(catalog.get(IndexId::new(1)).unwrap().id(), IndexId::new(1));
        assert!(matches!(
            catalog.get(IndexId::new(2)),
            Err(DmtxnError::UnknownIndex { index: 2 })
        ));
    }

    #[test]
    fn deferred_inserts_then_deletes() {
        let catalog = IndexCatalog::ordered(1);
        let idx = IndexId::new(0);
        catalog.get(idx).unwrap().insert(1, row(1));

        let inserts = [
            InsertOp { index: idx, key: 1, value: row(7) },
            InsertOp { index: idx, key: 2, value: row(8) },
        ];
        let deletes = [DeleteOp { index: idx, key: 2 }];
        let displaced = commit_insdel(&catalog, &inserts, &deletes).unwrap();

        assert_eq!(displaced, vec![row(7)]);
        let index = catalog.get(idx).unwrap();
        assert_eq!(index.lookup(1), Some(row(1)));
        assert_eq!(index.lookup(2), None, "delete applies after insert");
    }
}
