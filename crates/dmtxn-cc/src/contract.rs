//! The concurrency-manager contract shared by both sides of an exchange.
//!
//! A transaction owns one [`ClientConcurrency`] for its whole life. Each
//! storage node it touches holds one [`ServerConcurrency`] per live
//! transaction. Payload framing is private to each implementation pair;
//! the orchestration layer only moves the bytes.

use std::fmt;
use std::sync::Arc;

use dmtxn_error::{DmtxnError, Result};
use dmtxn_types::{
    AccessType, IndexId, Key, NodeId, Outcome, TableId, TxnHandle, WireReader, WireWriter,
};
use rand::rngs::StdRng;
use smallvec::SmallVec;

use crate::row_lock::LockGrant;

/// Nodes touched by a transaction; almost always a handful.
pub type NodeList = SmallVec<[NodeId; 4]>;

/// One row access as the workload asks for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessRequest {
    pub node: NodeId,
    pub ty: AccessType,
    pub key: Key,
    pub table: TableId,
    pub index: IndexId,
    /// Payload for partitioned writes and inserts.
    pub value: Option<u64>,
}

impl AccessRequest {
    #[must_use]
    pub const fn new(node: NodeId, ty: AccessType, key: Key, table: TableId, index: IndexId) -> Self {
        Self {
            node,
            ty,
            key,
            table,
            index,
            value: None,
        }
    }

    #[must_use]
    pub const fn with_value(mut self, value: u64) -> Self {
        self.value = Some(value);
        self
    }
}

/// Compute-node half of a transaction's concurrency control.
pub trait ClientConcurrency: Send + fmt::Debug {
    fn txn(&self) -> &Arc<TxnHandle>;

    /// Add an access and return its position. Registering the same
    /// (key, table) twice is a protocol violation.
    fn register_access(&mut self, req: AccessRequest, rng: &mut StdRng) -> Result<usize>;

    fn access_count(&self) -> usize;

    /// Tuple read for access `idx`, once its response arrived.
    fn data(&self, _idx: usize) -> Option<&[u8]> {
        None
    }

    /// Mutable tuple for a write access; persisted on commit.
    fn data_mut(&mut self, _idx: usize) -> Option<&mut Vec<u8>> {
        None
    }

    /// Index payload returned for access `idx` (partitioned).
    fn value(&self, _idx: usize) -> Option<u64> {
        None
    }

    /// Nodes with accesses not yet sent.
    fn nodes_involved(&self) -> NodeList;

    /// Nodes that must take part in commit or abort.
    fn commit_nodes(&self) -> &[NodeId];

    fn clear_nodes_involved(&mut self);

    /// Drop nodes that already aborted on their own.
    fn remove_commit_nodes(&mut self, aborted: &[NodeId]);

    /// Write the pending accesses for `node`; returns how many were written.
    fn serialize(&mut self, node: NodeId, out: &mut WireWriter) -> Result<usize>;

    /// Consume `node`'s response to the last [`serialize`](Self::serialize).
    fn deserialize(&mut self, node: NodeId, input: &mut WireReader<'_>, rng: &mut StdRng)
    -> Result<()>;

    /// Write `node`'s write set for prepare or single-node commit; returns
    /// how many entries were written.
    fn serialize_commit(&self, node: NodeId, out: &mut WireWriter) -> usize;

    /// Finish the transaction locally and release all client state.
    fn cleanup(&mut self, outcome: Outcome);
}

/// Memory-node half of a transaction's concurrency control.
pub trait ServerConcurrency: Send + fmt::Debug {
    fn txn(&self) -> &Arc<TxnHandle>;

    /// Append the accesses of one request.
    fn parse_request(&mut self, input: &mut WireReader<'_>) -> Result<()>;

    /// Work through the parsed accesses not yet processed.
    ///
    /// Returns [`LockGrant::Waiting`] when the transaction is parked behind
    /// a conflicting holder; calling again after promotion resumes with
    /// the next access. An abort has already cleaned up when it returns.
    fn process_request(&mut self) -> Result<LockGrant>;

    /// Response payload for every access processed since the last call.
    fn get_resp_data(&mut self, out: &mut WireWriter) -> Result<()>;

    /// First 2PC phase; fills the write buffers.
    fn process_prepare(&mut self, input: &mut WireReader<'_>) -> Result<()>;

    /// Second 2PC phase, or prepare+commit when a write set is attached.
    fn process_commit(&mut self, input: &mut WireReader<'_>) -> Result<()>;

    /// Release everything the transaction holds. Safe to call twice.
    fn cleanup(&mut self, outcome: Outcome) -> Result<()>;
}

/// Positions of accesses on one node.
pub(crate) fn accesses_on<'a, T>(
    accesses: &'a [T],
    node: NodeId,
    node_of: impl Fn(&T) -> NodeId + 'a,
) -> impl Iterator<Item = usize> + 'a {
    accesses
        .iter()
        .enumerate()
        .filter(move |(_, a)| node_of(a) == node)
        .map(|(i, _)| i)
}

pub(crate) fn duplicate_access(key: Key, table: TableId) -> DmtxnError {
    DmtxnError::DuplicateAccess {
        key,
        table: table.get(),
    }
}

pub(crate) fn push_unique(nodes: &mut NodeList, node: NodeId) {
    if !nodes.contains(&node) {
        nodes.push(node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_request_builder() {
        let node = NodeId::new(1).unwrap();
        let req = AccessRequest::new(node, AccessType::Write, 7, TableId::new(0), IndexId::new(0));
        assert_eq!(req.value, None);
        assert_eq!(req.with_value(9).value, Some(9));
    }

    #[test]
    fn accesses_on_filters_by_node() {
        let n0 = NodeId::new(0).unwrap();
        let n1 = NodeId::new(1).unwrap();
        let nodes = [n0, n1, n0];
        let on_n0: Vec<usize> = accesses_on(&nodes, n0, |n| *n).collect();
        assert_eq!(on_n0, vec![0, 2]);
    }

    #[test]
    fn push_unique_keeps_first_occurrence_order() {
        let mut nodes = NodeList::new();
        for raw in [2, 0, 2, 1, 0] {
            push_unique(&mut nodes, NodeId::new(raw).unwrap());
        }
        let raw: Vec<u32> = nodes.iter().map(|n| n.get()).collect();
        assert_eq!(raw, vec![2, 0, 1]);
    }
}
