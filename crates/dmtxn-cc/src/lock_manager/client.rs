//! Two-sided lock manager, compute side.

use std::sync::Arc;

use dmtxn_error::{DmtxnError, Result};
use dmtxn_types::{
    AccessType, NodeId, Outcome, RowHandle, TxnHandle, WireReader, WireWriter,
};
use rand::rngs::StdRng;
use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::cache::{CacheHint, RowCache};
use crate::contract::{
    AccessRequest, ClientConcurrency, NodeList, accesses_on, duplicate_access, push_unique,
};

#[derive(Debug)]
struct ClientAccess {
    req: AccessRequest,
    /// Position among this transaction's accesses on the same node; the
    /// node's own access list uses the same order.
    node_pos: u32,
    hint: CacheHint,
    sent: bool,
    received: bool,
    data: Vec<u8>,
}

/// Accesses, cache hints and write buffers of one transaction.
#[derive(Debug)]
pub struct LockClient {
    txn: Arc<TxnHandle>,
    cache: Option<Arc<RowCache>>,
    accesses: Vec<ClientAccess>,
    involved: NodeList,
    commit_nodes: NodeList,
}

impl LockClient {
    pub fn new(txn: Arc<TxnHandle>, cache: Option<Arc<RowCache>>) -> Self {
        Self {
            txn,
            cache,
            accesses: Vec::new(),
            involved: NodeList::new(),
            commit_nodes: NodeList::new(),
        }
    }

    /// Cache hint attached to access `idx`.
    pub fn hint(&self, idx: usize) -> Option<CacheHint> {
        self.accesses.get(idx).map(|a| a.hint)
    }

    fn pending_on(&self, node: NodeId) -> SmallVec<[usize; 8]> {
        accesses_on(&self.accesses, node, |a| a.req.node)
            .filter(|&i| self.accesses[i].sent && !self.accesses[i].received)
            .collect()
    }

    fn absorb_hint(&self, idx: usize, input: &mut WireReader<'_>, rng: &mut StdRng) -> Result<()> {
        let access = &self.accesses[idx];
        let (index, key) = (access.req.index, access.req.key);
        match access.hint {
            CacheHint::None => {}
            CacheHint::Admit => {
                let handle = RowHandle::new(input.get_u64()?);
                if let Some(cache) = &self.cache {
                    cache.add(index, key, handle, rng);
                }
            }
            CacheHint::Cached(old) => {
                if input.get_bool()? {
                    let handle = RowHandle::new(input.get_u64()?);
                    if let Some(cache) = &self.cache {
                        cache.invalidate(index, key);
                        cache.add(index, key, handle, rng);
                    }
                    debug!(
                        target: "dmtxn.cc",
                        txn = %self.txn.id(),
                        key,
                        stale = %old,
                        fresh = %handle,
                        "cached_row_replaced"
                    );
                }
            }
        }
        Ok(())
    }
}

impl ClientConcurrency for LockClient {
    fn txn(&self) -> &Arc<TxnHandle> {
        &self.txn
    }

    fn register_access(&mut self, req: AccessRequest, rng: &mut StdRng) -> Result<usize> {
        if self
            .accesses
            .iter()
            .any(|a| a.req.key == req.key && a.req.table == req.table)
        {
            return Err(duplicate_access(req.key, req.table));
        }
        let node_pos = accesses_on(&self.accesses, req.node, |a| a.req.node).count() as u32;
        let hint = self
            .cache
            .as_ref()
            .map_or(CacheHint::None, |cache| cache.search(req.index, req.key, rng).into());
        push_unique(&mut self.involved, req.node);
        push_unique(&mut self.commit_nodes, req.node);
        trace!(
            target: "dmtxn.cc",
            txn = %self.txn.id(),
            node = req.node.get(),
            key = req.key,
            ty = %req.ty,
            hint = ?hint,
            "access_registered"
        );
        self.accesses.push(ClientAccess {
            req,
            node_pos,
            hint,
            sent: false,
            received: false,
            data: Vec::new(),
        });
        Ok(self.accesses.len() - 1)
    }

    fn access_count(&self) -> usize {
        self.accesses.len()
    }

    fn data(&self, idx: usize) -> Option<&[u8]> {
        self.accesses
            .get(idx)
            .filter(|a| a.received)
            .map(|a| a.data.as_slice())
    }

    fn data_mut(&mut self, idx: usize) -> Option<&mut Vec<u8>> {
        self.accesses
            .get_mut(idx)
            .filter(|a| a.received && a.req.ty.writes_data())
            .map(|a| &mut a.data)
    }

    fn nodes_involved(&self) -> NodeList {
        self.involved.clone()
    }

    fn commit_nodes(&self) -> &[NodeId] {
        &self.commit_nodes
    }

    fn clear_nodes_involved(&mut self) {
        self.involved.clear();
    }

    fn remove_commit_nodes(&mut self, aborted: &[NodeId]) {
        self.commit_nodes.retain(|node| !aborted.contains(node));
    }

    fn serialize(&mut self, node: NodeId, out: &mut WireWriter) -> Result<usize> {
        out.put_u64(self.txn.ts().get());
        let count_pos = out.len();
        out.put_u32(0);
        let mut count = 0;
        for access in self.accesses.iter_mut().filter(|a| a.req.node == node && !a.sent) {
            out.put_u8(access.req.ty.to_wire());
            out.put_u64(access.req.key);
            out.put_u32(access.req.index.get());
            out.put_u32(access.req.table.get());
            out.put_u64(access.hint.to_wire());
            access.sent = true;
            count += 1;
        }
        out.patch_u32(count_pos, count as u32);
        Ok(count)
    }

    fn deserialize(
        &mut self,
        node: NodeId,
        input: &mut WireReader<'_>,
        rng: &mut StdRng,
    ) -> Result<()> {
        let count = input.get_u32()? as usize;
        let pending = self.pending_on(node);
        if count != pending.len() {
            return Err(DmtxnError::protocol(format!(
                "{node} answered {count} accesses, {} outstanding",
                pending.len()
            )));
        }
        for idx in pending {
            self.absorb_hint(idx, input, rng)?;
            let data = input.get_bytes()?.to_vec();
            let access = &mut self.accesses[idx];
            access.data = data;
            access.received = true;
        }
        input.finish()?;
        Ok(())
    }

    fn serialize_commit(&self, node: NodeId, out: &mut WireWriter) -> usize {
        let count_pos = out.len();
        out.put_u32(0);
        let mut count = 0;
        for access in self
            .accesses
            .iter()
            .filter(|a| a.req.node == node && a.req.ty.writes_data() && a.received)
        {
            out.put_u32(access.node_pos);
            out.put_bytes(&access.data);
            count += 1;
        }
        out.patch_u32(count_pos, count as u32);
        count
    }

    fn cleanup(&mut self, outcome: Outcome) {
        if outcome.is_commit() {
            if let Some(cache) = &self.cache {
                for access in self.accesses.iter().filter(|a| a.req.ty == AccessType::Delete) {
                    cache.invalidate(access.req.index, access.req.key);
                }
            }
        }
        debug!(
            target: "dmtxn.cc",
            txn = %self.txn.id(),
            accesses = self.accesses.len(),
            commit = outcome.is_commit(),
            "client_cleanup"
        );
        self.accesses.clear();
        self.involved.clear();
        self.commit_nodes.clear();
    }
}

#[cfg(test)]
mod tests {
    use dmtxn_types::{IndexId, TableId};
    use rand::SeedableRng;

    use super::*;
    use crate::cache::CacheConfig;
    use crate::lock_manager::test_support::{node, txn};

    fn read(n: u32, key: u64) -> AccessRequest {
        AccessRequest::new(node(n), AccessType::Read, key, TableId::new(0), IndexId::new(0))
    }

    fn write(n: u32, key: u64) -> AccessRequest {
        AccessRequest::new(node(n), AccessType::Write, key, TableId::new(0), IndexId::new(0))
    }

    #[test]
    fn duplicate_key_in_same_table_is_rejected() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut client = LockClient::new(txn(1, 1), None);
        client.register_access(read(0, 5), &mut rng).unwrap();
        let err = client.register_access(write(1, 5), &mut rng).unwrap_err();
        assert!(matches!(err, DmtxnError::DuplicateAccess { key: 5, table: 0 }));
        assert!(err.is_protocol_violation());
    }

    #[test]
    fn serialize_groups_by_node_and_marks_sent() {
        let mut rng = StdRng::seed_from_u64(2);
        let mut client = LockClient::new(txn(1, 42), None);
        client.register_access(read(0, 1), &mut rng).unwrap();
        client.register_access(write(1, 2), &mut rng).unwrap();
        client.register_access(write(0, 3), &mut rng).unwrap();
        let nodes: Vec<u32> = client.nodes_involved().iter().map(|n| n.get()).collect();
        assert_eq!(nodes, vec![0, 1]);

        let mut out = WireWriter::new();
        assert_eq!(client.serialize(node(0), &mut out).unwrap(), 2);
        let bytes = out.into_inner();
        let mut r = WireReader::new(&bytes);
        assert_eq!(r.get_u64(), Ok(42));
        assert_eq!(r.get_u32(), Ok(2));
        assert_eq!(r.get_u8(), Ok(AccessType::Read.to_wire()));
        assert_eq!(r.get_u64(), Ok(1));

        let mut again = WireWriter::new();
        assert_eq!(client.serialize(node(0), &mut again).unwrap(), 0);
    }

    #[test]
    fn deserialize_checks_count_and_fills_data() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut client = LockClient::new(txn(1, 1), None);
        client.register_access(write(0, 9), &mut rng).unwrap();
        client.serialize(node(0), &mut WireWriter::new()).unwrap();

        let mut wrong = WireWriter::new();
        wrong.put_u32(2);
        let wrong = wrong.into_inner();
        assert!(client
            .deserialize(node(0), &mut WireReader::new(&wrong), &mut rng)
            .unwrap_err()
            .is_protocol_violation());

        let mut resp = WireWriter::new();
        resp.put_u32(1);
        resp.put_bytes(&7u64.to_le_bytes());
        let resp = resp.into_inner();
        client
            .deserialize(node(0), &mut WireReader::new(&resp), &mut rng)
            .unwrap();
        assert_eq!(client.data(0), Some(&7u64.to_le_bytes()[..]));
        client.data_mut(0).unwrap()[0] = 8;

        let mut commit = WireWriter::new();
        assert_eq!(client.serialize_commit(node(0), &mut commit), 1);
        assert_eq!(client.serialize_commit(node(1), &mut WireWriter::new()), 0);
    }

    #[test]
    fn admitted_handle_lands_in_cache() {
        let mut rng = StdRng::seed_from_u64(4);
        let cache = Arc::new(RowCache::new(CacheConfig::default().with_admission_rate(1.0)));
        let mut client = LockClient::new(txn(1, 1), Some(Arc::clone(&cache)));
        client.register_access(read(0, 3), &mut rng).unwrap();
        assert_eq!(client.hint(0), Some(CacheHint::Admit));
        client.serialize(node(0), &mut WireWriter::new()).unwrap();

        let mut resp = WireWriter::new();
        resp.put_u32(1);
        resp.put_u64(17);
        resp.put_bytes(&[0; 8]);
        let resp = resp.into_inner();
        client
            .deserialize(node(0), &mut WireReader::new(&resp), &mut rng)
            .unwrap();
        client.cleanup(Outcome::Commit);

        let mut next = LockClient::new(txn(1, 2), Some(cache));
        next.register_access(read(0, 3), &mut rng).unwrap();
        assert_eq!(next.hint(0), Some(CacheHint::Cached(RowHandle::new(17))));
    }

    #[test]
    fn aborted_nodes_leave_the_commit_set() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut client = LockClient::new(txn(1, 1), None);
        client.register_access(read(0, 1), &mut rng).unwrap();
        client.register_access(read(1, 2), &mut rng).unwrap();
        client.clear_nodes_involved();
        assert!(client.nodes_involved().is_empty());
        client.remove_commit_nodes(&[node(1)]);
        assert_eq!(client.commit_nodes(), &[node(0)]);
    }
}
