//! Partitioned index manager, compute side.

use std::sync::Arc;

use dmtxn_error::{DmtxnError, Result};
use dmtxn_types::{AccessType, NodeId, Outcome, TxnHandle, WireReader, WireWriter};
use rand::rngs::StdRng;
use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::cache::{CacheOp, EntryCache};
use crate::contract::{
    AccessRequest, ClientConcurrency, NodeList, accesses_on, duplicate_access, push_unique,
};

#[derive(Debug)]
struct IndexAccess {
    req: AccessRequest,
    op: CacheOp,
    sent: bool,
    received: bool,
    value: Option<u64>,
}

#[derive(Debug)]
pub struct IndexClient {
    txn: Arc<TxnHandle>,
    cache: Option<Arc<EntryCache>>,
    accesses: Vec<IndexAccess>,
    involved: NodeList,
    commit_nodes: NodeList,
}

impl IndexClient {
    pub fn new(txn: Arc<TxnHandle>, cache: Option<Arc<EntryCache>>) -> Self {
        Self {
            txn,
            cache,
            accesses: Vec::new(),
            involved: NodeList::new(),
            commit_nodes: NodeList::new(),
        }
    }

    /// Cache decision taken for access `idx`.
    pub fn cache_op(&self, idx: usize) -> Option<CacheOp> {
        self.accesses.get(idx).map(|a| a.op)
    }

    fn consult_cache(&self, req: &AccessRequest, rng: &mut StdRng) -> CacheOp {
        let Some(cache) = &self.cache else {
            return CacheOp::Rpc;
        };
        let value = req.value.unwrap_or(0);
        match req.ty {
            AccessType::Read | AccessType::Scan => cache.lookup(req.node, req.index, req.key, rng),
            AccessType::Write => cache.update(req.node, req.index, req.key, value, rng),
            AccessType::Insert => cache.insert(req.node, req.index, req.key, value, rng),
            AccessType::Delete => cache.remove(req.index, req.key),
        }
    }
}

impl ClientConcurrency for IndexClient {
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
        let op = self.consult_cache(&req, rng);
        let local = match op {
            CacheOp::Hit { value } => Some(value),
            _ => None,
        };
        if local.is_none() {
            push_unique(&mut self.involved, req.node);
            push_unique(&mut self.commit_nodes, req.node);
        }
        trace!(
            target: "dmtxn.cc",
            txn = %self.txn.id(),
            node = req.node.get(),
            key = req.key,
            ty = %req.ty,
            op = op.wire_tag(),
            "access_registered"
        );
        self.accesses.push(IndexAccess {
            req,
            op,
            sent: local.is_some(),
            received: local.is_some(),
            value: local,
        });
        Ok(self.accesses.len() - 1)
    }

    fn access_count(&self) -> usize {
        self.accesses.len()
    }

    fn value(&self, idx: usize) -> Option<u64> {
        self.accesses
            .get(idx)
            .filter(|a| a.received)
            .and_then(|a| a.value)
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
        let count_pos = out.len();
        out.put_u32(0);
        let mut count = 0;
        for access in self.accesses.iter_mut().filter(|a| a.req.node == node && !a.sent) {
            let req = access.req;
            out.put_u8(access.op.wire_tag());
            out.put_u8(req.ty.to_wire());
            out.put_u64(req.key);
            out.put_u32(req.index.get());
            out.put_u32(req.table.get());
            out.put_u64(req.value.unwrap_or(0));
            if let CacheOp::AdmitEvict { index, key, value } = access.op {
                out.put_u32(index.get());
                out.put_u64(key);
                out.put_u64(value);
            }
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
        _rng: &mut StdRng,
    ) -> Result<()> {
        let count = input.get_u32()? as usize;
        let pending: SmallVec<[usize; 8]> = accesses_on(&self.accesses, node, |a| a.req.node)
            .filter(|&i| self.accesses[i].sent && !self.accesses[i].received)
            .collect();
        if count != pending.len() {
            return Err(DmtxnError::protocol(format!(
                "{node} answered {count} index operations, {} outstanding",
                pending.len()
            )));
        }
        for idx in pending {
            let found = input.get_bool()?;
            let value = input.get_u64()?;
            let access = &mut self.accesses[idx];
            access.value = found.then_some(value);
            access.received = true;
            if access.op.is_admission() {
                if let Some(cache) = &self.cache {
                    if found && access.req.ty != AccessType::Delete {
                        cache.add(node, access.req.index, access.req.key, value);
                    } else {
                        cache.cancel_reservation();
                    }
                }
            }
        }
        input.finish()?;
        Ok(())
    }

    fn serialize_commit(&self, _node: NodeId, out: &mut WireWriter) -> usize {
        out.put_u32(0);
        0
    }

    fn cleanup(&mut self, outcome: Outcome) {
        if let Some(cache) = &self.cache {
            for access in self
                .accesses
                .iter()
                .filter(|a| a.op.is_admission() && !a.received)
            {
                trace!(target: "dmtxn.cc", key = access.req.key, "admission_cancelled");
                cache.cancel_reservation();
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
