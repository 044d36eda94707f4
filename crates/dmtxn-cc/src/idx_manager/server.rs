//! Partitioned index manager, memory-node side.

use std::sync::Arc;

use dmtxn_error::Result;
use dmtxn_types::{
    AccessType, CodecError, IndexId, Key, Outcome, TxnHandle, Value, WireReader, WireWriter,
};
use tracing::debug;

use crate::contract::ServerConcurrency;
use crate::index::{DeleteOp, InsertOp, commit_insdel};
use crate::row_lock::LockGrant;
use crate::storage::NodeStorage;

const TAG_ADMIT_EVICT: u8 = 2;
const MAX_OP_TAG: u8 = 3;

#[derive(Debug, Clone, Copy)]
struct IndexOp {
    ty: AccessType,
    key: Key,
    index: IndexId,
    value: u64,
}

/// Executes index operations; inserts and deletes land at commit.
#[derive(Debug)]
pub struct IndexServer {
    txn: Arc<TxnHandle>,
    storage: Arc<NodeStorage>,
    ops: Vec<IndexOp>,
    results: Vec<Option<u64>>,
    responded: usize,
    inserts: Vec<InsertOp>,
    deletes: Vec<DeleteOp>,
    finished: bool,
}

impl IndexServer {
    pub fn new(txn: Arc<TxnHandle>, storage: Arc<NodeStorage>) -> Self {
        Self {
            txn,
            storage,
            ops: Vec::new(),
            results: Vec::new(),
            responded: 0,
            inserts: Vec::new(),
            deletes: Vec::new(),
            finished: false,
        }
    }

    /// Apply a dirty cache victim. A key deleted meanwhile stays deleted.
    fn write_back(&self, index: IndexId, key: Key, value: u64) -> Result<()> {
        let applied = self.storage.index(index)?.update(key, Value::Raw(value));
        if !applied {
            debug!(
                target: "dmtxn.cc",
                node = self.storage.node().get(),
                key,
                "write_back_dropped"
            );
        }
        Ok(())
    }

    fn execute(&mut self, op: IndexOp) -> Result<Option<u64>> {
        let index = self.storage.index(op.index)?;
        let result = match op.ty {
            AccessType::Read | AccessType::Scan => index.lookup(op.key).map(Value::raw),
            AccessType::Write => index
                .update(op.key, Value::Raw(op.value))
                .then_some(op.value),
            AccessType::Insert => {
                let absent = index.lookup(op.key).is_none();
                self.inserts.push(InsertOp {
                    index: op.index,
                    key: op.key,
                    value: Value::Raw(op.value),
                });
                absent.then_some(op.value)
            }
            AccessType::Delete => {
                self.deletes.push(DeleteOp {
                    index: op.index,
                    key: op.key,
                });
                index.lookup(op.key).map(Value::raw)
            }
        };
        Ok(result)
    }
}

impl ServerConcurrency for IndexServer {
    fn txn(&self) -> &Arc<TxnHandle> {
        &self.txn
    }

    fn parse_request(&mut self, input: &mut WireReader<'_>) -> Result<()> {
        let count = input.get_u32()?;
        for _ in 0..count {
            let tag = input.get_u8()?;
            if tag > MAX_OP_TAG {
                return Err(CodecError::InvalidTag {
                    what: "cache op",
                    tag,
                }
                .into());
            }
            let ty = AccessType::from_wire(input.get_u8()?)?;
            let key = input.get_u64()?;
            let index = IndexId::new(input.get_u32()?);
            let _table = input.get_u32()?;
            let value = input.get_u64()?;
            if tag == TAG_ADMIT_EVICT {
                let evict_index = IndexId::new(input.get_u32()?);
                let evict_key = input.get_u64()?;
                let evict_value = input.get_u64()?;
                self.write_back(evict_index, evict_key, evict_value)?;
            }
            self.ops.push(IndexOp {
                ty,
                key,
                index,
                value,
            });
        }
        input.finish()?;
        Ok(())
    }

    fn process_request(&mut self) -> Result<LockGrant> {
        while self.results.len() < self.ops.len() {
            let op = self.ops[self.results.len()];
            let result = self.execute(op)?;
            self.results.push(result);
        }
        Ok(LockGrant::Acquired)
    }

    fn get_resp_data(&mut self, out: &mut WireWriter) -> Result<()> {
        out.put_u32((self.results.len() - self.responded) as u32);
        for result in &self.results[self.responded..] {
            out.put_bool(result.is_some());
            out.put_u64(result.unwrap_or(0));
        }
        self.responded = self.results.len();
        Ok(())
    }

    fn process_prepare(&mut self, _input: &mut WireReader<'_>) -> Result<()> {
        Ok(())
    }

    fn process_commit(&mut self, _input: &mut WireReader<'_>) -> Result<()> {
        self.cleanup(Outcome::Commit)
    }

    fn cleanup(&mut self, outcome: Outcome) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        if outcome.is_commit() {
            commit_insdel(self.storage.indexes(), &self.inserts, &self.deletes)?;
        }
        debug!(
            target: "dmtxn.cc",
            node = self.storage.node().get(),
            txn = %self.txn.id(),
            ops = self.ops.len(),
            commit = outcome.is_commit(),
            "server_cleanup"
        );
        self.inserts.clear();
        self.deletes.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use dmtxn_types::{NodeId, TableId, ThreadId, Timestamp, TxnId};
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;
    use crate::contract::{AccessRequest, ClientConcurrency};
    use crate::idx_manager::IndexClient;
    use crate::storage::Schema;

    const I0: IndexId = IndexId::new(0);

    fn node0() -> NodeId {
        NodeId::new(0).unwrap()
    }

    fn storage() -> Arc<NodeStorage> {
        let storage = Arc::new(NodeStorage::new(node0(), Arc::new(Schema::single_table(8)), 8));
        for key in 0..4 {
            storage.load_entry(I0, key, key * 10).unwrap();
        }
        storage
    }

    fn handle() -> Arc<TxnHandle> {
        Arc::new(TxnHandle::new(TxnId::new(0, ThreadId::new(3)), Timestamp::UNSET))
    }

    fn run(client: &mut IndexClient, server: &mut IndexServer, rng: &mut StdRng) {
        let mut out = WireWriter::new();
        client.serialize(node0(), &mut out).unwrap();
        let bytes = out.into_inner();
        server.parse_request(&mut WireReader::new(&bytes)).unwrap();
        assert_eq!(server.process_request().unwrap(), LockGrant::Acquired);
        let mut resp = WireWriter::new();
        server.get_resp_data(&mut resp).unwrap();
        let resp = resp.into_inner();
        client
            .deserialize(node0(), &mut WireReader::new(&resp), rng)
            .unwrap();
    }

    fn req(ty: AccessType, key: u64) -> AccessRequest {
        AccessRequest::new(node0(), ty, key, TableId::new(0), I0)
    }

    #[test]
    fn operations_execute_and_structural_changes_wait_for_commit() {
        let storage = storage();
        let mut rng = StdRng::seed_from_u64(1);
        let mut client = IndexClient::new(handle(), None);
        client.register_access(req(AccessType::Read, 1), &mut rng).unwrap();
        client
            .register_access(req(AccessType::Write, 2).with_value(99), &mut rng)
            .unwrap();
        client
            .register_access(req(AccessType::Insert, 50).with_value(5), &mut rng)
            .unwrap();
        client.register_access(req(AccessType::Delete, 3), &mut rng).unwrap();
        client.register_access(req(AccessType::Read, 70), &mut rng).unwrap();

        let mut server = IndexServer::new(handle(), Arc::clone(&storage));
        run(&mut client, &mut server, &mut rng);
        assert_eq!(client.value(0), Some(10));
        assert_eq!(client.value(1), Some(99));
        assert_eq!(client.value(2), Some(5));
        assert_eq!(client.value(3), Some(30));
        assert_eq!(client.value(4), None);

        let index = storage.index(I0).unwrap();
        assert_eq!(index.lookup(2), Some(Value::Raw(99)), "writes apply at once");
        assert_eq!(index.lookup(50), None);
        assert!(index.lookup(3).is_some());

        server
            .process_commit(&mut WireReader::new(&[]))
            .unwrap();
        assert_eq!(index.lookup(50), Some(Value::Raw(5)));
        assert_eq!(index.lookup(3), None);
    }

    #[test]
    fn abort_discards_pending_inserts() {
        let storage = storage();
        let mut rng = StdRng::seed_from_u64(2);
        let mut client = IndexClient::new(handle(), None);
        client
            .register_access(req(AccessType::Insert, 60).with_value(6), &mut rng)
            .unwrap();
        let mut server = IndexServer::new(handle(), Arc::clone(&storage));
        run(&mut client, &mut server, &mut rng);
        server.cleanup(Outcome::Abort).unwrap();
        assert_eq!(storage.index(I0).unwrap().lookup(60), None);
    }

    #[test]
    fn unknown_op_tag_is_a_codec_error() {
        let mut w = WireWriter::new();
        w.put_u32(1);
        w.put_u8(9);
        let bytes = w.into_inner();
        let mut server = IndexServer::new(handle(), storage());
        let err = server.parse_request(&mut WireReader::new(&bytes)).unwrap_err();
        assert!(matches!(err, dmtxn_error::DmtxnError::Codec(_)));
    }

    #[test]
    fn write_to_absent_key_is_not_found() {
        let storage = storage();
        let mut rng = StdRng::seed_from_u64(3);
        let mut client = IndexClient::new(handle(), None);
        client
            .register_access(req(AccessType::Write, 70).with_value(7), &mut rng)
            .unwrap();
        let mut server = IndexServer::new(handle(), Arc::clone(&storage));
        run(&mut client, &mut server, &mut rng);
        assert_eq!(client.value(0), None);
        server.cleanup(Outcome::Commit).unwrap();
        assert_eq!(storage.index(I0).unwrap().lookup(70), None);
    }

    #[test]
    fn evicted_entry_updates_but_never_creates() {
        let storage = storage();
        let mut w = WireWriter::new();
        w.put_u32(2);
        for (key, evict_key) in [(0u64, 1u64), (0, 9)] {
            w.put_u8(TAG_ADMIT_EVICT);
            w.put_u8(AccessType::Read.to_wire());
            w.put_u64(key);
            w.put_u32(I0.get());
            w.put_u32(0);
            w.put_u64(0);
            w.put_u32(I0.get());
            w.put_u64(evict_key);
            w.put_u64(777);
        }
        let bytes = w.into_inner();
        let mut server = IndexServer::new(handle(), Arc::clone(&storage));
        server.parse_request(&mut WireReader::new(&bytes)).unwrap();
        let index = storage.index(I0).unwrap();
        assert_eq!(index.lookup(1), Some(Value::Raw(777)));
        assert_eq!(index.lookup(9), None);
    }
}
