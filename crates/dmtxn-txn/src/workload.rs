//! Synthetic key/value workload.
//!
//! Every key of table 0 holds a balance in the first eight bytes of its
//! tuple. A write transaction moves a random amount between its first two
//! keys, so the sum over all keys never changes; a read-only transaction
//! only reads. In partitioned mode tuples do not exist and writes store a
//! random payload in the index entry instead, tagged with its key in the
//! upper half so a misplaced value can be traced.

use std::fmt;

use dmtxn_cc::{AccessRequest, ClusterMemory, Schema};
use dmtxn_error::{DmtxnError, Result};
use dmtxn_types::{AccessType, IndexId, Key, NodeId, TableId, Value};
use rand::Rng;
use rand::rngs::StdRng;
use smallvec::SmallVec;
use tracing::info;

use crate::config::KvConfig;
use crate::txn::ClientTxn;

pub const KV_TABLE: TableId = TableId::new(0);
pub const KV_INDEX: IndexId = Schema::primary_index(KV_TABLE);

/// Source of transactions and owner of the data placement.
pub trait Workload: Send + Sync + fmt::Debug {
    /// Node holding `key` of `table`.
    fn partition(&self, key: Key, table: TableId) -> NodeId;

    /// Initial load.
    fn populate(&self, memory: &ClusterMemory) -> Result<()>;

    fn next_query(&self, rng: &mut StdRng) -> Query;
}

/// One transaction's accesses plus the update it applies to them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub requests: SmallVec<[AccessRequest; 4]>,
    /// Amount moved from access 0 to access 1.
    pub transfer: Option<u64>,
}

impl Query {
    pub fn is_read_only(&self) -> bool {
        self.requests.iter().all(|r| !r.ty.writes_data())
    }

    /// Move the transfer amount once both rows are fetched. A short
    /// balance turns the transfer into a no-op.
    pub fn apply(&self, txn: &mut ClientTxn<'_>) -> Result<()> {
        let Some(amount) = self.transfer else {
            return Ok(());
        };
        let from = balance(txn.data(0))?;
        let to = balance(txn.data(1))?;
        if from < amount {
            return Ok(());
        }
        put_balance(txn.data_mut(0), from - amount)?;
        put_balance(txn.data_mut(1), to + amount)
    }
}

/// Balance stored in a tuple.
pub fn balance(tuple: Option<&[u8]>) -> Result<u64> {
    tuple
        .and_then(|t| t.get(..8))
        .and_then(|b| b.try_into().ok())
        .map(u64::from_le_bytes)
        .ok_or_else(|| DmtxnError::protocol("tuple too short for a balance"))
}

fn put_balance(tuple: Option<&mut Vec<u8>>, value: u64) -> Result<()> {
    let slot = tuple
        .and_then(|t| t.get_mut(..8))
        .ok_or_else(|| DmtxnError::protocol("write access has no tuple"))?;
    slot.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

// ---------------------------------------------------------------------------
// KvWorkload
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct KvWorkload {
    cfg: KvConfig,
    nodes: Vec<NodeId>,
    tuple_size: usize,
    partitioned: bool,
}

impl KvWorkload {
    pub fn new(cfg: KvConfig, num_nodes: u32, tuple_size: usize, partitioned: bool) -> Result<Self> {
        cfg.validate()?;
        if num_nodes == 0 {
            return Err(DmtxnError::invalid_config("num_server_nodes", "must be at least 1"));
        }
        Ok(Self {
            cfg,
            nodes: NodeId::all(num_nodes).collect(),
            tuple_size,
            partitioned,
        })
    }

    pub fn config(&self) -> &KvConfig {
        &self.cfg
    }

    /// Sum of the balances of every key; constant under committed transfers.
    pub fn total_balance(&self, memory: &ClusterMemory) -> Result<u64> {
        let mut total = 0u64;
        for key in 0..self.cfg.num_keys {
            let storage = memory.node(self.partition(key, KV_TABLE))?;
            total += match storage.index(KV_INDEX)?.lookup(key) {
                Some(Value::Row(handle)) => balance(Some(storage.rows().read(handle)?.as_slice()))?,
                Some(Value::Raw(value)) => value,
                Some(Value::RemoteAddr(_)) | None => {
                    return Err(DmtxnError::protocol(format!("key {key} lost its row")));
                }
            };
        }
        Ok(total)
    }

    /// Whether `value` is the initial balance or a payload written for `key`.
    pub fn payload_belongs_to(&self, key: Key, value: u64) -> bool {
        value == self.cfg.initial_balance || value >> 32 == key + 1
    }

    fn draw_key(&self, rng: &mut StdRng, uniform: bool) -> Key {
        let hot = !uniform && self.cfg.hot_keys > 0 && rng.gen_bool(self.cfg.hot_ratio);
        let range = if hot { self.cfg.hot_keys } else { self.cfg.num_keys };
        rng.gen_range(0..range)
    }
}

impl Workload for KvWorkload {
    fn partition(&self, key: Key, _table: TableId) -> NodeId {
        self.nodes[(key % self.nodes.len() as u64) as usize]
    }

    fn populate(&self, memory: &ClusterMemory) -> Result<()> {
        let mut tuple = vec![0u8; self.tuple_size.max(8)];
        tuple[..8].copy_from_slice(&self.cfg.initial_balance.to_le_bytes());
        for key in 0..self.cfg.num_keys {
            let storage = memory.node(self.partition(key, KV_TABLE))?;
            if self.partitioned {
                storage.load_entry(KV_INDEX, key, self.cfg.initial_balance)?;
            } else {
                storage.load_row(KV_TABLE, key, &tuple)?;
            }
        }
        info!(
            target: "dmtxn.txn",
            keys = self.cfg.num_keys,
            nodes = self.nodes.len(),
            partitioned = self.partitioned,
            "kv_workload_loaded"
        );
        Ok(())
    }

    fn next_query(&self, rng: &mut StdRng) -> Query {
        let read_only = rng.gen_bool(self.cfg.read_ratio);
        let count = self.cfg.requests_per_txn;
        let mut keys: SmallVec<[Key; 4]> = SmallVec::with_capacity(count);
        let mut uniform = false;
        while keys.len() < count {
            let key = self.draw_key(rng, uniform);
            if keys.contains(&key) {
                // The hot set may be smaller than one transaction.
                uniform = true;
                continue;
            }
            keys.push(key);
        }

        let requests = keys
            .iter()
            .enumerate()
            .map(|(pos, &key)| {
                let ty = if !read_only && pos < 2 {
                    AccessType::Write
                } else {
                    AccessType::Read
                };
                let req = AccessRequest::new(self.partition(key, KV_TABLE), ty, key, KV_TABLE, KV_INDEX);
                if self.partitioned && ty == AccessType::Write {
                    req.with_value(((key + 1) << 32) | u64::from(rng.r#gen::<u32>()))
                } else {
                    req
                }
            })
            .collect();
        let transfer = (!read_only && !self.partitioned)
            .then(|| rng.gen_range(0..=self.cfg.max_transfer));
        Query { requests, transfer }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use proptest::prelude::*;
    use rand::SeedableRng;

    use super::*;

    fn workload(cfg: KvConfig, partitioned: bool) -> KvWorkload {
        KvWorkload::new(cfg, 3, 16, partitioned).unwrap()
    }

    #[test]
    fn keys_are_placed_round_robin() {
        let w = workload(KvConfig::default(), false);
        assert_eq!(w.partition(0, KV_TABLE).get(), 0);
        assert_eq!(w.partition(4, KV_TABLE).get(), 1);
        assert_eq!(w.partition(8, KV_TABLE).get(), 2);
    }

    #[test]
    fn populate_loads_every_key() {
        let cfg = KvConfig {
            num_keys: 30,
            ..KvConfig::default()
        };
        let w = workload(cfg, false);
        let memory = ClusterMemory::new(3, &Arc::new(Schema::single_table(16)), 16);
        w.populate(&memory).unwrap();
        assert_eq!(w.total_balance(&memory).unwrap(), 30 * cfg.initial_balance);
        assert!(memory.nodes().iter().all(|n| n.rows().live_rows() == 10));
    }

    #[test]
    fn partitioned_populate_fills_the_index() {
        let cfg = KvConfig {
            num_keys: 9,
            ..KvConfig::default()
        };
        let w = workload(cfg, true);
        let memory = ClusterMemory::new(3, &Arc::new(Schema::single_table(16)), 4);
        w.populate(&memory).unwrap();
        assert_eq!(w.total_balance(&memory).unwrap(), 9 * cfg.initial_balance);
        assert!(memory.nodes().iter().all(|n| n.rows().live_rows() == 0));
    }

    #[test]
    fn read_ratio_one_never_writes() {
        let cfg = KvConfig {
            read_ratio: 1.0,
            ..KvConfig::default()
        };
        let w = workload(cfg, false);
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            let q = w.next_query(&mut rng);
            assert!(q.is_read_only());
            assert_eq!(q.transfer, None);
        }
    }

    #[test]
    fn fully_hot_small_set_still_terminates() {
        let cfg = KvConfig {
            requests_per_txn: 4,
            hot_keys: 2,
            hot_ratio: 1.0,
            ..KvConfig::default()
        };
        let w = workload(cfg, false);
        let mut rng = StdRng::seed_from_u64(3);
        assert_eq!(w.next_query(&mut rng).requests.len(), 4);
    }

    #[test]
    fn partitioned_writes_carry_values_and_no_transfer() {
        let cfg = KvConfig {
            read_ratio: 0.0,
            ..KvConfig::default()
        };
        let w = workload(cfg, true);
        let mut rng = StdRng::seed_from_u64(11);
        let q = w.next_query(&mut rng);
        assert_eq!(q.transfer, None);
        for r in &q.requests[..2] {
            let value = r.value.unwrap();
            assert!(w.payload_belongs_to(r.key, value));
            assert!(!w.payload_belongs_to(r.key + 1, value));
        }
    }

    proptest! {
        #[test]
        fn queries_have_distinct_keys_on_their_owner(seed in any::<u64>(), count in 2usize..6) {
            let cfg = KvConfig { requests_per_txn: count, num_keys: 64, ..KvConfig::default() };
            let w = workload(cfg, false);
            let mut rng = StdRng::seed_from_u64(seed);
            let q = w.next_query(&mut rng);
            prop_assert_eq!(q.requests.len(), count);
            for (i, r) in q.requests.iter().enumerate() {
                prop_assert!(r.key < 64);
                prop_assert_eq!(r.node, w.partition(r.key, KV_TABLE));
                prop_assert!(q.requests[..i].iter().all(|o| o.key != r.key));
            }
            if let Some(amount) = q.transfer {
                prop_assert!(amount <= cfg.max_transfer);
                prop_assert!(q.requests[0].ty.writes_data() && q.requests[1].ty.writes_data());
            }
        }
    }
}
