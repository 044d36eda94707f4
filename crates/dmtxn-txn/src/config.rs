//! Engine configuration.
//!
//! [`EngineConfig`] is the single root: cluster shape, transport flavor,
//! lock protocol, batching, caches and the key/value workload. Every field
//! has a default, so a JSON file only names what it changes. Times are in
//! clock cycles (nanoseconds with the default clock).

use std::path::Path;

use dmtxn_batch::BatchingConfig;
use dmtxn_cc::{CacheConfig, LockProtocol};
use dmtxn_error::{DmtxnError, Result};
use serde::{Deserialize, Serialize};

/// How compute threads reach storage nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Requests are shipped to the owning node, which locks and replies.
    #[default]
    TwoSided,
    /// Threads lock, read and write node memory directly.
    OneSided,
}

/// Key/value workload knobs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KvConfig {
    /// Keys `0..num_keys` in table 0, spread over nodes by `key % nodes`.
    pub num_keys: u64,
    /// Distinct keys per transaction (at least 2).
    pub requests_per_txn: usize,
    /// Probability that a transaction only reads.
    pub read_ratio: f64,
    /// Keys `0..hot_keys` draw `hot_ratio` of all accesses.
    pub hot_keys: u64,
    pub hot_ratio: f64,
    /// Balance every key starts with.
    pub initial_balance: u64,
    /// Upper bound of one transfer.
    pub max_transfer: u64,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            num_keys: 1024,
            requests_per_txn: 2,
            read_ratio: 0.5,
            hot_keys: 16,
            hot_ratio: 0.2,
            initial_balance: 1_000,
            max_transfer: 10,
        }
    }
}

impl KvConfig {
    pub fn validate(&self) -> Result<()> {
        if self.requests_per_txn < 2 {
            return Err(DmtxnError::invalid_config(
                "workload.requests_per_txn",
                "must be at least 2",
            ));
        }
        if self.num_keys < self.requests_per_txn as u64 {
            return Err(DmtxnError::invalid_config(
                "workload.num_keys",
                format!("must cover {} distinct keys per transaction", self.requests_per_txn),
            ));
        }
        if self.hot_keys > self.num_keys {
            return Err(DmtxnError::invalid_config(
                "workload.hot_keys",
                "must not exceed num_keys",
            ));
        }
        for (field, rate) in [
            ("workload.read_ratio", self.read_ratio),
            ("workload.hot_ratio", self.hot_ratio),
        ] {
            if !(0.0..=1.0).contains(&rate) {
                return Err(DmtxnError::invalid_config(field, "must be within [0, 1]"));
            }
        }
        Ok(())
    }
}

/// Root configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub num_server_nodes: u32,
    pub num_client_threads: u32,
    /// Upper bound accepted for `num_client_threads`.
    pub max_client_threads: u32,
    pub rows_per_node: usize,
    /// Bytes per tuple; balances live in the first eight.
    pub tuple_size: usize,
    pub transport: TransportKind,
    /// Index-only concurrency control: every access is one index operation.
    pub partitioned: bool,
    pub protocol: LockProtocol,
    pub batching: BatchingConfig,
    pub cache: CacheConfig,
    /// Bound on one-sided lock spins and on a parked two-sided request.
    pub lock_wait_timeout_cycles: u64,
    /// Backoff per consecutive abort of the same transaction.
    pub abort_backoff_cycles: u64,
    /// Transactions each worker commits before the run ends.
    pub txns_per_thread: u64,
    pub seed: u64,
    pub workload: KvConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            num_server_nodes: 2,
            num_client_threads: 4,
            max_client_threads: 256,
            rows_per_node: 4096,
            tuple_size: 8,
            transport: TransportKind::TwoSided,
            partitioned: false,
            protocol: LockProtocol::NoWait,
            batching: BatchingConfig::default(),
            cache: CacheConfig::disabled(),
            lock_wait_timeout_cycles: 5_000_000,
            abort_backoff_cycles: 1_000,
            txns_per_thread: 100,
            seed: 42,
            workload: KvConfig::default(),
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub const fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = transport;
        self
    }

    #[must_use]
    pub const fn with_protocol(mut self, protocol: LockProtocol) -> Self {
        self.protocol = protocol;
        self
    }

    #[must_use]
    pub const fn with_partitioned(mut self, partitioned: bool) -> Self {
        self.partitioned = partitioned;
        self
    }

    #[must_use]
    pub const fn with_threads(mut self, threads: u32) -> Self {
        self.num_client_threads = threads;
        self
    }

    #[must_use]
    pub const fn with_txns_per_thread(mut self, txns: u64) -> Self {
        self.txns_per_thread = txns;
        self
    }

    #[must_use]
    pub fn with_batching(mut self, batching: BatchingConfig) -> Self {
        self.batching = batching;
        self
    }

    #[must_use]
    pub const fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let cfg: Self =
            serde_json::from_str(json).map_err(|err| DmtxnError::ConfigParse(err.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Read, parse and validate a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| DmtxnError::ConfigIo {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    pub fn to_pretty_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|err| DmtxnError::ConfigParse(err.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_server_nodes == 0 {
            return Err(DmtxnError::invalid_config(
                "num_server_nodes",
                "must be at least 1",
            ));
        }
        if self.num_client_threads == 0 || self.num_client_threads > self.max_client_threads {
            return Err(DmtxnError::invalid_config(
                "num_client_threads",
                format!("must be within 1..={}", self.max_client_threads),
            ));
        }
        if self.tuple_size < 8 {
            return Err(DmtxnError::invalid_config(
                "tuple_size",
                "must hold an 8-byte balance",
            ));
        }
        let per_node = self
            .workload
            .num_keys
            .div_ceil(u64::from(self.num_server_nodes));
        if !self.partitioned && per_node > self.rows_per_node as u64 {
            return Err(DmtxnError::invalid_config(
                "rows_per_node",
                format!("{} rows cannot hold {per_node} keys per node", self.rows_per_node),
            ));
        }
        if self.partitioned && self.transport == TransportKind::OneSided {
            return Err(DmtxnError::invalid_config(
                "partitioned",
                "index-only concurrency control needs the two-sided transport",
            ));
        }
        self.batching.validate()?;
        self.cache.validate()?;
        self.workload.validate()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_validate() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg = EngineConfig::from_json_str(
            r#"{
                "num_server_nodes": 3,
                "transport": "one_sided",
                "protocol": "wound_wait",
                "batching": { "group_size": 4 },
                "workload": { "num_keys": 300 }
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.num_server_nodes, 3);
        assert_eq!(cfg.transport, TransportKind::OneSided);
        assert_eq!(cfg.protocol, LockProtocol::WoundWait);
        assert_eq!(cfg.batching.group_size, 4);
        assert_eq!(cfg.batching.leader_wait_time, 10_000);
        assert_eq!(cfg.workload.num_keys, 300);
        assert_eq!(cfg.workload.requests_per_txn, 2);
    }

    #[test]
    fn json_round_trips_through_pretty_printer() {
        let cfg = EngineConfig::default()
            .with_protocol(LockProtocol::WaitDie)
            .with_threads(8);
        let text = cfg.to_pretty_json().unwrap();
        assert_eq!(EngineConfig::from_json_str(&text).unwrap(), cfg);
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        let err = EngineConfig::from_json_str("{ \"num_server_nodes\": \"two\" }").unwrap_err();
        assert!(matches!(err, DmtxnError::ConfigParse(_)));
    }

    #[test]
    fn invalid_values_name_their_field() {
        let cases = [
            EngineConfig::default().with_threads(0),
            EngineConfig {
                tuple_size: 4,
                ..EngineConfig::default()
            },
            EngineConfig {
                rows_per_node: 8,
                ..EngineConfig::default()
            },
            EngineConfig::default()
                .with_partitioned(true)
                .with_transport(TransportKind::OneSided),
        ];
        let fields: Vec<&str> = cases
            .iter()
            .map(|cfg| match cfg.validate().unwrap_err() {
                DmtxnError::InvalidConfig { field, .. } => field,
                other => panic!("unexpected error {other}"),
            })
            .collect();
        assert_eq!(
            fields,
            ["num_client_threads", "tuple_size", "rows_per_node", "partitioned"]
        );
    }

    #[test]
    fn file_loading_reports_missing_path() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.json");
        let err = EngineConfig::from_json_file(&missing).unwrap_err();
        assert!(matches!(err, DmtxnError::ConfigIo { ref path, .. } if *path == missing));

        let path = dir.path().join("engine.json");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "{{ \"partitioned\": true, \"seed\": 7 }}").unwrap();
        let cfg = EngineConfig::from_json_file(&path).unwrap();
        assert!(cfg.partitioned);
        assert_eq!(cfg.seed, 7);
    }

    #[test]
    fn workload_bounds() {
        let mut kv = KvConfig {
            requests_per_txn: 1,
            ..KvConfig::default()
        };
        assert!(kv.validate().is_err());
        kv = KvConfig {
            read_ratio: 1.5,
            ..KvConfig::default()
        };
        assert!(kv.validate().is_err());
        kv = KvConfig {
            hot_keys: 2048,
            ..KvConfig::default()
        };
        assert!(kv.validate().is_err());
    }
}
